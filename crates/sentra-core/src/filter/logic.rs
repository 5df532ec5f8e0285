//! Compiled predicate tree. Compilation happens once at construction;
//! evaluation walks the tree against a record, is pure, and never fails.

use crate::envelope::Record;
use crate::error::FilterError;
use crate::filter::model::RuleSet;
use crate::filter::parser::{parse_rule_field, RuleField, RuleOp};
use serde_yaml::Value;

/// A node of the compiled rule tree.
#[derive(Debug)]
pub enum Predicate {
    StartsWith { field: String, operand: String },
    EndsWith { field: String, operand: String },
    Contains { field: String, operand: String },
    Equals { field: String, operand: String },
    AllOf(Vec<Predicate>),
    AnyOf(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eval(&self, record: &Record) -> bool {
        match self {
            Predicate::StartsWith { field, operand } => record
                .field(field)
                .is_some_and(|value| value.starts_with(operand.as_str())),
            Predicate::EndsWith { field, operand } => record
                .field(field)
                .is_some_and(|value| value.ends_with(operand.as_str())),
            Predicate::Contains { field, operand } => record
                .field(field)
                .is_some_and(|value| value.contains(operand.as_str())),
            Predicate::Equals { field, operand } => record
                .field(field)
                .is_some_and(|value| value.as_ref() == operand),
            Predicate::AllOf(children) => children.iter().all(|child| child.eval(record)),
            Predicate::AnyOf(children) => children.iter().any(|child| child.eval(record)),
            Predicate::Not(inner) => !inner.eval(record),
        }
    }
}

/// Compile one `key: value` rule entry. A scalar operand yields a single
/// leaf; a sequence yields one leaf per value, reduced with AND under
/// `|all` and OR otherwise.
pub fn compile_rule(key: &str, value: &Value) -> Result<Predicate, FilterError> {
    let rule = parse_rule_field(key)?;
    let leaves: Vec<Predicate> = operand_strings(key, value)?
        .into_iter()
        .map(|operand| leaf(&rule, operand))
        .collect();
    Ok(if rule.all {
        Predicate::AllOf(leaves)
    } else {
        Predicate::AnyOf(leaves)
    })
}

/// Compile every rule of a selection. The caller decides the reduction.
pub fn compile_rule_set(rules: &RuleSet) -> Result<Vec<Predicate>, FilterError> {
    rules
        .iter()
        .map(|(key, value)| compile_rule(key, value))
        .collect()
}

fn leaf(rule: &RuleField, operand: String) -> Predicate {
    let field = rule.field.clone();
    match rule.op {
        RuleOp::StartsWith => Predicate::StartsWith { field, operand },
        RuleOp::EndsWith => Predicate::EndsWith { field, operand },
        RuleOp::Contains => Predicate::Contains { field, operand },
        RuleOp::Equals => Predicate::Equals { field, operand },
    }
}

fn operand_strings(key: &str, value: &Value) -> Result<Vec<String>, FilterError> {
    match value {
        Value::Sequence(items) => items.iter().map(|item| scalar_string(key, item)).collect(),
        scalar => Ok(vec![scalar_string(key, scalar)?]),
    }
}

fn scalar_string(key: &str, value: &Value) -> Result<String, FilterError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(FilterError::InvalidValueKind {
            key: key.to_string(),
        }),
    }
}
