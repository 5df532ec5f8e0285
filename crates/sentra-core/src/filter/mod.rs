//! The filter rule engine: parses the YAML allow/deny DSL once at service
//! construction and evaluates the compiled tree against every record.
//!
//! A document has a `version`, an optional `allow` mapping, and an
//! optional `deny` mapping. Deny selections carry mandatory `condition`
//! rules and optional `exception` rules; a selection fires when its
//! condition holds and no exception does. Rule keys follow the grammar in
//! [`parser`]; a selection name starting with `!` negates the compiled
//! selection.

mod logic;
mod model;
mod parser;

pub use logic::Predicate;
pub use model::{DenySelection, FilterDocument, RuleSet};
pub use parser::{parse_rule_field, RuleField, RuleOp};

use crate::envelope::Record;
use crate::error::FilterError;
use logic::compile_rule_set;

/// Which shape of the document drives the verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// Drop records matched by the deny tree (the default).
    #[default]
    Deny,
    /// Deliver only records matched by the allow tree.
    Allow,
}

/// Compiled filter, shared read-only by every filter worker.
#[derive(Debug)]
pub struct FilterOperator {
    mode: FilterMode,
    version: String,
    deny: Vec<Predicate>,
    allow: Vec<Predicate>,
}

impl FilterOperator {
    /// Compile a filter document with the default deny mode.
    pub fn from_yaml(document: &str) -> Result<Self, FilterError> {
        Self::with_mode(document, FilterMode::default())
    }

    /// Compile a filter document with an explicit mode.
    pub fn with_mode(document: &str, mode: FilterMode) -> Result<Self, FilterError> {
        let parsed: FilterDocument = serde_yaml::from_str(document)?;

        let mut deny = Vec::new();
        if let Some(selections) = &parsed.deny {
            for (name, selection) in selections {
                deny.push(compile_deny_selection(name, selection)?);
            }
        }

        let mut allow = Vec::new();
        if let Some(selections) = &parsed.allow {
            for (name, rules) in selections {
                allow.push(compile_allow_selection(name, rules)?);
            }
        }

        Ok(Self {
            mode,
            version: parsed.version,
            deny,
            allow,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// The per-record verdict: `true` means drop. Pure — repeated
    /// evaluation of the same record yields the same answer.
    pub fn should_drop(&self, record: &Record) -> bool {
        match self.mode {
            FilterMode::Deny => self.deny.iter().any(|selection| selection.eval(record)),
            FilterMode::Allow => !self.allow.iter().any(|selection| selection.eval(record)),
        }
    }
}

/// A deny selection fires when every condition rule matches and no
/// exception rule does.
fn compile_deny_selection(
    name: &str,
    selection: &DenySelection,
) -> Result<Predicate, FilterError> {
    let condition = Predicate::AllOf(compile_rule_set(&selection.condition)?);
    let fire = match &selection.exception {
        Some(exception) if !exception.is_empty() => Predicate::AllOf(vec![
            condition,
            Predicate::Not(Box::new(Predicate::AnyOf(compile_rule_set(exception)?))),
        ]),
        _ => condition,
    };
    Ok(negate_if_requested(name, fire))
}

/// An allow selection matches when every one of its rules matches.
fn compile_allow_selection(name: &str, rules: &RuleSet) -> Result<Predicate, FilterError> {
    let matched = Predicate::AllOf(compile_rule_set(rules)?);
    Ok(negate_if_requested(name, matched))
}

fn negate_if_requested(name: &str, predicate: Predicate) -> Predicate {
    if name.starts_with('!') {
        Predicate::Not(Box::new(predicate))
    } else {
        predicate
    }
}
