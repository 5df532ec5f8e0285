//! The tiny grammar of a rule key: `field ( '|' op )? ( '|' all )?`.

use crate::error::FilterError;

/// String operation applied by a rule. Equality is the implicit operation
/// when no suffix is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

/// Parsed form of a rule key.
#[derive(Debug, PartialEq, Eq)]
pub struct RuleField {
    pub field: String,
    pub op: RuleOp,
    /// AND-reduce the operand sequence instead of the default OR.
    pub all: bool,
}

pub fn parse_rule_field(key: &str) -> Result<RuleField, FilterError> {
    let mut segments = key.split('|');
    let field = segments.next().unwrap_or_default();
    if !is_identifier(field) {
        return Err(invalid(key, "field name must be an identifier"));
    }

    let mut op = RuleOp::Equals;
    let mut have_op = false;
    let mut all = false;
    for segment in segments {
        match segment {
            "startswith" | "endswith" | "contains" if !have_op && !all => {
                have_op = true;
                op = match segment {
                    "startswith" => RuleOp::StartsWith,
                    "endswith" => RuleOp::EndsWith,
                    _ => RuleOp::Contains,
                };
            }
            "all" if !all => all = true,
            other => return Err(invalid(key, format!("unrecognized suffix '{other}'"))),
        }
    }

    Ok(RuleField {
        field: field.to_string(),
        op,
        all,
    })
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(key: &str, reason: impl Into<String>) -> FilterError {
    FilterError::InvalidRuleField {
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_field_is_equals() {
        let parsed = parse_rule_field("eventname").expect("parse failed");
        assert_eq!(parsed.field, "eventname");
        assert_eq!(parsed.op, RuleOp::Equals);
        assert!(!parsed.all);
    }

    #[test]
    fn test_field_with_op() {
        let parsed = parse_rule_field("field|startswith").expect("parse failed");
        assert_eq!(parsed.field, "field");
        assert_eq!(parsed.op, RuleOp::StartsWith);
        assert!(!parsed.all);
    }

    #[test]
    fn test_field_with_op_and_all() {
        let parsed = parse_rule_field("field|contains|all").expect("parse failed");
        assert_eq!(parsed.op, RuleOp::Contains);
        assert!(parsed.all);
    }

    #[test]
    fn test_field_with_only_all() {
        let parsed = parse_rule_field("field|all").expect("parse failed");
        assert_eq!(parsed.op, RuleOp::Equals);
        assert!(parsed.all);
    }

    #[test]
    fn test_trailing_separator_is_invalid() {
        assert!(parse_rule_field("field|").is_err());
    }

    #[test]
    fn test_unknown_op_is_invalid() {
        assert!(parse_rule_field("field|glob").is_err());
    }

    #[test]
    fn test_op_after_all_is_invalid() {
        assert!(parse_rule_field("field|all|contains").is_err());
    }

    #[test]
    fn test_duplicate_op_is_invalid() {
        assert!(parse_rule_field("field|contains|startswith").is_err());
    }

    #[test]
    fn test_bad_identifier_is_invalid() {
        assert!(parse_rule_field("").is_err());
        assert!(parse_rule_field("9field").is_err());
        assert!(parse_rule_field("fie ld|contains").is_err());
    }

    #[test]
    fn test_underscore_identifier() {
        let parsed = parse_rule_field("_raw_log|endswith").expect("parse failed");
        assert_eq!(parsed.field, "_raw_log");
        assert_eq!(parsed.op, RuleOp::EndsWith);
    }
}
