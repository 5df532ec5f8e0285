use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Raw serde shape of a filter document. Rule values stay as YAML values
/// until compilation, which is where scalars and sequences are told apart.
#[derive(Debug, Deserialize)]
pub struct FilterDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub allow: Option<BTreeMap<String, RuleSet>>,
    #[serde(default)]
    pub deny: Option<BTreeMap<String, DenySelection>>,
}

/// A named deny selection: mandatory condition rules plus optional
/// exception rules that veto a fire.
#[derive(Debug, Deserialize)]
pub struct DenySelection {
    pub condition: RuleSet,
    #[serde(default)]
    pub exception: Option<RuleSet>,
}

/// Rule key (`field|op|cond`) mapped to its operand value or values.
pub type RuleSet = BTreeMap<String, Value>;
