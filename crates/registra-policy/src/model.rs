//! Policy language data model.
//!
//! Policies are trees: a [`Policy`] holds [`Rule`]s, rules hold child rules
//! and [`Pattern`]s, and each pattern tests one [`Fact`] against a match
//! fact. These types deserialize both persisted policy records and the JSON
//! resource templates the assembler expands at request time.

use registra_core::{Attribute, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::PolicyResult;

// =============================================================================
// Enumerations
// =============================================================================

/// The kind of evidence a fact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactKind {
    #[default]
    Unknown,
    Static,
    Function,
    Property,
    Attribute,
    Parameter,
    Operation,
    Role,
    Permission,
}

/// How a pattern is tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternKind {
    #[default]
    Unknown,
    Parameter,
    Operation,
    Expression,
    Authorization,
    SeparationOfDuty,
}

/// Permit rules contribute their condition result as-is; deny rules invert it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    #[default]
    Permit,
    Deny,
}

/// Pass-count condition applied over a node's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    #[default]
    All,
    Any,
    None,
}

impl Condition {
    /// Apply the pass-count formula over `pass` of `size` children.
    #[must_use]
    pub fn succeeds(&self, pass: usize, size: usize) -> bool {
        match self {
            Self::Any => pass > 0,
            Self::All => pass > 0 && pass == size,
            Self::None => pass == 0,
        }
    }
}

/// Value comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Comparator {
    #[default]
    Unknown,
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    Like,
    IsNull,
}

/// Final decision on a policy response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    #[default]
    Unknown,
    Permit,
    Deny,
    Disabled,
    InvalidArgument,
}

/// Result of a single pattern evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationResult {
    #[default]
    Unknown,
    Succeeded,
    Failed,
    Error,
}

impl OperationResult {
    /// Map the sentinel strings a scripted fact may return. Anything other
    /// than UNKNOWN, FAILED or ERROR counts as a successful value.
    #[must_use]
    pub fn from_sentinel(value: &str) -> Self {
        match value {
            "UNKNOWN" => Self::Unknown,
            "FAILED" => Self::Failed,
            "ERROR" => Self::Error,
            _ => Self::Succeeded,
        }
    }
}

/// Dispatch kind of a persisted operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    #[default]
    Unknown,
    Internal,
    Function,
}

/// Script language of a persisted function record. Only JavaScript is
/// executable; the legacy shell kind is retained for deserialization and
/// rejected at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptLanguage {
    #[default]
    Unknown,
    Javascript,
    Legacy,
}

// =============================================================================
// Facts, patterns, rules, policies
// =============================================================================

/// A typed unit of evidence.
///
/// The source descriptor (`model_type` plus `source_urn`/`source_url`/
/// `fact_data`) tells the fact resolver how to dereference the backing
/// record; `source_data` carries inline script text for function facts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: FactKind,

    /// Model of the record this fact dereferences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Identifier of the backing record: a URN, a numeric id, or the
    /// `${contextUser}` placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_urn: Option<String>,

    /// Script location for function facts. The `resource:` scheme addresses
    /// embedded resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    /// Inline script text for function facts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_data: Option<String>,

    /// Raw data: a static value, or a path when the fact resolves by path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_data_type: Option<String>,

    /// Property read from the resolved record for property facts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,

    /// Typed comparison value for property match facts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Fact {
    /// Stable identity used to memoize the resolved reference for one
    /// evaluation: the URN when present, else a digest of the serialized
    /// fact.
    #[must_use]
    pub fn identity(&self) -> String {
        if let Some(urn) = &self.urn {
            return urn.clone();
        }
        let serialized = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&serialized))
    }

    /// The match-fact value for property kinds, stringified.
    #[must_use]
    pub fn value_as_string(&self) -> Option<String> {
        match self.value.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// A single testable condition: a source fact, a match fact, and a
/// comparator or dispatch kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: PatternKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact: Option<Fact>,

    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_fact: Option<Fact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<Comparator>,

    /// Name of a registered native operation, for inline operation patterns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// URN of a persisted operation record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_urn: Option<String>,

    #[serde(default)]
    pub score: i32,
}

impl Pattern {
    /// Display identifier for the pattern chain.
    #[must_use]
    pub fn label(&self) -> String {
        self.urn
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "(anonymous pattern)".into())
    }
}

/// A boolean condition node combining child rules and patterns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: RuleKind,

    #[serde(default)]
    pub condition: Condition,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<Pattern>,

    #[serde(default)]
    pub score: i32,
}

impl Rule {
    /// Display identifier for the rule chain.
    #[must_use]
    pub fn label(&self) -> String {
        self.urn
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "(anonymous rule)".into())
    }

    /// A rule with no children tests nothing and is dropped by pruning.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.patterns.is_empty()
    }
}

/// The root decision unit: a scored, enabled or disabled tree of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub condition: Condition,

    /// Seconds a decision derived from this policy stays valid.
    #[serde(default)]
    pub decision_age: i64,

    #[serde(default)]
    pub score: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_path: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

fn default_enabled() -> bool {
    true
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            name: None,
            urn: None,
            enabled: true,
            condition: Condition::default(),
            decision_age: 0,
            score: 0,
            organization_path: None,
            rules: Vec::new(),
        }
    }
}

impl Policy {
    /// Deserialize a policy from a generic store record.
    pub fn from_record(record: &Record) -> PolicyResult<Self> {
        let value = serde_json::to_value(record)?;
        let policy = serde_json::from_value(value)?;
        Ok(policy)
    }

    /// Collect the PARAMETER facts of the rule tree, deduplicated by URN.
    ///
    /// These are the evidence slots a request has to fill; the assembler
    /// derives policy requests from them so re-evaluation does not require
    /// re-walking the template.
    #[must_use]
    pub fn parameter_facts(&self) -> Vec<Fact> {
        let mut facts: Vec<Fact> = Vec::new();
        for rule in &self.rules {
            collect_rule_parameters(rule, &mut facts);
        }
        facts
    }

    /// Human-readable indented dump of the rule tree, attached to verbose
    /// responses.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "policy {} {:?} score={} enabled={}\n",
            self.urn.as_deref().or(self.name.as_deref()).unwrap_or("-"),
            self.condition,
            self.score,
            self.enabled
        ));
        for rule in &self.rules {
            describe_rule(rule, 1, &mut out);
        }
        out
    }
}

fn collect_rule_parameters(rule: &Rule, facts: &mut Vec<Fact>) {
    for pattern in &rule.patterns {
        if let Some(fact) = &pattern.fact
            && fact.kind == FactKind::Parameter
        {
            let have = fact
                .urn
                .as_ref()
                .is_some_and(|urn| facts.iter().any(|f| f.urn.as_ref() == Some(urn)));
            if fact.urn.is_none() {
                tracing::error!("Parameter fact is missing a urn");
            } else if !have {
                facts.push(fact.clone());
            }
        }
    }
    for child in &rule.rules {
        collect_rule_parameters(child, facts);
    }
}

fn describe_rule(rule: &Rule, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    out.push_str(&format!(
        "{pad}rule {} {:?} {:?} score={}\n",
        rule.label(),
        rule.kind,
        rule.condition,
        rule.score
    ));
    for child in &rule.rules {
        describe_rule(child, depth + 1, out);
    }
    let pad = "  ".repeat(depth + 1);
    for pattern in &rule.patterns {
        let comparator = pattern
            .comparator
            .map(|c| format!(" {c:?}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "{pad}pattern {} {:?}{comparator} score={}\n",
            pattern.label(),
            pattern.kind,
            pattern.score
        ));
    }
}

// =============================================================================
// Requests and responses
// =============================================================================

/// Input to a policy evaluation: the context user, the target policy, and
/// the supplied evidence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRequest {
    /// URN of the policy to evaluate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_user: Option<Record>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_path: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts: Vec<Fact>,

    /// Attach a readable policy dump to the response.
    #[serde(default)]
    pub verbose: bool,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(rename = "type", default)]
    pub decision: Decision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Verbose policy dump, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub score: i32,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiry: Option<OffsetDateTime>,

    /// Rule identifiers in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_chain: Vec<String>,

    /// Pattern identifiers in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pattern_chain: Vec<String>,

    /// Side-channel outputs from scripted facts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
}

impl PolicyResponse {
    #[must_use]
    pub fn is_permit(&self) -> bool {
        self.decision == Decision::Permit
    }

    /// A response without an expiry stamp counts as expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= OffsetDateTime::now_utc(),
            None => true,
        }
    }
}

// =============================================================================
// Persisted operation records
// =============================================================================

/// A persisted operation definition: native dispatch by registered name, or
/// a scripted function.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: OperationKind,

    /// Registered operation name for internal dispatch, or the function URN
    /// for scripted dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl OperationDef {
    pub fn from_record(record: &Record) -> PolicyResult<Self> {
        let value = serde_json::to_value(record)?;
        let def = serde_json::from_value(value)?;
        Ok(def)
    }
}

/// A persisted scripted function.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(rename = "type", default)]
    pub language: ScriptLanguage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl FunctionDef {
    pub fn from_record(record: &Record) -> PolicyResult<Self> {
        let value = serde_json::to_value(record)?;
        let def = serde_json::from_value(value)?;
        Ok(def)
    }
}
