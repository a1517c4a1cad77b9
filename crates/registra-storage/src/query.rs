use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single field constraint within a [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryClause {
    pub field: String,
    pub value: Value,
}

/// Minimal query surface needed for collection-level read authorization.
///
/// The full query subsystem lives elsewhere; the policy core only needs to
/// inspect a query's constraints, derive narrowed sub-queries from them,
/// and execute those through [`crate::RecordStore::find`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Target model name.
    pub model: String,

    /// Field constraints, conjunctive.
    #[serde(default)]
    pub clauses: Vec<QueryClause>,

    /// Inspection-only flag: request identity fields without hydration.
    #[serde(default)]
    pub inspect: bool,
}

impl Query {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            clauses: Vec::new(),
            inspect: false,
        }
    }

    pub fn with_clause(mut self, field: impl Into<String>, value: Value) -> Self {
        self.clauses.push(QueryClause {
            field: field.into(),
            value,
        });
        self
    }

    pub fn inspect(mut self) -> Self {
        self.inspect = true;
        self
    }

    /// All constrained values for the named field.
    pub fn field_values(&self, field: &str) -> Vec<&Value> {
        self.clauses
            .iter()
            .filter(|c| c.field == field)
            .map(|c| &c.value)
            .collect()
    }

    /// Canonical key for deduplicating equivalent queries.
    #[must_use]
    pub fn key(&self) -> String {
        let mut parts: Vec<String> = self
            .clauses
            .iter()
            .map(|c| format!("{}={}", c.field, c.value))
            .collect();
        parts.sort_unstable();
        format!("{}?{}", self.model, parts.join("&"))
    }
}
