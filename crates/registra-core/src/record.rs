use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A name/value attribute attached to a record or a policy response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Generic attributed-record envelope.
///
/// Records are produced by the schema-driven record store. The common
/// identity and containment fields are typed; everything else lives in the
/// open `fields` map. This envelope is the only place in the policy core
/// where untyped field access happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Schema model name (e.g. "user", "group", "data").
    pub model: String,

    /// Numeric store identifier, when persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Stable uniform resource name, when persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,

    /// Hierarchical path for path-addressable models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attributes: Vec<Attribute>,

    /// Remaining schema fields, untyped.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_urn(mut self, urn: impl Into<String>) -> Self {
        self.urn = Some(urn.into());
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn get_field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Read an untyped field as a string, stringifying scalars.
    pub fn field_as_string(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Look up an attribute value by name.
    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Whether the record carries a stable identity (URN or positive id).
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.urn.is_some() || self.id.is_some_and(|id| id > 0)
    }

    /// Best available identifier: the URN when present, else the content hash.
    #[must_use]
    pub fn identifier(&self) -> String {
        match &self.urn {
            Some(urn) => urn.clone(),
            None => self.content_hash(),
        }
    }

    /// Hex digest of the record's serialized content.
    ///
    /// Used as a cache-key component for records that have not been
    /// persisted and therefore have no URN.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let serialized = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&serialized);
        hex::encode(digest)
    }
}
