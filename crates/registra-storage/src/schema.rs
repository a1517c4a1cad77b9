use serde::{Deserialize, Serialize};

/// Structural categories a model may inherit from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelCategory {
    Account,
    Person,
    Group,
    /// Group-contained models (carry `groupId`/`groupPath`).
    Directory,
    /// Tree-structured models (carry `parentId`).
    Parented,
}

/// CRUD-E permission categories used for access-rule synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionCategory {
    Create,
    Read,
    Update,
    Delete,
    Execute,
}

impl PermissionCategory {
    /// Canonical system permission name, e.g. "systemReadObject".
    #[must_use]
    pub fn permission_name(&self) -> &'static str {
        match self {
            Self::Create => "systemCreateObject",
            Self::Read => "systemReadObject",
            Self::Update => "systemUpdateObject",
            Self::Delete => "systemDeleteObject",
            Self::Execute => "systemExecuteObject",
        }
    }
}

/// Role names permitted per permission category.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRoles {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execute: Vec<String>,
}

impl AccessRoles {
    pub fn for_category(&self, category: PermissionCategory) -> &[String] {
        match category {
            PermissionCategory::Create => &self.create,
            PermissionCategory::Read => &self.read,
            PermissionCategory::Update => &self.update,
            PermissionCategory::Delete => &self.delete,
            PermissionCategory::Execute => &self.execute,
        }
    }
}

/// Access declaration attached to a model or an individual field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAccess {
    #[serde(default)]
    pub roles: AccessRoles,
}

/// Per-field schema metadata the policy core consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,

    /// Field references another record.
    #[serde(default)]
    pub foreign: bool,

    /// Foreign reference is hydrated on populate.
    #[serde(default)]
    pub follow_reference: bool,

    /// Field participates in record identity.
    #[serde(default)]
    pub identity: bool,

    #[serde(default)]
    pub indexed: bool,

    /// Referenced model for foreign fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,

    /// Referenced property for foreign fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_property: Option<String>,

    /// Field-level access declaration, when stricter than the model's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<ModelAccess>,
}

/// Schema definition for a single model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    pub name: String,

    /// Categories this model inherits from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<ModelCategory>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,

    /// Model-level access declaration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<ModelAccess>,
}

impl ModelSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn inherits(&self, category: ModelCategory) -> bool {
        self.categories.contains(&category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_roles_by_category() {
        let roles = AccessRoles {
            read: vec!["accountUsersReaders".into()],
            delete: vec!["accountAdministrators".into()],
            ..AccessRoles::default()
        };
        assert_eq!(
            roles.for_category(PermissionCategory::Read),
            ["accountUsersReaders".to_string()]
        );
        assert!(roles.for_category(PermissionCategory::Create).is_empty());
    }

    #[test]
    fn test_permission_names() {
        assert_eq!(
            PermissionCategory::Execute.permission_name(),
            "systemExecuteObject"
        );
    }

    #[test]
    fn test_schema_field_lookup_and_inheritance() {
        let schema = ModelSchema {
            name: "data".into(),
            categories: vec![ModelCategory::Directory],
            fields: vec![FieldSchema {
                name: "groupId".into(),
                foreign: true,
                follow_reference: false,
                identity: false,
                indexed: true,
                base_model: Some("group".into()),
                base_property: None,
                access: None,
            }],
            access: None,
        };
        assert!(schema.inherits(ModelCategory::Directory));
        assert!(!schema.inherits(ModelCategory::Parented));
        assert!(schema.field("groupId").is_some_and(|f| f.foreign));
        assert!(schema.field("nope").is_none());
    }
}
