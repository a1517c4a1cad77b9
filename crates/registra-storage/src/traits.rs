use async_trait::async_trait;
use registra_core::Record;
use serde_json::Value;

use crate::{ModelSchema, Query, StorageResult};

/// Read-side record store contract consumed by the policy core.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record by model and numeric id.
    async fn read(&self, model: &str, id: i64) -> StorageResult<Option<Record>>;

    /// Read a record by URN.
    async fn read_by_urn(&self, model: &str, urn: &str) -> StorageResult<Option<Record>>;

    /// Find all records matching a URN across identity models.
    async fn find_by_urn(&self, urn: &str) -> StorageResult<Vec<Record>>;

    /// Resolve a record by hierarchical path, scoped to an organization and
    /// (optionally) relative to a context user's home directory.
    async fn find_by_path(
        &self,
        context_user: Option<&Record>,
        model: &str,
        path: &str,
        category: Option<&str>,
        organization_id: Option<i64>,
    ) -> StorageResult<Option<Record>>;

    /// Execute a query and return matching records.
    async fn find(&self, query: &Query) -> StorageResult<Vec<Record>>;

    /// Hydrate lazily-loaded fields on a record. When `fields` is given,
    /// only those are hydrated.
    async fn populate(&self, record: &mut Record, fields: Option<&[&str]>) -> StorageResult<()>;
}

/// Effective-permission primitive.
#[async_trait]
pub trait EntitlementCheck: Send + Sync {
    /// Whether the principal holds the named permission on the target,
    /// directly or through role/group membership.
    async fn check_entitlement(
        &self,
        principal: &Record,
        permission: &Record,
        target: &Record,
    ) -> StorageResult<bool>;
}

/// Role and group membership primitive.
#[async_trait]
pub trait MembershipCheck: Send + Sync {
    /// Whether the principal is a member of the container, optionally
    /// walking the container hierarchy.
    async fn is_member(
        &self,
        principal: &Record,
        container: &Record,
        recursive: bool,
    ) -> StorageResult<bool>;
}

/// Separation-of-duties primitive.
#[async_trait]
pub trait DutyConflictLookup: Send + Sync {
    /// Permission ids granted to the principal within the named activity
    /// group. A non-empty intersection with a fact's conflict set fails the
    /// separation check.
    async fn activity_permissions_for(
        &self,
        group_urn: &str,
        principal: &Record,
    ) -> StorageResult<Vec<i64>>;
}

/// Read-only schema metadata access.
pub trait SchemaProvider: Send + Sync {
    fn model_schema(&self, model: &str) -> Option<ModelSchema>;

    /// Default value for a model field, when the schema declares one.
    fn default_field_value(&self, _model: &str, _field: &str) -> Option<Value> {
        None
    }
}
