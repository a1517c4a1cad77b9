//! In-memory collaborator doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use registra_core::Record;
use registra_storage::{
    DutyConflictLookup, EntitlementCheck, MembershipCheck, ModelSchema, Query, RecordStore,
    SchemaProvider, StorageResult,
};
use serde_json::Value;

use crate::script::{ScriptError, ScriptHost};

/// Record store backed by a fixed record list.
#[derive(Default)]
pub(crate) struct MockStore {
    records: Vec<Record>,
    reads: AtomicUsize,
}

impl MockStore {
    pub fn with_records(records: Vec<Record>) -> Arc<Self> {
        Arc::new(Self {
            records,
            reads: AtomicUsize::new(0),
        })
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn record_field(record: &Record, field: &str) -> Option<Value> {
        match field {
            "id" => record.id.map(Value::from),
            "urn" => record.urn.clone().map(Value::from),
            "name" => record.name.clone().map(Value::from),
            "ownerId" => record.owner_id.map(Value::from),
            "organizationId" => record.organization_id.map(Value::from),
            "groupId" => record.group_id.map(Value::from),
            "parentId" => record.parent_id.map(Value::from),
            "path" => record.path.clone().map(Value::from),
            other => record.get_field(other).cloned(),
        }
    }
}

#[async_trait]
impl RecordStore for MockStore {
    async fn read(&self, model: &str, id: i64) -> StorageResult<Option<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .find(|r| r.model == model && r.id == Some(id))
            .cloned())
    }

    async fn read_by_urn(&self, model: &str, urn: &str) -> StorageResult<Option<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .find(|r| r.model == model && r.urn.as_deref() == Some(urn))
            .cloned())
    }

    async fn find_by_urn(&self, urn: &str) -> StorageResult<Vec<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .filter(|r| r.urn.as_deref() == Some(urn))
            .cloned()
            .collect())
    }

    async fn find_by_path(
        &self,
        _context_user: Option<&Record>,
        model: &str,
        path: &str,
        _category: Option<&str>,
        _organization_id: Option<i64>,
    ) -> StorageResult<Option<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .find(|r| r.model == model && r.path.as_deref() == Some(path))
            .cloned())
    }

    async fn find(&self, query: &Query) -> StorageResult<Vec<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .filter(|r| {
                r.model == query.model
                    && query.clauses.iter().all(|clause| {
                        Self::record_field(r, &clause.field).as_ref() == Some(&clause.value)
                    })
            })
            .cloned()
            .collect())
    }

    async fn populate(&self, _record: &mut Record, _fields: Option<&[&str]>) -> StorageResult<()> {
        Ok(())
    }
}

/// Script host that records calls and returns a fixed value.
pub(crate) struct MockScriptHost {
    result: Value,
    calls: AtomicUsize,
}

impl Default for MockScriptHost {
    fn default() -> Self {
        Self::returning(Value::Null)
    }
}

impl MockScriptHost {
    pub fn returning(result: Value) -> Self {
        Self {
            result,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScriptHost for MockScriptHost {
    fn run(
        &self,
        _script: &str,
        _bindings: &serde_json::Map<String, Value>,
    ) -> Result<Value, ScriptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Entitlement check granting a fixed set of (principal, permission, target)
/// URN triples.
#[derive(Default)]
pub(crate) struct MockEntitlements {
    grants: Vec<(String, String, String)>,
}

impl MockEntitlements {
    pub fn granting(grants: Vec<(&str, &str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            grants: grants
                .into_iter()
                .map(|(p, m, t)| (p.to_string(), m.to_string(), t.to_string()))
                .collect(),
        })
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl EntitlementCheck for MockEntitlements {
    async fn check_entitlement(
        &self,
        principal: &Record,
        permission: &Record,
        target: &Record,
    ) -> StorageResult<bool> {
        let p = principal.urn.as_deref().unwrap_or_default();
        let m = permission.urn.as_deref().unwrap_or_default();
        let t = target.urn.as_deref().unwrap_or_default();
        Ok(self
            .grants
            .iter()
            .any(|(gp, gm, gt)| gp == p && gm == m && gt == t))
    }
}

/// Membership check over fixed (principal, container) URN pairs.
#[derive(Default)]
pub(crate) struct MockMemberships {
    members: Vec<(String, String)>,
}

impl MockMemberships {
    pub fn with_members(members: Vec<(&str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            members: members
                .into_iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MembershipCheck for MockMemberships {
    async fn is_member(
        &self,
        principal: &Record,
        container: &Record,
        _recursive: bool,
    ) -> StorageResult<bool> {
        let p = principal.urn.as_deref().unwrap_or_default();
        let c = container.urn.as_deref().unwrap_or_default();
        Ok(self.members.iter().any(|(mp, mc)| mp == p && mc == c))
    }
}

/// Duty-conflict lookup keyed by (activity group URN, principal URN).
#[derive(Default)]
pub(crate) struct MockDuties {
    permissions: HashMap<(String, String), Vec<i64>>,
}

impl MockDuties {
    pub fn with_permissions(entries: Vec<(&str, &str, Vec<i64>)>) -> Arc<Self> {
        Arc::new(Self {
            permissions: entries
                .into_iter()
                .map(|(g, p, ids)| ((g.to_string(), p.to_string()), ids))
                .collect(),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DutyConflictLookup for MockDuties {
    async fn activity_permissions_for(
        &self,
        group_urn: &str,
        principal: &Record,
    ) -> StorageResult<Vec<i64>> {
        let p = principal.urn.as_deref().unwrap_or_default();
        Ok(self
            .permissions
            .get(&(group_urn.to_string(), p.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Schema provider over a fixed schema map.
#[derive(Default)]
pub(crate) struct MockSchemas {
    schemas: HashMap<String, ModelSchema>,
}

impl MockSchemas {
    pub fn with_schemas(schemas: Vec<ModelSchema>) -> Arc<Self> {
        Arc::new(Self {
            schemas: schemas.into_iter().map(|s| (s.name.clone(), s)).collect(),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SchemaProvider for MockSchemas {
    fn model_schema(&self, model: &str) -> Option<ModelSchema> {
        self.schemas.get(model).cloned()
    }
}
