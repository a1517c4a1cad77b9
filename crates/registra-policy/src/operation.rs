//! Native operation dispatch.
//!
//! Operation patterns either name a registered native operation directly or
//! point at a persisted operation record. Native operations implement
//! [`NativeOperation`] and are looked up by name in the [`OperationRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use registra_core::{Record, models};
use registra_storage::{Query, RecordStore};
use serde_json::Value;

use crate::model::{Fact, OperationResult, Pattern, PolicyRequest};

/// Name under which the ownership operation is registered.
pub const OP_OWNER_CHECK: &str = "ownerCheck";

/// A natively implemented operation.
///
/// Operations do not raise: any internal failure maps to
/// [`OperationResult::Error`], keeping the fail-closed contract of pattern
/// evaluation.
#[async_trait]
pub trait NativeOperation: Send + Sync {
    async fn operate(
        &self,
        request: &PolicyRequest,
        pattern: &Pattern,
        source: &Fact,
        match_fact: &Fact,
    ) -> OperationResult;
}

/// Name-indexed registry of native operations.
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn NativeOperation>>,
}

impl OperationRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in operations.
    #[must_use]
    pub fn with_builtins(store: Arc<dyn RecordStore>) -> Self {
        let mut registry = Self::new();
        registry.register(OP_OWNER_CHECK, Arc::new(OwnerOperation::new(store)));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, operation: Arc<dyn NativeOperation>) {
        self.operations.insert(name.into(), operation);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeOperation>> {
        self.operations.get(name).cloned()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_numeric_id(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Tests whether the acting user owns the record the match fact points at.
///
/// The source fact identifies the actor (a user, by URN or numeric id in
/// `fact_data`); the match fact identifies the target record. The check
/// succeeds when the target's owner id equals the actor's id, fails when
/// both ids resolved but differ, and errors when either side could not be
/// resolved.
pub struct OwnerOperation {
    store: Arc<dyn RecordStore>,
}

impl OwnerOperation {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    async fn resolve_actor(&self, source: &Fact) -> Result<Option<Record>, OperationResult> {
        let stype = source.model_type.as_deref().unwrap_or_default();
        if let Some(sdat) = source.fact_data.as_deref()
            && is_numeric_id(sdat)
        {
            let Ok(id) = sdat.parse::<i64>() else {
                return Err(OperationResult::Error);
            };
            if id <= 0 {
                tracing::info!("Skip invalid id");
                return Ok(None);
            }
            let fdtype = source.fact_data_type.as_deref().unwrap_or(stype);
            match self.store.read(fdtype, id).await {
                Ok(record) => Ok(record),
                Err(err) => {
                    tracing::error!(error = %err, "Actor read failed");
                    Err(OperationResult::Error)
                }
            }
        } else if let Some(surn) = source.source_urn.as_deref() {
            match self.store.read_by_urn(stype, surn).await {
                Ok(Some(record)) => Ok(Some(record)),
                Ok(None) => {
                    tracing::warn!(urn = surn, "Failed to find urn");
                    Ok(None)
                }
                Err(err) => {
                    tracing::error!(error = %err, "Actor lookup failed");
                    Err(OperationResult::Error)
                }
            }
        } else {
            tracing::error!("Source urn or data was not defined");
            Err(OperationResult::Error)
        }
    }

    async fn resolve_target(&self, match_fact: &Fact) -> Result<Option<Record>, OperationResult> {
        let Some(murn) = match_fact.source_urn.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let mtype = match_fact.model_type.as_deref().unwrap_or_default();

        // Inspect-only query: the owner id is an identity field and does not
        // need hydration.
        let query = if is_numeric_id(murn) {
            let Ok(id) = murn.parse::<i64>() else {
                return Err(OperationResult::Error);
            };
            Query::new(mtype).with_clause("id", Value::from(id)).inspect()
        } else {
            Query::new(mtype)
                .with_clause("urn", Value::from(murn))
                .inspect()
        };

        match self.store.find(&query).await {
            Ok(records) => {
                if records.is_empty() {
                    tracing::error!(urn = murn, "Urn could not be found");
                }
                Ok(records.into_iter().next())
            }
            Err(err) => {
                tracing::error!(error = %err, "Target lookup failed");
                Err(OperationResult::Error)
            }
        }
    }
}

#[async_trait]
impl NativeOperation for OwnerOperation {
    async fn operate(
        &self,
        _request: &PolicyRequest,
        _pattern: &Pattern,
        source: &Fact,
        match_fact: &Fact,
    ) -> OperationResult {
        let stype = source.model_type.as_deref();
        if stype != Some(models::USER) {
            tracing::error!(model = ?stype, "Source type must refer to a user model");
            return OperationResult::Error;
        }
        if match_fact.source_urn.is_none() || match_fact.model_type.is_none() {
            tracing::error!(
                urn = ?match_fact.source_urn,
                model = ?match_fact.model_type,
                "Reference model urn or type was not defined"
            );
            return OperationResult::Error;
        }

        let actor = match self.resolve_actor(source).await {
            Ok(actor) => actor,
            Err(result) => return result,
        };
        let target = match self.resolve_target(match_fact).await {
            Ok(target) => target,
            Err(result) => return result,
        };

        let actor_id = actor.and_then(|r| r.id).unwrap_or(0);
        let owner_id = target.and_then(|r| r.owner_id).unwrap_or(0);

        if actor_id > 0 && owner_id > 0 {
            if actor_id == owner_id {
                OperationResult::Succeeded
            } else {
                OperationResult::Failed
            }
        } else {
            OperationResult::Error
        }
    }
}
