//! Fact resolution.
//!
//! A fact's runtime value depends on both the source fact and the match
//! fact: the source provides context, the match provides specificity. The
//! resolver dereferences backing records through the record store, executes
//! scripted facts through the script host, and memoizes resolved references
//! per evaluation in a [`ReferenceCache`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use registra_core::Record;
use registra_storage::RecordStore;
use serde_json::Value;

use crate::error::PolicyResult;
use crate::model::{Fact, FactKind, FunctionDef, PolicyRequest, ScriptLanguage};
use crate::script::ScriptHost;
use crate::template::{CONTEXT_USER_MARKER, TemplateStore};

/// Resolve-once cell for fact references, scoped to one evaluation.
///
/// Keyed by fact identity; a fact's reference is resolved at most once per
/// evaluation, including negative results.
#[derive(Default)]
pub struct ReferenceCache {
    slots: Mutex<HashMap<String, Option<Record>>>,
}

impl ReferenceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<Option<Record>> {
        match self.slots.lock() {
            Ok(guard) => guard.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn put(&self, key: String, value: Option<Record>) {
        match self.slots.lock() {
            Ok(mut guard) => {
                guard.insert(key, value);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key, value);
            }
        }
    }
}

fn is_numeric_id(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Resolves fact values against the record store and script host.
pub struct FactResolver {
    store: Arc<dyn RecordStore>,
    scripts: Arc<dyn ScriptHost>,
}

impl FactResolver {
    pub fn new(store: Arc<dyn RecordStore>, scripts: Arc<dyn ScriptHost>) -> Self {
        Self { store, scripts }
    }

    /// Dereference the record a fact points at, memoized per evaluation.
    ///
    /// Exactly one of identifier-based or path-based resolution applies.
    /// Failure to resolve yields `None` and is logged, never raised.
    pub async fn resolve_reference(
        &self,
        context_user: Option<&Record>,
        source: &Fact,
        reference: &Fact,
        refs: &ReferenceCache,
    ) -> Option<Record> {
        let key = source.identity();
        if let Some(cached) = refs.get(&key) {
            return cached;
        }
        let resolved = self.read_record(context_user, source, reference).await;
        refs.put(key, resolved.clone());
        resolved
    }

    async fn read_record(
        &self,
        context_user: Option<&Record>,
        source: &Fact,
        reference: &Fact,
    ) -> Option<Record> {
        let Some(stype) = source.model_type.as_deref() else {
            tracing::error!("Source fact is not configured for a store read");
            return None;
        };
        if reference.model_type.is_none() {
            tracing::error!("Reference fact is not configured for a store read");
            return None;
        }

        if let Some(surn) = source.source_urn.as_deref() {
            let surn = if surn == CONTEXT_USER_MARKER {
                match context_user.and_then(|u| u.urn.as_deref()) {
                    Some(urn) => urn.to_string(),
                    None => {
                        tracing::error!("Context user placeholder without a context user");
                        return None;
                    }
                }
            } else {
                surn.to_string()
            };

            if is_numeric_id(&surn) {
                let id = surn.parse::<i64>().ok()?;
                match self.store.read(stype, id).await {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::error!(model = stype, id, error = %err, "Fact read by id failed");
                        None
                    }
                }
            } else if !surn.is_empty() {
                match self.store.read_by_urn(stype, &surn).await {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::error!(model = stype, urn = %surn, error = %err, "Fact read by urn failed");
                        None
                    }
                }
            } else {
                // sink empty urn left from tokenization
                None
            }
        } else if let Some(fdata) = source.fact_data.as_deref() {
            let category = source.fact_data_type.as_deref();
            let organization_id = context_user.and_then(|u| u.organization_id);
            match self
                .store
                .find_by_path(None, stype, fdata, category, organization_id)
                .await
            {
                Ok(Some(record)) => Some(record),
                Ok(None) => {
                    tracing::error!(model = stype, path = fdata, "Failed to find fact by path");
                    None
                }
                Err(err) => {
                    tracing::error!(model = stype, path = fdata, error = %err, "Fact path lookup failed");
                    None
                }
            }
        } else {
            tracing::error!("Source URN and fact data were null");
            None
        }
    }

    /// The checked value of an expression, dispatched on the match fact's
    /// kind.
    pub async fn get_fact_value(
        &self,
        request: &PolicyRequest,
        source: &Fact,
        match_fact: &Fact,
        refs: &ReferenceCache,
    ) -> Option<String> {
        let context_user = request.context_user.as_ref();
        match match_fact.kind {
            FactKind::Static | FactKind::Function => source.fact_data.clone(),
            FactKind::Property => {
                let Some(prop) = match_fact.property_name.as_deref() else {
                    tracing::warn!("Property match fact has no property name");
                    return None;
                };
                let record = self
                    .resolve_reference(context_user, source, match_fact, refs)
                    .await?;
                record.field_as_string(prop)
            }
            FactKind::Attribute => {
                let Some(name) = match_fact.source_urn.as_deref() else {
                    tracing::warn!("Attribute match fact has no attribute name");
                    return None;
                };
                let record = self
                    .resolve_reference(context_user, source, match_fact, refs)
                    .await?;
                record.attribute_value(name).map(str::to_string)
            }
            other => {
                tracing::error!(kind = ?other, "Unhandled source fact kind");
                None
            }
        }
    }

    /// The expected value of an expression, dispatched on the match fact's
    /// own kind. Function facts execute their script.
    pub async fn get_match_fact_value(
        &self,
        request: &PolicyRequest,
        source: &Fact,
        match_fact: &Fact,
    ) -> PolicyResult<Option<String>> {
        match match_fact.kind {
            FactKind::Property => Ok(match_fact.value_as_string()),
            // An attribute fact's match is presently its static value; the
            // source slot got cross-purposed to the attribute name.
            FactKind::Attribute | FactKind::Static => Ok(match_fact.fact_data.clone()),
            FactKind::Function => self.evaluate_function_fact(request, source, match_fact).await,
            other => {
                tracing::error!(kind = ?other, "Unhandled match fact kind");
                Ok(None)
            }
        }
    }

    /// Execute a scripted fact.
    ///
    /// Script source resolution order: inline `source_data`, then a
    /// `resource:` URL, then a persisted function record addressed by
    /// `source_urn` whose language must be JavaScript.
    ///
    /// # Errors
    ///
    /// Script faults propagate; lookup failures log and yield `None`.
    pub async fn evaluate_function_fact(
        &self,
        request: &PolicyRequest,
        source: &Fact,
        match_fact: &Fact,
    ) -> PolicyResult<Option<String>> {
        if match_fact.kind != FactKind::Function {
            tracing::error!("Match fact must be a function fact");
            return Ok(None);
        }

        let mut script = match_fact.source_data.clone();
        if script.is_none()
            && let Some(surl) = match_fact.source_url.as_deref()
            && !surl.is_empty()
        {
            if let Some(path) = surl.strip_prefix("resource:") {
                match TemplateStore::resource(path) {
                    Some(body) => script = Some(body.to_string()),
                    None => tracing::error!(path, "Failed to load script resource"),
                }
            } else {
                tracing::error!(url = surl, "Remote script sources are not supported");
            }
        }

        let bindings = self.function_bindings(request, source, match_fact)?;

        if let Some(script) = script {
            let result = self.scripts.run(&script, &bindings)?;
            return Ok(value_to_string(result));
        }

        if let Some(surn) = match_fact.source_urn.as_deref()
            && !surn.is_empty()
        {
            let record = match self.store.find_by_urn(surn).await {
                Ok(records) => records.into_iter().next(),
                Err(err) => {
                    tracing::error!(urn = surn, error = %err, "Function lookup failed");
                    None
                }
            };
            let Some(record) = record else {
                tracing::error!(urn = surn, "Function is null");
                return Ok(None);
            };
            let func = FunctionDef::from_record(&record)?;
            if func.language != ScriptLanguage::Javascript {
                tracing::warn!(urn = surn, language = ?func.language, "Ignoring non-JavaScript function");
                return Ok(None);
            }
            let Some(body) = func.source else {
                tracing::error!(urn = surn, "Function has no source");
                return Ok(None);
            };
            let result = self.scripts.run(&body, &bindings)?;
            return Ok(value_to_string(result));
        }

        tracing::error!("Missing source urn or source data on match fact");
        Ok(None)
    }

    fn function_bindings(
        &self,
        request: &PolicyRequest,
        source: &Fact,
        match_fact: &Fact,
    ) -> PolicyResult<serde_json::Map<String, Value>> {
        let mut bindings = serde_json::Map::new();
        bindings.insert("fact".into(), serde_json::to_value(source)?);
        bindings.insert("match".into(), serde_json::to_value(match_fact)?);
        bindings.insert(
            "contextUser".into(),
            match &request.context_user {
                Some(user) => serde_json::to_value(user)?,
                None => Value::Null,
            },
        );
        Ok(bindings)
    }
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockScriptHost, MockStore};
    use serde_json::json;

    fn resolver(records: Vec<Record>) -> FactResolver {
        FactResolver::new(MockStore::with_records(records), Arc::new(MockScriptHost::default()))
    }

    fn user(urn: &str) -> Record {
        let mut rec = Record::new("user").with_urn(urn).with_id(7);
        rec.organization_id = Some(1);
        rec
    }

    fn static_fact(model: &str, urn: &str) -> Fact {
        Fact {
            kind: FactKind::Static,
            model_type: Some(model.into()),
            source_urn: Some(urn.into()),
            ..Fact::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_by_urn() {
        let resolver = resolver(vec![Record::new("data").with_urn("urn:registra:data:a")]);
        let fact = static_fact("data", "urn:registra:data:a");
        let refs = ReferenceCache::new();
        let record = resolver
            .resolve_reference(None, &fact, &fact, &refs)
            .await
            .unwrap();
        assert_eq!(record.urn.as_deref(), Some("urn:registra:data:a"));
    }

    #[tokio::test]
    async fn test_resolve_by_numeric_id() {
        let resolver = resolver(vec![Record::new("data").with_id(42).with_urn("urn:registra:data:42")]);
        let fact = static_fact("data", "42");
        let refs = ReferenceCache::new();
        let record = resolver
            .resolve_reference(None, &fact, &fact, &refs)
            .await
            .unwrap();
        assert_eq!(record.id, Some(42));
    }

    #[tokio::test]
    async fn test_resolve_context_user_placeholder() {
        let ctx = user("urn:registra:user:alice");
        let resolver = resolver(vec![ctx.clone()]);
        let fact = static_fact("user", CONTEXT_USER_MARKER);
        let refs = ReferenceCache::new();
        let record = resolver
            .resolve_reference(Some(&ctx), &fact, &fact, &refs)
            .await
            .unwrap();
        assert_eq!(record.urn, ctx.urn);
    }

    #[tokio::test]
    async fn test_resolve_by_path() {
        let mut rec = Record::new("permission").with_urn("urn:registra:permission:read");
        rec.path = Some("/systemReadObject".into());
        let resolver = resolver(vec![rec]);
        let fact = Fact {
            kind: FactKind::Permission,
            model_type: Some("permission".into()),
            fact_data: Some("/systemReadObject".into()),
            fact_data_type: Some("permission".into()),
            ..Fact::default()
        };
        let refs = ReferenceCache::new();
        let record = resolver
            .resolve_reference(None, &fact, &fact, &refs)
            .await
            .unwrap();
        assert_eq!(record.urn.as_deref(), Some("urn:registra:permission:read"));
    }

    #[tokio::test]
    async fn test_resolution_is_memoized_including_misses() {
        let store = MockStore::with_records(vec![]);
        let resolver = FactResolver::new(store.clone(), Arc::new(MockScriptHost::default()));
        let fact = static_fact("data", "urn:registra:data:missing");
        let refs = ReferenceCache::new();
        assert!(resolver.resolve_reference(None, &fact, &fact, &refs).await.is_none());
        assert!(resolver.resolve_reference(None, &fact, &fact, &refs).await.is_none());
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn test_fact_value_property() {
        let mut rec = Record::new("user").with_urn("urn:registra:user:alice");
        rec.set_field("age", json!(21));
        let resolver = resolver(vec![rec]);
        let source = static_fact("user", "urn:registra:user:alice");
        let match_fact = Fact {
            kind: FactKind::Property,
            model_type: Some("user".into()),
            property_name: Some("age".into()),
            value: Some(json!(21)),
            ..Fact::default()
        };
        let refs = ReferenceCache::new();
        let request = PolicyRequest::default();
        let value = resolver
            .get_fact_value(&request, &source, &match_fact, &refs)
            .await;
        assert_eq!(value.as_deref(), Some("21"));
        assert_eq!(match_fact.value_as_string().as_deref(), Some("21"));
    }

    #[tokio::test]
    async fn test_fact_value_attribute() {
        let mut rec = Record::new("user").with_urn("urn:registra:user:alice");
        rec.attributes
            .push(registra_core::Attribute::new("clearance", "secret"));
        let resolver = resolver(vec![rec]);
        let source = static_fact("user", "urn:registra:user:alice");
        let match_fact = Fact {
            kind: FactKind::Attribute,
            model_type: Some("user".into()),
            source_urn: Some("clearance".into()),
            ..Fact::default()
        };
        let refs = ReferenceCache::new();
        let request = PolicyRequest::default();
        let value = resolver
            .get_fact_value(&request, &source, &match_fact, &refs)
            .await;
        assert_eq!(value.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_function_fact_inline_script() {
        let host = Arc::new(MockScriptHost::returning(json!("SUCCEEDED")));
        let resolver = FactResolver::new(MockStore::with_records(vec![]), host.clone());
        let source = Fact {
            kind: FactKind::Parameter,
            source_urn: Some("urn:registra:user:alice".into()),
            ..Fact::default()
        };
        let match_fact = Fact {
            kind: FactKind::Function,
            source_data: Some("return 'SUCCEEDED';".into()),
            ..Fact::default()
        };
        let request = PolicyRequest::default();
        let value = resolver
            .evaluate_function_fact(&request, &source, &match_fact)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("SUCCEEDED"));
        assert_eq!(host.calls(), 1);
    }

    #[tokio::test]
    async fn test_function_fact_rejects_legacy_language() {
        let mut rec = Record::new("function").with_urn("urn:registra:function:old");
        rec.set_field("type", json!("LEGACY"));
        rec.set_field("source", json!("print('no')"));
        let host = Arc::new(MockScriptHost::default());
        let resolver = FactResolver::new(MockStore::with_records(vec![rec]), host.clone());
        let match_fact = Fact {
            kind: FactKind::Function,
            model_type: Some("function".into()),
            source_urn: Some("urn:registra:function:old".into()),
            ..Fact::default()
        };
        let request = PolicyRequest::default();
        let value = resolver
            .evaluate_function_fact(&request, &Fact::default(), &match_fact)
            .await
            .unwrap();
        assert!(value.is_none());
        assert_eq!(host.calls(), 0);
    }
}
