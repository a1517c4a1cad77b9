//! Policy assembly from resource templates.
//!
//! System policies (create/read/update/delete/execute object) are not
//! persisted; they are synthesized per request from embedded templates. The
//! assembler expands includes and scalar placeholders, resolves the
//! resource's group and parent relations, injects schema-declared
//! model-access patterns, splices read policies for embedded identity
//! references, and prunes the branches whose placeholders stayed
//! unresolved. A template that cannot be assembled yields no policy, which
//! evaluates to INVALID_ARGUMENT.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use registra_core::{Record, models};
use registra_storage::{
    FieldSchema, ModelCategory, ModelSchema, PermissionCategory, Query, RecordStore,
    SchemaProvider,
};
use serde_json::Value;

use crate::engine::PolicyEvaluator;
use crate::error::{PolicyError, PolicyResult};
use crate::model::{
    Decision, Fact, Pattern, Policy, PolicyRequest, PolicyResponse, Rule,
};
use crate::template::{
    ERROR_MARKER, ExpandContext, GROUP_URN_MARKER, PARENT_URN_MARKER, POLICY_SYSTEM_CREATE_OBJECT,
    POLICY_SYSTEM_DELETE_OBJECT, POLICY_SYSTEM_EXECUTE_OBJECT, POLICY_SYSTEM_READ_OBJECT,
    POLICY_SYSTEM_UPDATE_OBJECT, TOKEN_MARKER, TemplateStore, contains_error, expand,
    expand_includes,
};

fn permission_category(policy_name: &str) -> Option<PermissionCategory> {
    match policy_name {
        POLICY_SYSTEM_CREATE_OBJECT => Some(PermissionCategory::Create),
        POLICY_SYSTEM_READ_OBJECT => Some(PermissionCategory::Read),
        POLICY_SYSTEM_UPDATE_OBJECT => Some(PermissionCategory::Update),
        POLICY_SYSTEM_DELETE_OBJECT => Some(PermissionCategory::Delete),
        POLICY_SYSTEM_EXECUTE_OBJECT => Some(PermissionCategory::Execute),
        _ => None,
    }
}

/// Builds and evaluates resource policies.
pub struct PolicyAssembler {
    store: Arc<dyn RecordStore>,
    schemas: Arc<dyn SchemaProvider>,
    evaluator: Arc<PolicyEvaluator>,
}

impl PolicyAssembler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        schemas: Arc<dyn SchemaProvider>,
        evaluator: Arc<PolicyEvaluator>,
    ) -> Self {
        Self {
            store,
            schemas,
            evaluator,
        }
    }

    #[must_use]
    pub fn evaluator(&self) -> &Arc<PolicyEvaluator> {
        &self.evaluator
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    /// Assemble a named system policy for one actor/resource pairing.
    ///
    /// Returns `Ok(None)` when the template is unknown, fails to parse, or
    /// still carries the error sentinel after expansion.
    pub async fn resource_policy(
        &self,
        name: &str,
        actor: &Record,
        token: Option<&str>,
        resource: &Record,
    ) -> PolicyResult<Option<Policy>> {
        let mut visited = HashSet::new();
        visited.insert(resource.identifier());
        self.assemble(name, actor, token, resource, &mut visited)
            .await
    }

    fn assemble<'a>(
        &'a self,
        name: &'a str,
        actor: &'a Record,
        token: Option<&'a str>,
        resource: &'a Record,
        visited: &'a mut HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = PolicyResult<Option<Policy>>> + Send + 'a>> {
        Box::pin(self.assemble_inner(name, actor, token, resource, visited))
    }

    async fn assemble_inner(
        &self,
        name: &str,
        actor: &Record,
        token: Option<&str>,
        resource: &Record,
        visited: &mut HashSet<String>,
    ) -> PolicyResult<Option<Policy>> {
        let Some(template) = TemplateStore::policy(name) else {
            tracing::error!(name, "Invalid policy resource name");
            return Ok(None);
        };
        let category = permission_category(name);
        let schema = self.schemas.model_schema(&resource.model);
        let text = expand_includes(template);

        let group_urn = if text.contains(GROUP_URN_MARKER) {
            self.resolve_group_urn(resource, schema.as_ref()).await
        } else {
            None
        };
        let parent_urn = if text.contains(PARENT_URN_MARKER) {
            self.resolve_parent_urn(resource, schema.as_ref()).await
        } else {
            None
        };

        let permission_name = category.map_or(name, |c| c.permission_name());
        let ctx = ExpandContext {
            actor_urn: actor.urn.as_deref().unwrap_or_default(),
            actor_type: &actor.model,
            resource_urn: resource.urn.as_deref().unwrap_or_default(),
            resource_type: &resource.model,
            permission_name,
            group_urn: group_urn.as_deref(),
            parent_urn: parent_urn.as_deref(),
            model_role: None,
            token,
        };
        let expanded = expand(&text, &ctx);
        if contains_error(&expanded) {
            tracing::error!(name, "Policy contains one or more errors and cannot be processed");
            tracing::debug!(policy = %expanded);
            return Ok(None);
        }

        let mut policy: Policy = match serde_json::from_str(&expanded) {
            Ok(policy) => policy,
            Err(err) => {
                tracing::error!(name, error = %err, "Failed to parse assembled policy");
                tracing::debug!(policy = %expanded);
                return Ok(None);
            }
        };

        // Model-access roles are an alternative grant avenue, so their
        // patterns join the top rule's ANY set rather than forming rules of
        // their own.
        if let (Some(category), Some(schema)) = (category, schema.as_ref()) {
            let roles = schema
                .access
                .as_ref()
                .map(|a| a.roles.for_category(category))
                .unwrap_or_default();
            if !roles.is_empty()
                && let Some(top) = policy.rules.first_mut()
            {
                for role in roles {
                    if let Some(pattern) = self.model_access_pattern(actor, role) {
                        top.patterns.push(pattern);
                    }
                }
            }
        }

        if category != Some(PermissionCategory::Delete)
            && let Some(schema) = schema.as_ref()
        {
            let composed = self
                .composition_rules(actor, token, resource, &schema.fields, visited)
                .await?;
            policy.rules.extend(composed);
        }

        prune_rules(
            &mut policy.rules,
            group_urn.is_none(),
            parent_urn.is_none(),
            token.is_none(),
        );
        Ok(Some(policy))
    }

    async fn resolve_group_urn(
        &self,
        resource: &Record,
        schema: Option<&ModelSchema>,
    ) -> Option<String> {
        if !schema.is_some_and(|s| s.inherits(ModelCategory::Directory)) {
            return None;
        }
        let group = if let Some(path) = resource.group_path.as_deref() {
            self.store
                .find_by_path(None, models::GROUP, path, Some("data"), resource.organization_id)
                .await
                .unwrap_or_else(|err| {
                    tracing::error!(path, error = %err, "Group path lookup failed");
                    None
                })
        } else if let Some(group_id) = resource.group_id {
            self.store
                .read(models::GROUP, group_id)
                .await
                .unwrap_or_else(|err| {
                    tracing::error!(group_id, error = %err, "Group read failed");
                    None
                })
        } else {
            None
        };
        match group {
            Some(group) => group.urn,
            None => {
                tracing::error!(urn = ?resource.urn, "Group could not be found");
                None
            }
        }
    }

    async fn resolve_parent_urn(
        &self,
        resource: &Record,
        schema: Option<&ModelSchema>,
    ) -> Option<String> {
        if !schema.is_some_and(|s| s.inherits(ModelCategory::Parented)) {
            return None;
        }
        let parent = if let Some(parent_id) = resource.parent_id {
            self.store
                .read(&resource.model, parent_id)
                .await
                .unwrap_or_else(|err| {
                    tracing::error!(parent_id, error = %err, "Parent read failed");
                    None
                })
        } else if let Some(path) = resource.path.as_deref() {
            match path.rfind('/').filter(|&i| i > 0) {
                Some(idx) => self
                    .store
                    .find_by_path(None, &resource.model, &path[..idx], None, resource.organization_id)
                    .await
                    .unwrap_or_else(|err| {
                        tracing::error!(path, error = %err, "Parent path lookup failed");
                        None
                    }),
                None => None,
            }
        } else {
            None
        };
        parent.and_then(|p| p.urn)
    }

    /// Render a role-membership pattern from the model-access template.
    fn model_access_pattern(&self, actor: &Record, role: &str) -> Option<Pattern> {
        let template = TemplateStore::pattern("modelAccess")?;
        let text = expand_includes(template);
        let role_path = if role.starts_with('/') {
            role.to_string()
        } else {
            format!("/{role}")
        };
        let ctx = ExpandContext {
            actor_urn: actor.urn.as_deref().unwrap_or_default(),
            actor_type: &actor.model,
            model_role: Some(&role_path),
            ..ExpandContext::default()
        };
        let expanded = expand(&text, &ctx);
        match serde_json::from_str(&expanded) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::error!(role, error = %err, "Failed to parse model access pattern");
                None
            }
        }
    }

    /// Synthesize one rule per populated foreign reference, requiring read
    /// access to the referenced record. Visibility of a composite object
    /// thereby requires visibility of every embedded identity reference.
    async fn composition_rules(
        &self,
        actor: &Record,
        token: Option<&str>,
        resource: &Record,
        fields: &[FieldSchema],
        visited: &mut HashSet<String>,
    ) -> PolicyResult<Vec<Rule>> {
        let mut rules = Vec::new();
        for field in fields {
            if !field.foreign || !field.follow_reference {
                continue;
            }
            let Some(nested) = self.nested_record(resource, field).await else {
                continue;
            };
            if !nested.is_identity() {
                tracing::warn!(
                    field = %field.name,
                    "Skipping reference without an identity value"
                );
                continue;
            }
            if !visited.insert(nested.identifier()) {
                continue;
            }
            let read = self
                .assemble(POLICY_SYSTEM_READ_OBJECT, actor, token, &nested, visited)
                .await?;
            let Some(read) = read else {
                continue;
            };
            let Some(top) = read.rules.into_iter().next() else {
                continue;
            };
            if top.is_empty() {
                continue;
            }
            let mut rule = self.generic_rule()?;
            rule.name = Some(format!("{}ReadAccess", field.name));
            rule.condition = top.condition;
            rule.rules = top.rules;
            rule.patterns = top.patterns;
            rules.push(rule);
        }
        Ok(rules)
    }

    fn generic_rule(&self) -> PolicyResult<Rule> {
        let template = TemplateStore::rule("genericAll")
            .ok_or_else(|| PolicyError::value("Missing generic rule template"))?;
        Ok(serde_json::from_str(template)?)
    }

    /// Dereference a foreign field into its record, hydrating when the
    /// embedded value lacks identity fields.
    async fn nested_record(&self, resource: &Record, field: &FieldSchema) -> Option<Record> {
        let value = resource.get_field(&field.name)?;
        let model = match field.base_model.as_deref() {
            Some(models::SELF) => Some(resource.model.as_str()),
            Some(models::FLEX) | None => None,
            Some(other) => Some(other),
        };
        match value {
            Value::Object(_) => {
                let mut record: Record = serde_json::from_value(value.clone()).ok()?;
                if record.model.is_empty()
                    && let Some(model) = model
                {
                    record.model = model.to_string();
                }
                if record.urn.is_none() {
                    if let Err(err) = self.store.populate(&mut record, None).await {
                        tracing::error!(field = %field.name, error = %err, "Reference populate failed");
                    }
                }
                Some(record)
            }
            Value::Number(n) => {
                let id = n.as_i64()?;
                let model = model?;
                match self.store.read(model, id).await {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::error!(field = %field.name, error = %err, "Reference read failed");
                        None
                    }
                }
            }
            _ => None,
        }
    }

    // =========================================================================
    // Requests and evaluation
    // =========================================================================

    /// Derive a request from an assembled policy's parameter facts, sourcing
    /// the first parameter from the actor.
    #[must_use]
    pub fn policy_request(
        &self,
        policy: &Policy,
        context_user: &Record,
        actor: Option<&Record>,
    ) -> PolicyRequest {
        let mut facts: Vec<Fact> = policy.parameter_facts();
        if let Some(actor) = actor
            && let Some(first) = facts.first_mut()
        {
            first.source_urn = actor.urn.clone();
        }
        PolicyRequest {
            urn: policy.urn.clone(),
            context_user: Some(context_user.clone()),
            organization_path: policy
                .organization_path
                .clone()
                .or_else(|| context_user.organization_path.clone()),
            facts,
            verbose: false,
        }
    }

    /// Assemble and evaluate a system policy in one step.
    pub async fn evaluate_resource_policy(
        &self,
        context_user: &Record,
        policy_name: &str,
        actor: &Record,
        token: Option<&str>,
        resource: &Record,
    ) -> PolicyResult<PolicyResponse> {
        let policy = self
            .resource_policy(policy_name, actor, token, resource)
            .await?;
        let Some(policy) = policy else {
            return Ok(PolicyResponse {
                decision: Decision::InvalidArgument,
                message: Some(format!("Failed to assemble policy '{policy_name}'")),
                ..PolicyResponse::default()
            });
        };
        let request = self.policy_request(&policy, context_user, Some(actor));
        self.evaluator.evaluate(&request, Some(&policy)).await
    }

    pub async fn create_permitted(
        &self,
        context_user: &Record,
        actor: &Record,
        resource: &Record,
    ) -> PolicyResult<bool> {
        Ok(self
            .evaluate_resource_policy(context_user, POLICY_SYSTEM_CREATE_OBJECT, actor, None, resource)
            .await?
            .is_permit())
    }

    pub async fn read_permitted(
        &self,
        context_user: &Record,
        actor: &Record,
        resource: &Record,
    ) -> PolicyResult<bool> {
        Ok(self
            .evaluate_resource_policy(context_user, POLICY_SYSTEM_READ_OBJECT, actor, None, resource)
            .await?
            .is_permit())
    }

    pub async fn update_permitted(
        &self,
        context_user: &Record,
        actor: &Record,
        resource: &Record,
    ) -> PolicyResult<bool> {
        Ok(self
            .evaluate_resource_policy(context_user, POLICY_SYSTEM_UPDATE_OBJECT, actor, None, resource)
            .await?
            .is_permit())
    }

    pub async fn delete_permitted(
        &self,
        context_user: &Record,
        actor: &Record,
        resource: &Record,
    ) -> PolicyResult<bool> {
        Ok(self
            .evaluate_resource_policy(context_user, POLICY_SYSTEM_DELETE_OBJECT, actor, None, resource)
            .await?
            .is_permit())
    }

    pub async fn execute_permitted(
        &self,
        context_user: &Record,
        actor: &Record,
        resource: &Record,
    ) -> PolicyResult<bool> {
        Ok(self
            .evaluate_resource_policy(context_user, POLICY_SYSTEM_EXECUTE_OBJECT, actor, None, resource)
            .await?
            .is_permit())
    }

    // =========================================================================
    // Collection-level read authorization
    // =========================================================================

    /// Evaluate the read policy for every record a query's constrained
    /// identity, indexed, or access-controlled fields resolve to.
    ///
    /// When no field-level candidate applies and the model declares read
    /// roles, a single coarse evaluation against a blank instance is
    /// produced instead.
    pub async fn evaluate_query_responses(
        &self,
        context_user: &Record,
        query: &Query,
    ) -> PolicyResult<Vec<PolicyResponse>> {
        let mut responses = Vec::new();
        let Some(schema) = self.schemas.model_schema(&query.model) else {
            tracing::warn!(model = %query.model, "No schema for queried model");
            return Ok(responses);
        };

        let mut seen = HashSet::new();
        for field in &schema.fields {
            if !(field.identity || field.indexed || field.access.is_some()) {
                continue;
            }
            let values = query.field_values(&field.name);
            if values.is_empty() {
                continue;
            }
            let (model, property) = match field.base_model.as_deref() {
                Some(m) if m != models::SELF && m != models::FLEX => (
                    m.to_string(),
                    field
                        .base_property
                        .clone()
                        .unwrap_or_else(|| field.name.clone()),
                ),
                _ => (query.model.clone(), field.name.clone()),
            };
            for value in values {
                let sub = Query::new(model.clone())
                    .with_clause(property.clone(), (*value).clone())
                    .inspect();
                if !seen.insert(sub.key()) {
                    continue;
                }
                for record in self.store.find(&sub).await? {
                    responses.push(
                        self.evaluate_resource_policy(
                            context_user,
                            POLICY_SYSTEM_READ_OBJECT,
                            context_user,
                            None,
                            &record,
                        )
                        .await?,
                    );
                }
            }
        }

        if responses.is_empty() {
            let has_read_roles = schema
                .access
                .as_ref()
                .is_some_and(|a| !a.roles.read.is_empty());
            if has_read_roles {
                let blank = Record::new(query.model.clone());
                responses.push(
                    self.evaluate_resource_policy(
                        context_user,
                        POLICY_SYSTEM_READ_OBJECT,
                        context_user,
                        None,
                        &blank,
                    )
                    .await?,
                );
            }
        }
        Ok(responses)
    }

    /// Coarse boolean over [`Self::evaluate_query_responses`]: permitted
    /// only when at least one response exists and all are PERMIT.
    pub async fn query_read_permitted(
        &self,
        context_user: &Record,
        query: &Query,
    ) -> PolicyResult<bool> {
        let responses = self.evaluate_query_responses(context_user, query).await?;
        if responses.is_empty() {
            tracing::warn!(key = %query.key(), "No policy responses for query");
            return Ok(false);
        }
        let mut permitted = true;
        for response in &responses {
            if !response.is_permit() {
                tracing::error!(key = %query.key(), decision = ?response.decision, "Query read was not permitted");
                permitted = false;
            }
        }
        Ok(permitted)
    }

    // =========================================================================
    // Canned policies
    // =========================================================================

    /// Ownership-inference policy whose single pattern runs the embedded
    /// owner script against ad-hoc evaluation input.
    pub fn owner_inference_policy() -> PolicyResult<Policy> {
        let mut policy = Self::canned_policy("ownerFunction")?;
        let script = TemplateStore::function("ownerPolicy")
            .ok_or_else(|| PolicyError::value("Missing owner policy function"))?;
        let match_fact = Self::first_match_fact(&mut policy)?;
        match_fact.source_data = Some(script.to_string());
        Ok(policy)
    }

    /// Read-entitlement policy targeting the given record urn.
    pub fn read_policy(urn: &str) -> PolicyResult<Policy> {
        let mut policy = Self::canned_policy("readObject")?;
        Self::first_match_fact(&mut policy)?.source_urn = Some(urn.to_string());
        Ok(policy)
    }

    /// Admin-role membership policy targeting the given role urn.
    pub fn admin_policy(urn: &str) -> PolicyResult<Policy> {
        let mut policy = Self::canned_policy("adminRole")?;
        Self::first_match_fact(&mut policy)?.source_urn = Some(urn.to_string());
        Ok(policy)
    }

    fn canned_policy(name: &str) -> PolicyResult<Policy> {
        let template = TemplateStore::policy(name)
            .ok_or_else(|| PolicyError::value(format!("Missing policy template '{name}'")))?;
        Ok(serde_json::from_str(template)?)
    }

    fn first_match_fact(policy: &mut Policy) -> PolicyResult<&mut Fact> {
        policy
            .rules
            .first_mut()
            .and_then(|r| r.patterns.first_mut())
            .and_then(|p| p.match_fact.as_mut())
            .ok_or_else(|| PolicyError::value("Canned policy has no match fact"))
    }
}

// =============================================================================
// Pruning
// =============================================================================

/// Drop patterns whose facts still reference an unresolved placeholder, then
/// drop rules left with no children.
fn prune_rules(rules: &mut Vec<Rule>, prune_group: bool, prune_parent: bool, prune_token: bool) {
    for rule in rules.iter_mut() {
        prune_rules(&mut rule.rules, prune_group, prune_parent, prune_token);
        rule.patterns
            .retain(|p| keep_pattern(p, prune_group, prune_parent, prune_token));
    }
    rules.retain(|r| !r.is_empty());
}

fn keep_pattern(pattern: &Pattern, prune_group: bool, prune_parent: bool, prune_token: bool) -> bool {
    keep_fact(pattern.fact.as_ref(), prune_group, prune_parent, prune_token)
        && keep_fact(
            pattern.match_fact.as_ref(),
            prune_group,
            prune_parent,
            prune_token,
        )
}

fn keep_fact(fact: Option<&Fact>, prune_group: bool, prune_parent: bool, prune_token: bool) -> bool {
    let Some(surn) = fact.and_then(|f| f.source_urn.as_deref()) else {
        return true;
    };
    !((prune_group && surn.contains(GROUP_URN_MARKER))
        || (prune_parent && surn.contains(PARENT_URN_MARKER))
        || (prune_token && surn.contains(TOKEN_MARKER))
        || surn.contains(ERROR_MARKER))
}
