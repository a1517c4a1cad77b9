//! Policy evaluation engine.
//!
//! Walks the rule tree of a policy against the evidence supplied by a
//! [`PolicyRequest`], dispatching each pattern to a comparator, an
//! authorization primitive, a separation-of-duties check, or an operation.
//! Evaluation is fail-closed: anything that cannot be resolved produces an
//! error-class pattern result, and only an explicit condition success yields
//! PERMIT.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use registra_core::{Attribute, Record, models};
use registra_storage::{
    DutyConflictLookup, EntitlementCheck, MembershipCheck, ModelCategory, RecordStore,
    SchemaProvider,
};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::compare::compare;
use crate::error::{PolicyError, PolicyResult};
use crate::fact::{FactResolver, ReferenceCache};
use crate::model::{
    Comparator, Decision, Fact, FactKind, FunctionDef, OperationDef, OperationKind,
    OperationResult, Pattern, PatternKind, Policy, PolicyRequest, PolicyResponse, Rule, RuleKind,
    ScriptLanguage,
};
use crate::operation::OperationRegistry;
use crate::script::ScriptHost;

/// Evaluates policies against requests.
///
/// The evaluator is read-only over its collaborators and can be shared
/// across tasks behind an `Arc`.
pub struct PolicyEvaluator {
    store: Arc<dyn RecordStore>,
    scripts: Arc<dyn ScriptHost>,
    resolver: FactResolver,
    entitlements: Arc<dyn EntitlementCheck>,
    memberships: Arc<dyn MembershipCheck>,
    duties: Arc<dyn DutyConflictLookup>,
    schemas: Arc<dyn SchemaProvider>,
    operations: Arc<OperationRegistry>,
    trace: bool,
}

impl PolicyEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RecordStore>,
        scripts: Arc<dyn ScriptHost>,
        entitlements: Arc<dyn EntitlementCheck>,
        memberships: Arc<dyn MembershipCheck>,
        duties: Arc<dyn DutyConflictLookup>,
        schemas: Arc<dyn SchemaProvider>,
        operations: Arc<OperationRegistry>,
    ) -> Self {
        let resolver = FactResolver::new(store.clone(), scripts.clone());
        Self {
            store,
            scripts,
            resolver,
            entitlements,
            memberships,
            duties,
            schemas,
            operations,
            trace: false,
        }
    }

    /// Enable decision tracing: rule and pattern chains carry per-node
    /// results and evaluation steps log at info level.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    #[must_use]
    pub fn is_trace(&self) -> bool {
        self.trace
    }

    /// Shared fact resolver, for callers that pre-resolve evidence.
    #[must_use]
    pub fn resolver(&self) -> &FactResolver {
        &self.resolver
    }

    // =========================================================================
    // Request entry points
    // =========================================================================

    /// Evaluate a request against the persisted policy its URN names.
    pub async fn evaluate_request(&self, request: &PolicyRequest) -> PolicyResult<PolicyResponse> {
        tracing::info!(
            urn = ?request.urn,
            organization = ?request.organization_path,
            "Evaluating policy request"
        );
        let policy = self.load_policy(request).await;
        self.evaluate(request, policy.as_ref()).await
    }

    /// Evaluate a request against a supplied policy, falling back to a
    /// persisted lookup when none is given.
    pub async fn evaluate(
        &self,
        request: &PolicyRequest,
        policy: Option<&Policy>,
    ) -> PolicyResult<PolicyResponse> {
        let mut response = PolicyResponse::default();

        let loaded;
        let policy = match policy {
            Some(policy) => policy,
            None => {
                if request.urn.is_none() {
                    tracing::error!("Policy request urn is null");
                    response.decision = Decision::InvalidArgument;
                    response.message = Some("Policy request urn is null".into());
                    return Ok(response);
                }
                match self.load_policy(request).await {
                    Some(policy) => {
                        loaded = policy;
                        &loaded
                    }
                    None => {
                        tracing::error!(urn = ?request.urn, "Failed to retrieve policy from urn");
                        response.decision = Decision::InvalidArgument;
                        response.message = Some(format!(
                            "Failed to retrieve policy from urn '{}'",
                            request.urn.as_deref().unwrap_or_default()
                        ));
                        return Ok(response);
                    }
                }
            }
        };

        if request.verbose {
            response.description = Some(policy.describe());
        }
        response.urn = request.urn.clone().or_else(|| policy.urn.clone());
        response.expiry = Some(OffsetDateTime::now_utc() + Duration::seconds(policy.decision_age));

        if !policy.enabled {
            tracing::error!(urn = ?policy.urn, "Policy is disabled");
            response.decision = Decision::Disabled;
            response.message = Some("Policy is disabled".into());
            return Ok(response);
        }

        let refs = ReferenceCache::new();
        self.evaluate_policy(policy, request, &mut response, &refs)
            .await?;
        Ok(response)
    }

    async fn load_policy(&self, request: &PolicyRequest) -> Option<Policy> {
        let urn = request.urn.as_deref()?;
        let mut record = match self.store.find_by_urn(urn).await {
            Ok(records) => records.into_iter().find(|r| r.model == models::POLICY)?,
            Err(err) => {
                tracing::error!(urn, error = %err, "Policy lookup failed");
                return None;
            }
        };
        if let Err(err) = self.store.populate(&mut record, None).await {
            tracing::error!(urn, error = %err, "Policy populate failed");
            return None;
        }
        match Policy::from_record(&record) {
            Ok(policy) => Some(policy),
            Err(err) => {
                tracing::error!(urn, error = %err, "Policy record is malformed");
                None
            }
        }
    }

    // =========================================================================
    // Tree walk
    // =========================================================================

    async fn evaluate_policy(
        &self,
        policy: &Policy,
        request: &PolicyRequest,
        response: &mut PolicyResponse,
        refs: &ReferenceCache,
    ) -> PolicyResult<()> {
        let condition = policy.condition;
        if self.trace {
            tracing::info!(urn = ?policy.urn, ?condition, "Evaluating policy");
        }

        let size = policy.rules.len();
        let mut pass = 0;
        for rule in &policy.rules {
            if self.evaluate_rule_boxed(rule, request, response, refs).await? {
                pass += 1;
                if condition == crate::model::Condition::Any {
                    if self.trace {
                        tracing::info!(?condition, "Breaking on policy condition");
                    }
                    break;
                }
            } else if condition == crate::model::Condition::All {
                if self.trace {
                    tracing::info!("Policy rule failed evaluation");
                }
                break;
            }
        }

        let success = condition.succeeds(pass, size);
        if self.trace {
            tracing::info!(urn = ?policy.urn, ?condition, pass, size, success, "Evaluation result");
        }

        if success {
            response.score += policy.score;
            response.decision = Decision::Permit;
        } else {
            response.decision = Decision::Deny;
        }
        Ok(())
    }

    fn evaluate_rule_boxed<'a>(
        &'a self,
        rule: &'a Rule,
        request: &'a PolicyRequest,
        response: &'a mut PolicyResponse,
        refs: &'a ReferenceCache,
    ) -> Pin<Box<dyn Future<Output = PolicyResult<bool>> + Send + 'a>> {
        Box::pin(self.evaluate_rule(rule, request, response, refs))
    }

    async fn evaluate_rule(
        &self,
        rule: &Rule,
        request: &PolicyRequest,
        response: &mut PolicyResponse,
        refs: &ReferenceCache,
    ) -> PolicyResult<bool> {
        let condition = rule.condition;
        if self.trace {
            tracing::info!(urn = ?rule.urn, kind = ?rule.kind, ?condition, "Evaluating rule");
        }

        let size = rule.rules.len() + rule.patterns.len();
        let mut pass = 0;
        let mut short_circuit = false;

        for child in &rule.rules {
            if self.evaluate_rule_boxed(child, request, response, refs).await? {
                pass += 1;
                if condition == crate::model::Condition::Any {
                    short_circuit = true;
                    break;
                }
            } else if condition == crate::model::Condition::All {
                short_circuit = true;
                break;
            }
        }
        if !short_circuit {
            for pattern in &rule.patterns {
                if self
                    .evaluate_pattern(rule, pattern, request, response, refs)
                    .await?
                {
                    pass += 1;
                    if condition == crate::model::Condition::Any {
                        break;
                    }
                } else if condition == crate::model::Condition::All {
                    break;
                }
            }
        }

        let mut success = condition.succeeds(pass, size);
        if rule.kind == RuleKind::Deny {
            if self.trace {
                tracing::info!("Inverting rule success for deny rule");
            }
            success = !success;
        }
        if success {
            response.score += rule.score;
        }

        if self.trace {
            tracing::info!(urn = ?rule.urn, kind = ?rule.kind, success, "Evaluated rule");
            response.rule_chain.push(format!("{} ({success})", rule.label()));
        } else {
            response.rule_chain.push(rule.label());
        }
        Ok(success)
    }

    async fn evaluate_pattern(
        &self,
        rule: &Rule,
        pattern: &Pattern,
        request: &PolicyRequest,
        response: &mut PolicyResponse,
        refs: &ReferenceCache,
    ) -> PolicyResult<bool> {
        if self.trace {
            tracing::info!(urn = ?pattern.urn, kind = ?pattern.kind, "Evaluating pattern");
        }

        let fact = pattern
            .fact
            .as_ref()
            .ok_or_else(|| PolicyError::missing_fact("source"))?;
        let match_fact = pattern
            .match_fact
            .as_ref()
            .ok_or_else(|| PolicyError::missing_fact("match"))?;

        // Parameter facts are stand-ins: the request supplies the real
        // evidence under the same urn.
        let fact = Self::fact_parameter(fact, &request.facts);

        let result = match pattern.kind {
            PatternKind::Parameter => OperationResult::Succeeded,
            PatternKind::Operation => {
                self.evaluate_operation(
                    request,
                    pattern,
                    fact,
                    match_fact,
                    pattern.operation.as_deref(),
                    pattern.operation_urn.as_deref(),
                )
                .await?
            }
            PatternKind::Expression => {
                self.evaluate_expression(request, pattern, fact, match_fact, refs)
                    .await?
            }
            PatternKind::Authorization => {
                self.evaluate_authorization(request, fact, match_fact, refs)
                    .await?
            }
            PatternKind::SeparationOfDuty => {
                self.evaluate_separation_of_duty(request, fact, match_fact, refs)
                    .await?
            }
            PatternKind::Unknown => match match_fact.kind {
                FactKind::Operation => {
                    self.evaluate_operation(
                        request,
                        pattern,
                        fact,
                        match_fact,
                        None,
                        match_fact.source_url.as_deref(),
                    )
                    .await?
                }
                FactKind::Function => {
                    self.evaluate_fact_function(request, response, fact, match_fact)
                        .await?
                }
                _ => {
                    tracing::error!(kind = ?pattern.kind, "Pattern type not supported");
                    OperationResult::Unknown
                }
            },
        };

        let success = result == OperationResult::Succeeded;
        if success {
            response.score += pattern.score;
        }

        if self.trace {
            tracing::info!(urn = ?pattern.urn, kind = ?pattern.kind, success, "Evaluated pattern");
            response
                .pattern_chain
                .push(format!("{}/{} ({success})", rule.label(), pattern.label()));
        } else {
            response.pattern_chain.push(pattern.label());
        }
        Ok(success)
    }

    /// Swap a parameter fact for the request-supplied fact with the same urn.
    fn fact_parameter<'a>(fact: &'a Fact, supplied: &'a [Fact]) -> &'a Fact {
        if fact.kind != FactKind::Parameter {
            return fact;
        }
        supplied
            .iter()
            .find(|f| f.kind == FactKind::Parameter && f.urn.is_some() && f.urn == fact.urn)
            .unwrap_or(fact)
    }

    // =========================================================================
    // Pattern dispatch targets
    // =========================================================================

    async fn evaluate_expression(
        &self,
        request: &PolicyRequest,
        pattern: &Pattern,
        fact: &Fact,
        match_fact: &Fact,
        refs: &ReferenceCache,
    ) -> PolicyResult<OperationResult> {
        let checked = self
            .resolver
            .get_fact_value(request, fact, match_fact, refs)
            .await;
        let expected = self
            .resolver
            .get_match_fact_value(request, fact, match_fact)
            .await?;
        let comparator = pattern.comparator.unwrap_or(Comparator::Unknown);
        if compare(checked.as_deref(), comparator, expected.as_deref()) {
            Ok(OperationResult::Succeeded)
        } else {
            Ok(OperationResult::Failed)
        }
    }

    async fn evaluate_authorization(
        &self,
        request: &PolicyRequest,
        fact: &Fact,
        match_fact: &Fact,
        refs: &ReferenceCache,
    ) -> PolicyResult<OperationResult> {
        let (Some(ftype), Some(mtype)) =
            (fact.model_type.as_deref(), match_fact.model_type.as_deref())
        else {
            tracing::error!("Expected both fact and match fact to define a model type");
            return Ok(OperationResult::Error);
        };
        let context_user = request.context_user.as_ref();

        let principal = self
            .resolver
            .resolve_reference(context_user, fact, match_fact, refs)
            .await;
        let target = self
            .resolver
            .resolve_reference(context_user, match_fact, match_fact, refs)
            .await;
        let (Some(principal), Some(target)) = (principal, target) else {
            // Assembled policies may carry conditions that do not apply to
            // the object at hand, so an unresolved side is only traced.
            if self.trace {
                tracing::error!(
                    fact = ?fact.urn,
                    match_fact = ?match_fact.urn,
                    "Authorization fact reference was null"
                );
            }
            return Ok(OperationResult::Error);
        };

        match match_fact.kind {
            FactKind::Permission => {
                let permission = self
                    .resolve_permission(context_user, ftype, mtype, match_fact, &target)
                    .await?;
                let Some(permission) = permission else {
                    tracing::error!("Permission reference does not exist");
                    return Ok(OperationResult::Error);
                };
                let granted = self
                    .entitlements
                    .check_entitlement(&principal, &permission, &target)
                    .await?;
                if self.trace {
                    tracing::info!(
                        principal = ?principal.urn,
                        permission = ?permission.urn,
                        target = ?target.urn,
                        granted,
                        "Evaluated permission authorization"
                    );
                }
                if granted {
                    Ok(OperationResult::Succeeded)
                } else {
                    Ok(OperationResult::Failed)
                }
            }
            FactKind::Role if mtype == models::ROLE => {
                let member = self.memberships.is_member(&principal, &target, true).await?;
                if self.trace {
                    tracing::info!(
                        principal = ?principal.urn,
                        role = ?target.urn,
                        member,
                        "Evaluated role authorization"
                    );
                }
                if member {
                    Ok(OperationResult::Succeeded)
                } else {
                    Ok(OperationResult::Failed)
                }
            }
            _ => Ok(OperationResult::Unknown),
        }
    }

    /// Resolve the permission record an authorization match fact names.
    ///
    /// `fact_data` may be absent (the target itself is the permission), a
    /// numeric id, a permission path, or a URN. For path lookups against
    /// permission or role data types the category is stipulated from the
    /// actor's model type, since assembled policies write it generically.
    async fn resolve_permission(
        &self,
        context_user: Option<&Record>,
        ftype: &str,
        mtype: &str,
        match_fact: &Fact,
        target: &Record,
    ) -> PolicyResult<Option<Record>> {
        let Some(fdata) = match_fact.fact_data.as_deref() else {
            if mtype == models::PERMISSION {
                return Ok(Some(target.clone()));
            }
            return Ok(None);
        };

        if !fdata.is_empty() && fdata.bytes().all(|b| b.is_ascii_digit()) {
            let id: i64 = fdata
                .parse()
                .map_err(|_| PolicyError::value(format!("Invalid permission id '{fdata}'")))?;
            let model = match_fact
                .fact_data_type
                .as_deref()
                .unwrap_or(models::PERMISSION);
            return Ok(self.store.read(model, id).await?);
        }

        if fdata.contains('/') {
            let mut fdtype = match_fact.fact_data_type.as_deref().unwrap_or_default();
            if fdtype == models::PERMISSION || fdtype == models::ROLE {
                fdtype = ftype;
            }
            let category = fdtype.rsplit('.').next().unwrap_or(fdtype);
            let organization_id = context_user.and_then(|u| u.organization_id);
            if self.trace {
                tracing::info!(category, path = fdata, "Find permission by path");
            }
            return Ok(self
                .store
                .find_by_path(
                    context_user,
                    models::PERMISSION,
                    fdata,
                    Some(category),
                    organization_id,
                )
                .await?);
        }

        Ok(self.store.find_by_urn(fdata).await?.into_iter().next())
    }

    async fn evaluate_separation_of_duty(
        &self,
        request: &PolicyRequest,
        fact: &Fact,
        match_fact: &Fact,
        refs: &ReferenceCache,
    ) -> PolicyResult<OperationResult> {
        let context_user = request.context_user.as_ref();
        let principal = self
            .resolver
            .resolve_reference(context_user, fact, match_fact, refs)
            .await;
        let group = self
            .resolver
            .resolve_reference(context_user, match_fact, match_fact, refs)
            .await;
        let (Some(principal), Some(group)) = (principal, group) else {
            return Ok(OperationResult::Error);
        };

        let principal_schema = self.schemas.model_schema(&principal.model);
        let principal_ok = principal_schema.as_ref().is_some_and(|s| {
            s.inherits(ModelCategory::Account) || s.inherits(ModelCategory::Person)
        });
        if !principal_ok {
            tracing::error!(model = %principal.model, "Source fact of account or person is expected");
            return Ok(OperationResult::Error);
        }
        let group_ok = self
            .schemas
            .model_schema(&group.model)
            .is_some_and(|s| s.inherits(ModelCategory::Group));
        if !group_ok {
            tracing::error!(model = %group.model, "Match fact of group is expected");
            return Ok(OperationResult::Error);
        }
        let Some(group_urn) = group.urn.as_deref() else {
            tracing::error!("Activity group has no urn");
            return Ok(OperationResult::Error);
        };

        let permissions = self
            .duties
            .activity_permissions_for(group_urn, &principal)
            .await?;
        if permissions.is_empty() {
            Ok(OperationResult::Failed)
        } else {
            Ok(OperationResult::Succeeded)
        }
    }

    async fn evaluate_operation(
        &self,
        request: &PolicyRequest,
        pattern: &Pattern,
        fact: &Fact,
        match_fact: &Fact,
        native: Option<&str>,
        operation_urn: Option<&str>,
    ) -> PolicyResult<OperationResult> {
        if let Some(name) = native {
            return Ok(match self.operations.get(name) {
                Some(op) => op.operate(request, pattern, fact, match_fact).await,
                None => {
                    tracing::error!(name, "Operation is not registered");
                    OperationResult::Error
                }
            });
        }
        let Some(urn) = operation_urn else {
            tracing::error!("Operation is null");
            return Ok(OperationResult::Error);
        };

        tracing::debug!(urn, "Evaluating operation");
        let record = self
            .store
            .find_by_urn(urn)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PolicyError::value("Operation is null"))?;
        let def = OperationDef::from_record(&record)?;

        match def.kind {
            OperationKind::Internal => {
                let Some(name) = def.operation.as_deref() else {
                    tracing::error!(urn, "Operation record names no implementation");
                    return Ok(OperationResult::Error);
                };
                Ok(match self.operations.get(name) {
                    Some(op) => op.operate(request, pattern, fact, match_fact).await,
                    None => {
                        tracing::error!(name, "Operation is not registered");
                        OperationResult::Error
                    }
                })
            }
            OperationKind::Function => {
                let func_urn = def
                    .operation
                    .as_deref()
                    .ok_or_else(|| PolicyError::value("Operation function is null"))?;
                let func_record = self
                    .store
                    .find_by_urn(func_urn)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        PolicyError::value(format!("Operation function '{func_urn}' is null"))
                    })?;
                let func = FunctionDef::from_record(&func_record)?;
                if func.language != ScriptLanguage::Javascript {
                    tracing::warn!(urn = func_urn, language = ?func.language, "Ignoring non-JavaScript function");
                    return Ok(OperationResult::Error);
                }
                let Some(body) = func.source else {
                    tracing::error!(urn = func_urn, "Function has no source");
                    return Ok(OperationResult::Error);
                };
                let mut bindings = serde_json::Map::new();
                bindings.insert("pattern".into(), serde_json::to_value(pattern)?);
                bindings.insert("fact".into(), serde_json::to_value(fact)?);
                bindings.insert("match".into(), serde_json::to_value(match_fact)?);
                bindings.insert(
                    "contextUser".into(),
                    match &request.context_user {
                        Some(user) => serde_json::to_value(user)?,
                        None => Value::Null,
                    },
                );
                let result = self.scripts.run(&body, &bindings)?;
                Ok(match result {
                    Value::String(s) => OperationResult::from_sentinel(&s),
                    Value::Null => OperationResult::Error,
                    other => OperationResult::from_sentinel(&other.to_string()),
                })
            }
            OperationKind::Unknown => {
                tracing::error!(urn, "Unhandled operation type");
                Ok(OperationResult::Unknown)
            }
        }
    }

    /// Evaluate a scripted match fact and record its output as a response
    /// attribute.
    async fn evaluate_fact_function(
        &self,
        request: &PolicyRequest,
        response: &mut PolicyResponse,
        fact: &Fact,
        match_fact: &Fact,
    ) -> PolicyResult<OperationResult> {
        let value = self
            .resolver
            .get_match_fact_value(request, fact, match_fact)
            .await?;
        let Some(value) = value else {
            tracing::error!("No value returned from the function");
            return Ok(OperationResult::Failed);
        };
        tracing::info!(value = %value, "Received function value");
        response.attributes.push(Attribute::new(
            match_fact.name.clone().unwrap_or_default(),
            value.clone(),
        ));
        Ok(OperationResult::from_sentinel(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Condition;
    use crate::testutil::{
        MockDuties, MockEntitlements, MockMemberships, MockSchemas, MockScriptHost, MockStore,
    };
    use registra_storage::ModelSchema;
    use serde_json::json;

    struct Fixture {
        records: Vec<Record>,
        entitlements: Arc<MockEntitlements>,
        memberships: Arc<MockMemberships>,
        duties: Arc<MockDuties>,
        schemas: Arc<MockSchemas>,
        script_result: Value,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                records: Vec::new(),
                entitlements: MockEntitlements::denying(),
                memberships: MockMemberships::empty(),
                duties: MockDuties::empty(),
                schemas: MockSchemas::empty(),
                script_result: Value::Null,
            }
        }
    }

    impl Fixture {
        fn build(self) -> PolicyEvaluator {
            let store = MockStore::with_records(self.records);
            let operations = Arc::new(OperationRegistry::with_builtins(store.clone()));
            PolicyEvaluator::new(
                store,
                Arc::new(MockScriptHost::returning(self.script_result)),
                self.entitlements,
                self.memberships,
                self.duties,
                self.schemas,
                operations,
            )
        }
    }

    fn expression_pattern(urn: &str, comparator: Comparator, expected: &str) -> Pattern {
        Pattern {
            urn: Some(urn.into()),
            kind: PatternKind::Expression,
            comparator: Some(comparator),
            fact: Some(Fact {
                urn: Some(format!("{urn}:fact")),
                kind: FactKind::Parameter,
                ..Fact::default()
            }),
            match_fact: Some(Fact {
                kind: FactKind::Static,
                fact_data: Some(expected.into()),
                ..Fact::default()
            }),
            score: 1,
            ..Pattern::default()
        }
    }

    fn supplied_fact(urn: &str, data: &str) -> Fact {
        Fact {
            urn: Some(urn.into()),
            kind: FactKind::Parameter,
            fact_data: Some(data.into()),
            ..Fact::default()
        }
    }

    fn age_country_policy() -> Policy {
        Policy {
            urn: Some("urn:registra:policy:ageCountry".into()),
            condition: Condition::All,
            decision_age: 300,
            score: 10,
            rules: vec![Rule {
                urn: Some("urn:registra:rule:ageCountry".into()),
                kind: RuleKind::Permit,
                condition: Condition::All,
                score: 1,
                patterns: vec![
                    expression_pattern(
                        "urn:registra:pattern:age",
                        Comparator::GreaterThanOrEquals,
                        "21",
                    ),
                    expression_pattern("urn:registra:pattern:country", Comparator::Equals, "US"),
                ],
                ..Rule::default()
            }],
            ..Policy::default()
        }
    }

    #[tokio::test]
    async fn test_all_policy_permits_when_every_pattern_passes() {
        let evaluator = Fixture::default().build();
        let request = PolicyRequest {
            facts: vec![
                supplied_fact("urn:registra:pattern:age:fact", "30"),
                supplied_fact("urn:registra:pattern:country:fact", "US"),
            ],
            ..PolicyRequest::default()
        };
        let response = evaluator
            .evaluate(&request, Some(&age_country_policy()))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Permit);
        // policy 10 + rule 1 + two patterns
        assert_eq!(response.score, 13);
        assert_eq!(response.pattern_chain.len(), 2);
        assert!(!response.is_expired());
    }

    #[tokio::test]
    async fn test_all_rule_short_circuits_on_first_failure() {
        let evaluator = Fixture::default().build();
        let request = PolicyRequest {
            facts: vec![
                supplied_fact("urn:registra:pattern:age:fact", "18"),
                supplied_fact("urn:registra:pattern:country:fact", "US"),
            ],
            ..PolicyRequest::default()
        };
        let response = evaluator
            .evaluate(&request, Some(&age_country_policy()))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Deny);
        // second pattern never evaluated
        assert_eq!(response.pattern_chain, vec!["urn:registra:pattern:age"]);
        assert_eq!(response.score, 0);
    }

    #[tokio::test]
    async fn test_trace_annotates_chains() {
        let mut evaluator = Fixture::default().build();
        evaluator.set_trace(true);
        let request = PolicyRequest {
            facts: vec![
                supplied_fact("urn:registra:pattern:age:fact", "30"),
                supplied_fact("urn:registra:pattern:country:fact", "US"),
            ],
            ..PolicyRequest::default()
        };
        let response = evaluator
            .evaluate(&request, Some(&age_country_policy()))
            .await
            .unwrap();
        assert_eq!(
            response.rule_chain,
            vec!["urn:registra:rule:ageCountry (true)"]
        );
        assert_eq!(
            response.pattern_chain[0],
            "urn:registra:rule:ageCountry/urn:registra:pattern:age (true)"
        );
    }

    #[tokio::test]
    async fn test_deny_rule_inverts_condition_result() {
        let mut policy = age_country_policy();
        policy.rules[0].kind = RuleKind::Deny;
        let evaluator = Fixture::default().build();
        let request = PolicyRequest {
            facts: vec![
                supplied_fact("urn:registra:pattern:age:fact", "18"),
                supplied_fact("urn:registra:pattern:country:fact", "US"),
            ],
            ..PolicyRequest::default()
        };
        let response = evaluator.evaluate(&request, Some(&policy)).await.unwrap();
        assert_eq!(response.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_disabled_policy() {
        let mut policy = age_country_policy();
        policy.enabled = false;
        let evaluator = Fixture::default().build();
        let response = evaluator
            .evaluate(&PolicyRequest::default(), Some(&policy))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Disabled);
        assert_eq!(response.message.as_deref(), Some("Policy is disabled"));
    }

    #[tokio::test]
    async fn test_missing_policy_is_invalid_argument() {
        let evaluator = Fixture::default().build();
        let request = PolicyRequest {
            urn: Some("urn:registra:policy:missing".into()),
            ..PolicyRequest::default()
        };
        let response = evaluator.evaluate(&request, None).await.unwrap();
        assert_eq!(response.decision, Decision::InvalidArgument);
    }

    #[tokio::test]
    async fn test_missing_pattern_fact_is_an_error() {
        let mut policy = age_country_policy();
        policy.rules[0].patterns[0].fact = None;
        let evaluator = Fixture::default().build();
        let result = evaluator.evaluate(&PolicyRequest::default(), Some(&policy)).await;
        assert!(result.is_err());
    }

    fn authz_fixture(granted: bool) -> (PolicyEvaluator, Policy, PolicyRequest) {
        let actor = Record::new(models::USER)
            .with_id(1)
            .with_urn("urn:registra:user:alice");
        let mut perm = Record::new(models::PERMISSION).with_urn("urn:registra:permission:read");
        perm.path = Some("/systemReadObject".into());
        let resource = Record::new("data").with_urn("urn:registra:data:report");

        let entitlements = if granted {
            MockEntitlements::granting(vec![(
                "urn:registra:user:alice",
                "urn:registra:permission:read",
                "urn:registra:data:report",
            )])
        } else {
            MockEntitlements::denying()
        };
        let evaluator = Fixture {
            records: vec![actor.clone(), perm, resource],
            entitlements,
            ..Fixture::default()
        }
        .build();

        let policy = Policy {
            urn: Some("urn:registra:policy:readAccess".into()),
            condition: Condition::All,
            score: 1,
            rules: vec![Rule {
                urn: Some("urn:registra:rule:readAccess".into()),
                condition: Condition::All,
                patterns: vec![Pattern {
                    urn: Some("urn:registra:pattern:readAccess".into()),
                    kind: PatternKind::Authorization,
                    fact: Some(Fact {
                        urn: Some("urn:registra:fact:parameter:actor".into()),
                        kind: FactKind::Parameter,
                        model_type: Some(models::USER.into()),
                        source_urn: Some("urn:registra:user:alice".into()),
                        ..Fact::default()
                    }),
                    match_fact: Some(Fact {
                        kind: FactKind::Permission,
                        model_type: Some("data".into()),
                        source_urn: Some("urn:registra:data:report".into()),
                        fact_data: Some("/systemReadObject".into()),
                        fact_data_type: Some(models::PERMISSION.into()),
                        ..Fact::default()
                    }),
                    score: 1,
                    ..Pattern::default()
                }],
                ..Rule::default()
            }],
            ..Policy::default()
        };
        let request = PolicyRequest {
            context_user: Some(actor),
            ..PolicyRequest::default()
        };
        (evaluator, policy, request)
    }

    #[tokio::test]
    async fn test_permission_authorization_grant_permits() {
        let (evaluator, policy, request) = authz_fixture(true);
        let response = evaluator.evaluate(&request, Some(&policy)).await.unwrap();
        assert_eq!(response.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_permission_authorization_denial_denies() {
        let (evaluator, policy, request) = authz_fixture(false);
        let response = evaluator.evaluate(&request, Some(&policy)).await.unwrap();
        assert_eq!(response.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_unresolved_authorization_reference_fails_closed() {
        let (evaluator, mut policy, request) = authz_fixture(true);
        // point the match fact at a record that does not exist
        policy.rules[0].patterns[0]
            .match_fact
            .as_mut()
            .unwrap()
            .source_urn = Some("urn:registra:data:missing".into());
        let response = evaluator.evaluate(&request, Some(&policy)).await.unwrap();
        assert_eq!(response.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_role_authorization_membership() {
        let actor = Record::new(models::USER).with_urn("urn:registra:user:alice");
        let role = Record::new(models::ROLE).with_urn("urn:registra:role:admin");
        let evaluator = Fixture {
            records: vec![actor.clone(), role],
            memberships: MockMemberships::with_members(vec![(
                "urn:registra:user:alice",
                "urn:registra:role:admin",
            )]),
            ..Fixture::default()
        }
        .build();
        let policy = Policy {
            condition: Condition::All,
            rules: vec![Rule {
                condition: Condition::All,
                patterns: vec![Pattern {
                    kind: PatternKind::Authorization,
                    fact: Some(Fact {
                        kind: FactKind::Parameter,
                        model_type: Some(models::USER.into()),
                        source_urn: Some("urn:registra:user:alice".into()),
                        ..Fact::default()
                    }),
                    match_fact: Some(Fact {
                        kind: FactKind::Role,
                        model_type: Some(models::ROLE.into()),
                        source_urn: Some("urn:registra:role:admin".into()),
                        ..Fact::default()
                    }),
                    ..Pattern::default()
                }],
                ..Rule::default()
            }],
            ..Policy::default()
        };
        let request = PolicyRequest {
            context_user: Some(actor),
            ..PolicyRequest::default()
        };
        let response = evaluator.evaluate(&request, Some(&policy)).await.unwrap();
        assert_eq!(response.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_separation_of_duty() {
        let person = Record::new(models::PERSON).with_urn("urn:registra:person:alice");
        let group = Record::new(models::GROUP).with_urn("urn:registra:group:approvers");
        let schemas = MockSchemas::with_schemas(vec![
            ModelSchema {
                name: models::PERSON.into(),
                categories: vec![ModelCategory::Person],
                fields: vec![],
                access: None,
            },
            ModelSchema {
                name: models::GROUP.into(),
                categories: vec![ModelCategory::Group],
                fields: vec![],
                access: None,
            },
        ]);
        let evaluator = Fixture {
            records: vec![person, group],
            duties: MockDuties::with_permissions(vec![(
                "urn:registra:group:approvers",
                "urn:registra:person:alice",
                vec![4, 9],
            )]),
            schemas,
            ..Fixture::default()
        }
        .build();
        let policy = Policy {
            condition: Condition::All,
            rules: vec![Rule {
                condition: Condition::All,
                patterns: vec![Pattern {
                    kind: PatternKind::SeparationOfDuty,
                    fact: Some(Fact {
                        kind: FactKind::Static,
                        model_type: Some(models::PERSON.into()),
                        source_urn: Some("urn:registra:person:alice".into()),
                        ..Fact::default()
                    }),
                    match_fact: Some(Fact {
                        kind: FactKind::Static,
                        model_type: Some(models::GROUP.into()),
                        source_urn: Some("urn:registra:group:approvers".into()),
                        ..Fact::default()
                    }),
                    ..Pattern::default()
                }],
                ..Rule::default()
            }],
            ..Policy::default()
        };
        let response = evaluator
            .evaluate(&PolicyRequest::default(), Some(&policy))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_native_operation_pattern() {
        let actor = Record::new(models::USER)
            .with_id(7)
            .with_urn("urn:registra:user:alice");
        let mut data = Record::new("data").with_id(3).with_urn("urn:registra:data:report");
        data.owner_id = Some(7);
        let evaluator = Fixture {
            records: vec![actor.clone(), data],
            ..Fixture::default()
        }
        .build();
        let policy = Policy {
            condition: Condition::All,
            rules: vec![Rule {
                condition: Condition::All,
                patterns: vec![Pattern {
                    kind: PatternKind::Operation,
                    operation: Some(crate::operation::OP_OWNER_CHECK.into()),
                    fact: Some(Fact {
                        kind: FactKind::Parameter,
                        model_type: Some(models::USER.into()),
                        source_urn: Some("urn:registra:user:alice".into()),
                        ..Fact::default()
                    }),
                    match_fact: Some(Fact {
                        kind: FactKind::Static,
                        model_type: Some("data".into()),
                        source_urn: Some("urn:registra:data:report".into()),
                        ..Fact::default()
                    }),
                    ..Pattern::default()
                }],
                ..Rule::default()
            }],
            ..Policy::default()
        };
        let request = PolicyRequest {
            context_user: Some(actor),
            ..PolicyRequest::default()
        };
        let response = evaluator.evaluate(&request, Some(&policy)).await.unwrap();
        assert_eq!(response.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_function_fact_records_attribute() {
        let evaluator = Fixture {
            script_result: json!("SUCCEEDED"),
            ..Fixture::default()
        }
        .build();
        let policy = Policy {
            condition: Condition::All,
            rules: vec![Rule {
                condition: Condition::All,
                patterns: vec![Pattern {
                    kind: PatternKind::Unknown,
                    fact: Some(Fact {
                        kind: FactKind::Parameter,
                        ..Fact::default()
                    }),
                    match_fact: Some(Fact {
                        name: Some("ownerInferenceFunction".into()),
                        kind: FactKind::Function,
                        source_data: Some("return 'SUCCEEDED';".into()),
                        ..Fact::default()
                    }),
                    ..Pattern::default()
                }],
                ..Rule::default()
            }],
            ..Policy::default()
        };
        let response = evaluator
            .evaluate(&PolicyRequest::default(), Some(&policy))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Permit);
        assert_eq!(response.attributes.len(), 1);
        assert_eq!(response.attributes[0].name, "ownerInferenceFunction");
        assert_eq!(response.attributes[0].value, "SUCCEEDED");
    }
}
