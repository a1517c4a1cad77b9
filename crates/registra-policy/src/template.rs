//! Resource templates and placeholder expansion.
//!
//! Policy templates are JSON documents with two placeholder layers:
//!
//! - Include families `"${rule.X}"`, `"${pattern.X}"`, `"${fact.X}"` inline
//!   a named sub-resource in place of the quoted marker, recursively.
//! - Scalar placeholders (`${actorUrn}`, `${resourceUrn}`, `${token}`, ...)
//!   are substituted textually from an [`ExpandContext`].
//!
//! The substitution pass is deliberately textual for fidelity with the
//! template documents; [`expand`] is a pure function so it can be tested
//! apart from parsing. An include that cannot be resolved leaves the
//! `${error}` sentinel behind, which the assembler treats as fail-closed.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;

// =============================================================================
// Template names and markers
// =============================================================================

pub const POLICY_SYSTEM_CREATE_OBJECT: &str = "systemCreateObject";
pub const POLICY_SYSTEM_READ_OBJECT: &str = "systemReadObject";
pub const POLICY_SYSTEM_UPDATE_OBJECT: &str = "systemUpdateObject";
pub const POLICY_SYSTEM_DELETE_OBJECT: &str = "systemDeleteObject";
pub const POLICY_SYSTEM_EXECUTE_OBJECT: &str = "systemExecuteObject";

/// Placeholder a fact keeps when the resource's group could not be resolved.
pub const GROUP_URN_MARKER: &str = "${resourceGroupUrn}";
/// Placeholder a fact keeps when the resource's parent could not be resolved.
pub const PARENT_URN_MARKER: &str = "${resourceParentUrn}";
/// Placeholder a fact keeps when no access token was supplied.
pub const TOKEN_MARKER: &str = "${token}";
/// Fail-closed sentinel left by unresolved includes.
pub const ERROR_MARKER: &str = "${error}";

/// Placeholder for the evaluation context user in fact source URNs.
pub const CONTEXT_USER_MARKER: &str = "${contextUser}";

static RULE_INCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""\$\{rule\.([A-Za-z0-9]+)\}""#).unwrap_or_else(|_| unreachable!())
});
static PATTERN_INCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""\$\{pattern\.([A-Za-z0-9]+)\}""#).unwrap_or_else(|_| unreachable!())
});
static FACT_INCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""\$\{fact\.([A-Za-z0-9]+)\}""#).unwrap_or_else(|_| unreachable!())
});

// =============================================================================
// Template store
// =============================================================================

/// Embedded resource templates, addressed by family and name.
pub struct TemplateStore;

impl TemplateStore {
    #[must_use]
    pub fn policy(name: &str) -> Option<&'static str> {
        match name {
            POLICY_SYSTEM_CREATE_OBJECT => {
                Some(include_str!("../resources/policies/systemCreateObject.json"))
            }
            POLICY_SYSTEM_READ_OBJECT => {
                Some(include_str!("../resources/policies/systemReadObject.json"))
            }
            POLICY_SYSTEM_UPDATE_OBJECT => {
                Some(include_str!("../resources/policies/systemUpdateObject.json"))
            }
            POLICY_SYSTEM_DELETE_OBJECT => {
                Some(include_str!("../resources/policies/systemDeleteObject.json"))
            }
            POLICY_SYSTEM_EXECUTE_OBJECT => {
                Some(include_str!("../resources/policies/systemExecuteObject.json"))
            }
            "ownerFunction" => Some(include_str!("../resources/policies/ownerFunction.json")),
            "readObject" => Some(include_str!("../resources/policies/readObject.json")),
            "adminRole" => Some(include_str!("../resources/policies/adminRole.json")),
            _ => None,
        }
    }

    #[must_use]
    pub fn rule(name: &str) -> Option<&'static str> {
        match name {
            "objectAccess" => Some(include_str!("../resources/rules/objectAccess.json")),
            "genericAll" => Some(include_str!("../resources/rules/genericAll.json")),
            _ => None,
        }
    }

    #[must_use]
    pub fn pattern(name: &str) -> Option<&'static str> {
        match name {
            "ownerAccess" => Some(include_str!("../resources/patterns/ownerAccess.json")),
            "entitlementAccess" => {
                Some(include_str!("../resources/patterns/entitlementAccess.json"))
            }
            "groupEntitlementAccess" => {
                Some(include_str!("../resources/patterns/groupEntitlementAccess.json"))
            }
            "parentEntitlementAccess" => {
                Some(include_str!("../resources/patterns/parentEntitlementAccess.json"))
            }
            "tokenAccess" => Some(include_str!("../resources/patterns/tokenAccess.json")),
            "modelAccess" => Some(include_str!("../resources/patterns/modelAccess.json")),
            _ => None,
        }
    }

    #[must_use]
    pub fn fact(name: &str) -> Option<&'static str> {
        match name {
            "actorParameter" => Some(include_str!("../resources/facts/actorParameter.json")),
            "resourceReference" => Some(include_str!("../resources/facts/resourceReference.json")),
            _ => None,
        }
    }

    #[must_use]
    pub fn function(name: &str) -> Option<&'static str> {
        match name {
            "ownerPolicy" => Some(include_str!("../resources/functions/ownerPolicy.js")),
            _ => None,
        }
    }

    /// Resolve a `resource:` scheme path, e.g. `functions/ownerPolicy.js`.
    #[must_use]
    pub fn resource(path: &str) -> Option<&'static str> {
        let (family, rest) = path.split_once('/')?;
        let name = rest.strip_suffix(".js").or_else(|| rest.strip_suffix(".json")).unwrap_or(rest);
        match family {
            "functions" => Self::function(name),
            "policies" => Self::policy(name),
            "rules" => Self::rule(name),
            "patterns" => Self::pattern(name),
            "facts" => Self::fact(name),
            _ => None,
        }
    }
}

// =============================================================================
// Expansion
// =============================================================================

/// Scalar substitution inputs for one assembly.
///
/// `None` options leave their markers in place so the assembler can prune
/// the branches that depended on them.
#[derive(Debug, Clone, Default)]
pub struct ExpandContext<'a> {
    pub actor_urn: &'a str,
    pub actor_type: &'a str,
    pub resource_urn: &'a str,
    pub resource_type: &'a str,
    pub permission_name: &'a str,
    pub group_urn: Option<&'a str>,
    pub parent_urn: Option<&'a str>,
    pub model_role: Option<&'a str>,
    pub token: Option<&'a str>,
}

/// Inline the `"${rule.X}"`, `"${pattern.X}"` and `"${fact.X}"` include
/// families, in that order. Unknown names leave the `${error}` sentinel.
#[must_use]
pub fn expand_includes(template: &str) -> String {
    let mut out = apply_includes(template.to_string(), &RULE_INCLUDE, TemplateStore::rule);
    out = apply_includes(out, &PATTERN_INCLUDE, TemplateStore::pattern);
    apply_includes(out, &FACT_INCLUDE, TemplateStore::fact)
}

fn apply_includes(
    text: String,
    marker: &Regex,
    lookup: fn(&str) -> Option<&'static str>,
) -> String {
    let mut out = text;
    while let Some(caps) = marker.captures(&out) {
        let (range, name) = match (caps.get(0), caps.get(1)) {
            (Some(whole), Some(name)) => (whole.range(), name.as_str().to_string()),
            _ => break,
        };
        let replacement = match lookup(&name) {
            Some(body) => body,
            None => {
                tracing::error!(name, "Unknown include resource");
                ERROR_MARKER
            }
        };
        out.replace_range(range, replacement);
    }
    out
}

/// Substitute scalar placeholders. Pure: the caller resolves group and
/// parent URNs beforehand.
#[must_use]
pub fn expand(template: &str, ctx: &ExpandContext<'_>) -> String {
    let mut out = template.replace("${actorUrn}", ctx.actor_urn);
    out = out.replace("${actorType}", ctx.actor_type);
    out = out.replace("${resourceUrn}", ctx.resource_urn);
    out = out.replace("${resourceType}", ctx.resource_type);
    out = out.replace("${permissionName}", ctx.permission_name);
    if let Some(group) = ctx.group_urn {
        out = out.replace(GROUP_URN_MARKER, group);
    }
    if let Some(parent) = ctx.parent_urn {
        out = out.replace(PARENT_URN_MARKER, parent);
    }
    if let Some(role) = ctx.model_role {
        out = out.replace("${modelRole}", role);
    }
    if let Some(token) = ctx.token {
        out = out.replace("${binaryToken}", &BASE64.encode(token));
        out = out.replace(TOKEN_MARKER, token);
    }
    out
}

/// Whether the fail-closed sentinel survived expansion.
#[must_use]
pub fn contains_error(text: &str) -> bool {
    text.contains(ERROR_MARKER)
}
