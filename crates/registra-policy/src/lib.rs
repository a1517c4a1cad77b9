//! # registra-policy
//!
//! Policy language and authorization decision engine for the Registra
//! platform.
//!
//! This crate provides:
//! - The policy language: facts, patterns, rules and policies, plus the
//!   request/response envelope
//! - A decision engine walking policies with short-circuiting pass-count
//!   conditions and fail-closed error handling
//! - A fact resolver dereferencing facts against the record store, with
//!   per-evaluation reference memoization and scripted function facts
//! - A comparator for string-or-numeric fact values
//! - A registry of natively implemented operations
//! - Template-driven assembly of per-resource policies, including group,
//!   parent, token and composition handling
//! - A response cache with actor and resource indexed invalidation
//!
//! ## Modules
//!
//! - [`model`] - Policy language types and the request/response envelope
//! - [`engine`] - The policy evaluator
//! - [`fact`] - Fact resolution against the record store
//! - [`compare`] - Fact value comparison
//! - [`operation`] - Native operation registry
//! - [`script`] - Script host abstraction and the QuickJS host
//! - [`template`] - Embedded policy templates and marker expansion
//! - [`assemble`] - Resource policy assembly and query authorization
//! - [`cache`] - Response caching and invalidation

pub mod assemble;
pub mod cache;
pub mod compare;
pub mod engine;
pub mod error;
pub mod fact;
pub mod model;
pub mod operation;
pub mod script;
pub mod template;

#[cfg(test)]
pub(crate) mod testutil;

pub use assemble::PolicyAssembler;
pub use cache::{CacheRegistry, CacheStats, ResponseCache};
pub use compare::compare;
pub use engine::PolicyEvaluator;
pub use error::{PolicyError, PolicyResult};
pub use fact::{FactResolver, ReferenceCache};
pub use model::{
    Comparator, Condition, Decision, Fact, FactKind, FunctionDef, OperationDef, OperationKind,
    OperationResult, Pattern, PatternKind, Policy, PolicyRequest, PolicyResponse, Rule, RuleKind,
    ScriptLanguage,
};
pub use operation::{NativeOperation, OP_OWNER_CHECK, OperationRegistry, OwnerOperation};
pub use script::{QuickJsConfig, QuickJsScriptHost, ScriptError, ScriptHost, ScriptHostStats};
pub use template::{ExpandContext, TemplateStore};
