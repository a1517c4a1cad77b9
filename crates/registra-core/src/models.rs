//! Model name constants shared across the platform.
//!
//! The record store is schema-driven; these are the model names the policy
//! core needs to address directly.

pub const USER: &str = "user";
pub const ACCOUNT: &str = "account";
pub const PERSON: &str = "person";
pub const GROUP: &str = "group";
pub const ROLE: &str = "role";
pub const PERMISSION: &str = "permission";
pub const OPERATION: &str = "operation";
pub const FUNCTION: &str = "function";
pub const POLICY: &str = "policy";

/// Marker for polymorphic field schemas that reference their own model.
pub const SELF: &str = "$self";
/// Marker for untyped (flex) field schemas.
pub const FLEX: &str = "$flex";
