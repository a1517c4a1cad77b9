//! # registra-storage
//!
//! Collaborator traits for the Registra policy core.
//!
//! This crate defines the narrow interfaces the authorization core consumes.
//! It does not contain any implementations; the record store, entitlement
//! and membership primitives live elsewhere in the platform.
//!
//! ## Overview
//!
//! The main trait is [`RecordStore`], which defines the contract for:
//! - Reads by numeric id and by URN
//! - Path-scoped lookups (`find_by_path`)
//! - Query execution for collection-level authorization
//! - Lazy field hydration (`populate`)
//!
//! The remaining traits cover the entitlement ([`EntitlementCheck`]),
//! membership ([`MembershipCheck`]) and duty-conflict
//! ([`DutyConflictLookup`]) primitives, plus read-only schema access
//! metadata ([`SchemaProvider`]).

mod error;
mod query;
mod schema;
mod traits;

pub use error::{StorageError, StorageResult};
pub use query::{Query, QueryClause};
pub use schema::{
    AccessRoles, FieldSchema, ModelAccess, ModelCategory, ModelSchema, PermissionCategory,
};
pub use traits::{
    DutyConflictLookup, EntitlementCheck, MembershipCheck, RecordStore, SchemaProvider,
};
