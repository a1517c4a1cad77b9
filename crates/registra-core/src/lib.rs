//! # registra-core
//!
//! Core record types for the Registra platform.
//!
//! This crate provides:
//! - The [`Record`] envelope used at the attributed-record store boundary
//! - [`Attribute`] name/value pairs carried by records and policy responses
//! - Model name constants shared across crates
//! - Content hashing for records without a stable identifier

pub mod models;
pub mod record;

pub use record::{Attribute, Record};
