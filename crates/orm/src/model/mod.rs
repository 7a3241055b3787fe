//! Model System - record descriptions for database entities
//!
//! - `core_trait`: the [`Model`] trait (table binding, identity, timestamps,
//!   soft deletes, relation declarations, serde-based hydration)

pub mod core_trait;

pub use core_trait::Model;
