//! Database Backend Abstractions
//!
//! Storage engines plug in through [`DatabaseAdapter`], registered by name.
//! Two adapters ship with the crate: `postgres` (sqlx pool) and `memory`
//! (in-process engine, mostly for tests).

pub mod core;
pub mod memory;
pub mod postgres;
pub mod registry;

pub use self::core::*;
pub use memory::MemoryAdapter;
pub use postgres::PostgresAdapter;
pub use registry::{adapter, connect, register_adapter, registered_adapters};
