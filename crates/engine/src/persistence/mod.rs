//! Persistence layer for engine state
//!
//! Contents:
//! - Repository traits, one per aggregate, collected in [`EngineStore`]
//! - [`InMemoryEngineStore`] for tests and single-process runs
//! - [`PostgresEngineStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEngineStore;
pub use postgres::PostgresEngineStore;
pub use store::*;
