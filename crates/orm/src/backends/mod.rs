//! Data-Access Backends
//!
//! The loading pipeline talks to the store only through [`DataAccess`]. Two
//! implementations are provided: PostgreSQL over sqlx, and an in-memory store that
//! evaluates statement structure directly.

pub mod core;
pub mod memory;
pub mod postgres;

pub use core::*;
pub use memory::MemoryDatabase;
pub use postgres::{PostgresDataAccess, PostgresRow};
