//! Infrastructure layer: the SQLite task graph store and the work
//! queue implementation behind the domain ports.

pub mod database;
pub mod in_memory_queue;

pub use database::sqlite::{
    SqliteAttemptRepository, SqliteMetadataRepository, SqliteProductRepository,
    SqliteTaskRepository,
};
pub use database::{DatabaseManager, DbPool};
pub use in_memory_queue::InMemoryWorkQueue;
