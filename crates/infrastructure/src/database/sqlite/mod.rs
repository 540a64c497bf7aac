pub mod sqlite_attempt_repository;
pub mod sqlite_metadata_repository;
pub mod sqlite_product_repository;
pub mod sqlite_task_repository;

pub use sqlite_attempt_repository::SqliteAttemptRepository;
pub use sqlite_metadata_repository::SqliteMetadataRepository;
pub use sqlite_product_repository::SqliteProductRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
