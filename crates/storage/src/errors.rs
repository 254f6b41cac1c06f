pub use handle_watch_domain::storage::StorageError;

/// A persisted value that no longer maps onto its domain type.
pub(crate) fn corrupt(column: &str, value: impl std::fmt::Display) -> StorageError {
    StorageError::Database(format!("unexpected value `{value}` in column `{column}`"))
}
