use thiserror::Error;

/// Store failures callers are expected to branch on. Everything else
/// travels as a plain `anyhow::Error`; use `downcast_ref::<StoreError>()`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{field} already exists")]
    Conflict { field: &'static str },
}
