use thiserror::Error;

/// Errors surfaced by the target registry and post store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by the gateway pool.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no instance available")]
    NoInstanceAvailable,
}
