use cine_core::CoreError;
use sqlx::PgPool;

/// Postgres implementation of every repository trait.
///
/// Each trait method that the core treats as one atomic unit of work runs in
/// its own transaction; seat rows are always read `FOR UPDATE` before their
/// status changes.
#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::Storage(e.to_string())
}
