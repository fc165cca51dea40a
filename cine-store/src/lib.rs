pub mod app_config;
pub mod booking_repo;
pub mod catalog_repo;
pub mod database;
pub mod lock_repo;
pub mod memory;
pub mod party_repo;
pub mod payment_repo;
pub mod pg_store;
pub mod pricing_repo;
pub mod redis_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use memory::{ManualClock, MemoryLockStore, MemoryStore};
pub use pg_store::PgStore;
pub use redis_repo::RedisClient;
