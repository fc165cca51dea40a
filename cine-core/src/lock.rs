use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerKind {
    User,
    GuestSession,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::User => "USER",
            OwnerKind::GuestSession => "GUEST_SESSION",
        }
    }
}

impl FromStr for OwnerKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(OwnerKind::User),
            "GUEST_SESSION" => Ok(OwnerKind::GuestSession),
            other => Err(CoreError::Storage(format!("unknown owner kind {}", other))),
        }
    }
}

/// Who holds a seat lock: a signed-in user or an anonymous session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub id: String,
    pub kind: OwnerKind,
}

impl LockOwner {
    pub fn user(user_id: Uuid) -> Self {
        Self { id: user_id.to_string(), kind: OwnerKind::User }
    }

    pub fn guest(session_id: impl Into<String>) -> Self {
        Self { id: session_id.into(), kind: OwnerKind::GuestSession }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Durable record of a seat reservation attempt. At most one per (owner, showtime).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatLock {
    pub id: Uuid,
    pub owner: LockOwner,
    pub showtime_id: Uuid,
    /// Shared by every distributed key taken for this lock
    pub lock_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SeatLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    pub fn is_owned_by(&self, owner: &LockOwner) -> bool {
        self.owner == *owner
    }
}

/// One seat inside a [`SeatLock`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatLockLine {
    pub lock_id: Uuid,
    pub showtime_seat_id: Uuid,
    pub ticket_type_id: Uuid,
    pub price: f64,
}

/// Distributed-lock key for a showtime seat.
pub fn seat_key(showtime_id: Uuid, showtime_seat_id: Uuid) -> String {
    format!("seat-lock:{}:{}", showtime_id, showtime_seat_id)
}

/// Shared key-value store with atomic set-if-absent and token-guarded delete.
///
/// No ordering guarantee across keys; callers acquire in batches and roll
/// back themselves.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key = token` with `ttl` unless an unexpired value is present.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> CoreResult<bool>;

    /// Delete `key` only while it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> CoreResult<bool>;

    /// `None` when the key is absent or already expired.
    async fn ttl_remaining(&self, key: &str) -> CoreResult<Option<Duration>>;
}
