use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use cine_core::LockOwner;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub const ROLE_CUSTOMER: &str = "CUSTOMER";
pub const ROLE_GUEST: &str = "GUEST";
pub const ROLE_ADMIN: &str = "ADMIN";

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// User id for customers and admins, anonymous session id for guests
    pub sub: String,
    pub email: Option<String>,
    pub role: String,
    pub exp: usize,
}

/// The authenticated party behind a request
#[derive(Debug, Clone, PartialEq)]
pub enum Caller {
    Customer(Uuid),
    Guest(String),
    Admin(Uuid),
}

impl Caller {
    fn from_claims(claims: &Claims) -> Option<Self> {
        match claims.role.as_str() {
            ROLE_CUSTOMER => Uuid::parse_str(&claims.sub).ok().map(Caller::Customer),
            ROLE_ADMIN => Uuid::parse_str(&claims.sub).ok().map(Caller::Admin),
            ROLE_GUEST => Some(Caller::Guest(claims.sub.clone())),
            _ => None,
        }
    }

    /// Seat locks are scoped to this owner.
    pub fn owner(&self) -> LockOwner {
        match self {
            Caller::Customer(id) | Caller::Admin(id) => LockOwner::user(*id),
            Caller::Guest(session) => LockOwner::guest(session.clone()),
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Caller::Customer(id) | Caller::Admin(id) => Some(*id),
            Caller::Guest(_) => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin(_))
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Caller::Guest(_))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

fn decode_caller(secret: &str, token: &str) -> Result<Caller, StatusCode> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ).map_err(|_| StatusCode::UNAUTHORIZED)?;

    Caller::from_claims(&token_data.claims).ok_or(StatusCode::FORBIDDEN)
}

/// Best-effort caller for endpoints where authentication is optional.
pub fn optional_caller(state: &AppState, headers: &HeaderMap) -> Option<Caller> {
    bearer_token(headers).and_then(|token| decode_caller(&state.auth.secret, token).ok())
}

// ============================================================================
// Customer / Guest Authentication Middleware
// ============================================================================

pub async fn customer_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let caller = decode_caller(&state.auth.secret, token)?;

    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

// ============================================================================
// Admin Authentication Middleware
// ============================================================================

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let caller = decode_caller(&state.auth.secret, token)?;

    if !caller.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

/// Bookings are visible to their owner and to admins. Guest sessions hold
/// no account, so the booking id they were handed is their proof.
pub fn ensure_booking_access(caller: &Caller, booking_user_id: Uuid) -> Result<(), AppError> {
    match caller {
        Caller::Admin(_) | Caller::Guest(_) => Ok(()),
        Caller::Customer(id) if *id == booking_user_id => Ok(()),
        _ => Err(AppError::AuthorizationError("Booking belongs to another customer".to_string())),
    }
}
