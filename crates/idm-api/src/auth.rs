use std::sync::{Arc, LazyLock};

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::SaltString,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::WithRejection;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand_core::OsRng;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use idm_db::{Database, StoreError};
use idm_types::api::{AuthResponse, Claims, LoginRequest, PublicUser, RegisterRequest};

use crate::error::ApiError;
use crate::service::blocking;
use crate::state::AppState;

/// Session tokens expire this long after issue.
pub const TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

const INVALID_CREDENTIALS: &str = "username or password incorrect";

static EMAIL_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid"));

// -- Handlers --

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RegisterRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let response = register_user(&state.db, &state.jwt_secret, req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<LoginRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let response = login_user(&state.db, &state.jwt_secret, req).await?;
    Ok(Json(response))
}

// -- Gateway --

pub async fn register_user(
    db: &Arc<Database>,
    jwt_secret: &str,
    req: RegisterRequest,
) -> Result<AuthResponse, ApiError> {
    let username = req.username.trim().to_string();
    let name = req.name.trim().to_string();
    let email = req.email.trim().to_string();
    let password = req.password;

    if username.is_empty() || name.is_empty() || email.is_empty() || password.is_empty() {
        return Err(ApiError::Validation("all fields are required".into()));
    }
    if !EMAIL_SHAPE.is_match(&email) {
        return Err(ApiError::Validation("email address is not valid".into()));
    }

    let user_id = Uuid::new_v4();
    let user = PublicUser {
        id: user_id,
        username: username.clone(),
        name: name.clone(),
        email: email.clone(),
    };

    blocking(db, move |db| {
        // The unique indexes catch a racing insert; these give the common
        // case a precise message without hashing first.
        if db.get_user_by_username(&username)?.is_some() {
            return Err(StoreError::Conflict { field: "username" }.into());
        }
        if db.get_user_by_email(&email)?.is_some() {
            return Err(StoreError::Conflict { field: "email" }.into());
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
            .to_string();

        db.create_user(&user_id.to_string(), &username, &name, &email, &password_hash)
    })
    .await?;

    info!("Registered user {} ({})", user.username, user.id);

    let token = create_token(jwt_secret, user_id, &user.username)?;
    Ok(AuthResponse {
        success: true,
        token,
        user,
    })
}

pub async fn login_user(
    db: &Arc<Database>,
    jwt_secret: &str,
    req: LoginRequest,
) -> Result<AuthResponse, ApiError> {
    let username = req.username.trim().to_string();
    if username.is_empty() || req.password.is_empty() {
        return Err(ApiError::Validation("username and password are required".into()));
    }

    let password = req.password;
    let lookup = username.clone();
    let user = blocking(db, move |db| {
        let Some(user) = db.get_user_by_username(&lookup)? else {
            return Ok(None);
        };

        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("stored hash for {} is unreadable: {}", user.id, e))?;

        let verified = Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok();

        Ok(verified.then_some(user))
    })
    .await?;

    // Same answer for unknown user and wrong password
    let Some(user) = user else {
        warn!("Failed login for '{}'", username);
        return Err(ApiError::Auth(INVALID_CREDENTIALS.into()));
    };

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| ApiError::Internal(format!("corrupt user id '{}': {}", user.id, e)))?;

    let token = create_token(jwt_secret, user_id, &user.username)?;

    Ok(AuthResponse {
        success: true,
        token,
        user: PublicUser {
            id: user_id,
            username: user.username,
            name: user.name,
            email: user.email,
        },
    })
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> Result<String, ApiError> {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        iat: now.timestamp() as usize,
        exp: (now.timestamp() + TOKEN_LIFETIME_SECS) as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("token signing failed: {}", e)))
}

/// Check signature and expiry; the claims are the caller's identity.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Auth("invalid or expired token".into()))
}
