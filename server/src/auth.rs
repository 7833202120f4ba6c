//! Authentication for the Beer API.
//!
//! Two concerns live here:
//!
//! - **Passwords** are hashed with Argon2id ([`PasswordHasher`]). Hashing is
//!   CPU-bound, so handlers use the `*_blocking` helpers which run on tokio's
//!   blocking pool.
//! - **Access tokens** are HS256 JWTs ([`JwtKeys`]) carrying the user id in
//!   `sub` and expiring after seven days. Requests present them as
//!   `Authorization: Bearer <token>`; the [`AuthUser`] extractor enforces
//!   this for protected routes.
//!
//! # Example
//!
//! ```rust
//! use beerapi_server::auth::{JwtKeys, AuthError};
//!
//! let keys = JwtKeys::new(b"a-long-random-secret");
//! let token = keys.issue("58b2926f5e1def0123e97281").unwrap();
//!
//! let claims = keys.verify(&token.access_token).unwrap();
//! assert_eq!(claims.sub, "58b2926f5e1def0123e97281");
//!
//! assert_eq!(keys.verify("garbage").unwrap_err().is_server_error(), false);
//! ```

use std::fmt;
use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{
    PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::ApiError;

/// Lifetime of an access token: seven days.
pub const TOKEN_LIFETIME_SECS: i64 = 7 * 24 * 3600;

/// Errors that can occur while authenticating a request or a login.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header was sent.
    #[error("Authorization header is missing")]
    MissingToken,

    /// The header is present but is not `Bearer <token>`.
    #[error("Authorization header is not a bearer token")]
    MalformedHeader,

    /// The token failed signature or format checks.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token was valid but its `exp` has passed.
    #[error("token has expired")]
    ExpiredToken,

    /// Login failed. Deliberately does not say which half was wrong.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// Argon2 failed or a stored hash could not be parsed.
    #[error("password hashing failed: {0}")]
    Hashing(String),

    /// A token could not be signed.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl AuthError {
    /// Returns true for failures that are the server's fault rather than
    /// the caller's.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Hashing(_) | Self::Signing(_))
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Id of the authenticated user.
    pub sub: String,
    /// Expiry as a Unix timestamp.
    pub exp: i64,
    /// Issue time as a Unix timestamp.
    pub iat: i64,
}

/// A freshly signed access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: i64,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Signing and verification keys derived from the server secret.
///
/// Cheap to clone; clones share the key material.
#[derive(Clone)]
pub struct JwtKeys {
    keys: Arc<KeyPair>,
    lifetime_secs: i64,
}

impl JwtKeys {
    /// Derives HS256 keys from `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            keys: Arc::new(KeyPair {
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
            }),
            lifetime_secs: TOKEN_LIFETIME_SECS,
        }
    }

    /// Signs a token for `user_id` that expires after the configured lifetime.
    pub fn issue(&self, user_id: &str) -> Result<IssuedToken, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + self.lifetime_secs,
            iat: now,
        };
        let access_token = self.sign(&claims)?;
        debug!(user_id = %user_id, "Access token issued");

        Ok(IssuedToken {
            access_token,
            expires_in: self.lifetime_secs,
        })
    }

    /// Verifies `token` and returns its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.keys.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::InvalidToken(err.to_string()),
            })
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::default(), claims, &self.keys.encoding)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }
}

impl fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtKeys")
            .field("keys", &"[REDACTED]")
            .field("lifetime_secs", &self.lifetime_secs)
            .finish()
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers.get(AUTHORIZATION).ok_or(AuthError::MissingToken)?;
    let value = value.to_str().map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

/// The caller of a protected route, established from its bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Id of the authenticated user (the token's `sub`).
    pub user_id: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    JwtKeys: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);
        let token = bearer_token(&parts.headers)?;
        let claims = keys.verify(token)?;
        trace!(user_id = %claims.sub, "Request authenticated");

        Ok(Self {
            user_id: claims.sub,
        })
    }
}

// ============================================================================
// Passwords
// ============================================================================

/// Argon2id cost parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswordConfig {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        // OWASP minimum for Argon2id
        Self {
            memory_cost: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl PasswordConfig {
    /// Minimal costs for tests. Never use in production.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Hashes and verifies user passwords.
#[derive(Clone, Debug, Default)]
pub struct PasswordHasher {
    config: PasswordConfig,
}

impl PasswordHasher {
    #[must_use]
    pub fn new(config: PasswordConfig) -> Self {
        Self { config }
    }

    /// Hashes `password` into a PHC string with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()?
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| AuthError::Hashing(err.to_string()))
    }

    /// Returns whether `password` matches the stored `hash`.
    ///
    /// An unparsable hash is an error, a mismatch is `Ok(false)`.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(hash).map_err(|err| AuthError::Hashing(err.to_string()))?;
        Ok(self
            .argon2()?
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    /// [`Self::hash`] on the blocking thread pool.
    pub async fn hash_blocking(&self, password: String) -> Result<String, AuthError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|err| AuthError::Hashing(err.to_string()))?
    }

    /// [`Self::verify`] on the blocking thread pool.
    pub async fn verify_blocking(&self, password: String, hash: String) -> Result<bool, AuthError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|err| AuthError::Hashing(err.to_string()))?
    }

    fn argon2(&self) -> Result<Argon2<'static>, AuthError> {
        let params = Params::new(
            self.config.memory_cost,
            self.config.time_cost,
            self.config.parallelism,
            None,
        )
        .map_err(|err| AuthError::Hashing(format!("invalid Argon2 params: {err}")))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}
