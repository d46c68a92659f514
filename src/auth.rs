//! Bearer-token verification. Token issuance lives in the account service;
//! this side only validates HS256 tokens and resolves ownership.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::AppState;
use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub exp: usize,
}

/// Decode and validate a token, returning the embedded user id.
pub fn user_from_token(secret: &str, token: &str) -> Result<i64, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims.user_id)
}

/// Resolve the requesting user from an `Authorization: Bearer` header.
pub fn user_from_headers(state: &AppState, headers: &HeaderMap) -> Result<i64, AppError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::unauthorized("auth", "Missing bearer token"))?;

    user_from_token(&state.config.jwt_secret, token)
        .map_err(|_| AppError::unauthorized("auth", "Invalid or expired token"))
}

/// Whether the dream exists and belongs to the user.
pub async fn dream_owned_by(
    state: &AppState,
    dream_id: Uuid,
    user_id: i64,
) -> Result<bool, AppError> {
    let client = state
        .db_pool
        .get()
        .await
        .map_err(|err| AppError::db_connection("dream_owned_by", err))?;

    let row = client
        .query_opt(
            "SELECT 1 FROM dreams WHERE id = $1 AND user_id = $2",
            &[&dream_id, &user_id],
        )
        .await
        .map_err(|err| AppError::db_query("dream_owned_by", err))?;

    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(user_id: i64, secret: &str, exp_offset: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset) as usize;
        encode(
            &Header::default(),
            &Claims { user_id, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let token = token_for(42, "sekrit", 3600);
        assert_eq!(user_from_token("sekrit", &token).unwrap(), 42);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token_for(42, "sekrit", 3600);
        assert!(user_from_token("other", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = token_for(42, "sekrit", -3600);
        assert!(user_from_token("sekrit", &token).is_err());
    }
}
