use anyhow::Result;
use jsonwebtoken::{DecodingKey, Validation, decode};

use murmur_types::api::Claims;

/// Validate an HS256 bearer token and return its claims. Tokens are issued
/// by the identity service; only the signature and expiry are checked here.
pub fn validate_token(secret: &str, token: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}
