use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::engine::EngineError;
use crate::limits::{MAX_PIN_LEN, MIN_PIN_LEN};

/// Device credential checked at pgwire startup. Every kiosk and dashboard of a
/// deployment shares it; staff identity is established later, per connection.
#[derive(Debug)]
pub struct DeviceAuthSource {
    password: String,
}

impl DeviceAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for DeviceAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub fn is_valid_pin(pin: &str) -> bool {
    (MIN_PIN_LEN..=MAX_PIN_LEN).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

fn hash_blocking(pin: &str) -> Result<String, argon2::password_hash::Error> {
    use argon2::password_hash::SaltString;
    use argon2::password_hash::rand_core::OsRng;
    use argon2::{Argon2, PasswordHasher};
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(pin.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

fn verify_blocking(pin: &str, hash: &str) -> bool {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(pin.as_bytes(), &parsed).is_ok()
}

/// Argon2 PHC string for `pin`. Hashing is CPU-bound, so it runs off the reactor.
pub async fn hash_pin(pin: String) -> Result<String, EngineError> {
    tokio::task::spawn_blocking(move || hash_blocking(&pin))
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?
        .map_err(|e| EngineError::Internal(e.to_string()))
}

pub async fn verify_pin(pin: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify_blocking(&pin, &hash))
        .await
        .unwrap_or(false)
}
