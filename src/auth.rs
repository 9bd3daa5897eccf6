use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// Resolves the secret a login user must present.
///
/// With a token table only listed users may log in, each with their own
/// token; without one every user shares a development password. Either way
/// the login user name becomes the caller's identity.
#[derive(Debug, Clone)]
pub struct TokenAuthSource {
    tokens: Option<Arc<HashMap<String, String>>>,
    password: String,
}

impl TokenAuthSource {
    pub fn shared(password: String) -> Self {
        Self {
            tokens: None,
            password,
        }
    }

    pub fn with_tokens(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: Some(Arc::new(tokens)),
            password: String::new(),
        }
    }

    /// Read a JSON object of `user id -> token`.
    pub fn load_tokens(path: &Path) -> io::Result<HashMap<String, String>> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn secret_for(&self, user: &str) -> Option<&str> {
        match &self.tokens {
            Some(tokens) => tokens.get(user).map(String::as_str),
            None => Some(&self.password),
        }
    }
}

#[async_trait]
impl AuthSource for TokenAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.secret_for(user) {
            Some(secret) if !user.is_empty() => Ok(Password::new(None, secret.as_bytes().to_vec())),
            _ => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::debug!("login refused for unknown user {user:?}");
                Err(PgWireError::InvalidPassword(user.to_string()))
            }
        }
    }
}
