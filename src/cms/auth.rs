use crate::cms::config::{CMS_PASSWORD, CMS_USERNAME, DEFAULT_TOKEN_TTL_SECS, auth_url};
use crate::http::build_client;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CmsAuthError {
    #[error("missing cms credentials in env")]
    MissingCredentials,
    #[error("auth request failed: {0}")]
    Request(String),
    #[error("auth rejected: HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self, CmsAuthError> {
        if CMS_USERNAME.is_empty() || CMS_PASSWORD.is_empty() {
            return Err(CmsAuthError::MissingCredentials);
        }
        Ok(Self {
            username: CMS_USERNAME.clone(),
            password: CMS_PASSWORD.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BearerToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl BearerToken {
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub async fn authenticate(
    credentials: &Credentials,
    user_agent: &str,
) -> Result<BearerToken, CmsAuthError> {
    let client = build_client(user_agent);
    let response = client
        .post(auth_url())
        .json(&LoginRequest {
            username: &credentials.username,
            password: &credentials.password,
        })
        .send()
        .await
        .map_err(|err| CmsAuthError::Request(err.to_string()))?;

    if !response.status().is_success() {
        return Err(CmsAuthError::Status(response.status().as_u16()));
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| CmsAuthError::Request(err.to_string()))?;

    let ttl = payload.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
    Ok(BearerToken {
        token: payload.token,
        expires_at: Utc::now() + Duration::seconds(ttl as i64),
    })
}
