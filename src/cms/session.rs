use crate::cms::auth::{BearerToken, CmsAuthError, Credentials, authenticate};
use crate::http;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Shared client state for one sync run: the cached bearer token and the
/// index of the outgoing identity string.
///
/// The pipeline is sequential, so the token mutex never contends in
/// practice; refresh still happens inside the critical section so a future
/// parallel caller cannot observe a half-refreshed credential.
pub struct Session {
    credentials: Credentials,
    token: Mutex<Option<BearerToken>>,
    identity: AtomicUsize,
}

impl Session {
    pub fn from_env() -> Result<Self, CmsAuthError> {
        Ok(Self::new(Credentials::from_env()?))
    }

    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            token: Mutex::new(None),
            identity: AtomicUsize::new(0),
        }
    }

    /// Returns a bearer token, authenticating or re-authenticating when the
    /// cached one is missing or stale.
    pub async fn bearer(&self) -> Result<String, CmsAuthError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref()
            && cached.is_valid()
        {
            return Ok(cached.token.clone());
        }

        info!(target = "catalog.auth", "acquiring bearer token");
        let fresh = authenticate(&self.credentials, self.user_agent()).await?;
        debug!(
            target = "catalog.auth",
            expires_at = %fresh.expires_at,
            "token cached"
        );
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    /// Drops the cached token so the next call re-authenticates. Called on
    /// the first 401 seen by any request.
    pub async fn invalidate(&self) {
        let mut guard = self.token.lock().await;
        *guard = None;
    }

    pub fn user_agent(&self) -> &'static str {
        http::identity(self.identity.load(Ordering::Relaxed))
    }

    /// Switches to the next identity string in the pool and returns it.
    pub fn rotate_identity(&self) -> &'static str {
        let next = self.identity.fetch_add(1, Ordering::Relaxed) + 1;
        let agent = http::identity(next);
        info!(target = "catalog.auth", user_agent = agent, "rotated client identity");
        agent
    }
}
