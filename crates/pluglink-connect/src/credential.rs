//! Tenant-scoped cloud credentials.
//!
//! One credential is shared by all of a tenant's connections and devices.
//! Token encryption at rest is an external collaborator; this layer only
//! sees the decrypted pair.

use crate::error::{ConnectError, ConnectResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Access/refresh token pair plus the tenant's API host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Credential identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Cloud endpoint host, e.g. `https://shelly-103-eu.example.cloud`.
    pub api_host: String,
    /// Bearer token for cloud calls.
    pub access_token: String,
    /// Token used to obtain a fresh pair.
    pub refresh_token: String,
}

/// A freshly issued token pair.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Exchanges a refresh token for a new pair.
///
/// Called at most once per command on an authentication failure; a second
/// failure surfaces to the caller.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, api_host: &str, refresh_token: &str) -> ConnectResult<TokenPair>;
}

/// Shared, refreshable credential handle.
///
/// All connections and commanders for a tenant hold the same handle, so a
/// refresh by one is visible to all.
#[derive(Clone)]
pub struct SharedCredential {
    inner: Arc<RwLock<Credential>>,
}

impl SharedCredential {
    pub fn new(credential: Credential) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credential)),
        }
    }

    /// Snapshot of the current credential.
    pub async fn get(&self) -> Credential {
        self.inner.read().await.clone()
    }

    /// Current bearer token.
    pub async fn access_token(&self) -> String {
        self.inner.read().await.access_token.clone()
    }

    /// Cloud endpoint host.
    pub async fn api_host(&self) -> String {
        self.inner.read().await.api_host.clone()
    }

    /// Refresh the pair in place through `refresher`.
    pub async fn refresh(&self, refresher: &dyn TokenRefresher) -> ConnectResult<()> {
        let (api_host, refresh_token) = {
            let cred = self.inner.read().await;
            (cred.api_host.clone(), cred.refresh_token.clone())
        };

        let pair = refresher
            .refresh(&api_host, &refresh_token)
            .await
            .map_err(|e| ConnectError::Auth(format!("token refresh failed: {e}")))?;

        let mut cred = self.inner.write().await;
        cred.access_token = pair.access_token;
        cred.refresh_token = pair.refresh_token;
        tracing::info!(credential_id = %cred.id, "credential refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRefresher;

    #[async_trait]
    impl TokenRefresher for FixedRefresher {
        async fn refresh(&self, _host: &str, refresh_token: &str) -> ConnectResult<TokenPair> {
            assert_eq!(refresh_token, "refresh-0");
            Ok(TokenPair {
                access_token: "access-1".to_string(),
                refresh_token: "refresh-1".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_refresh_in_place() {
        let shared = SharedCredential::new(Credential {
            id: "cred-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            api_host: "https://cloud.example".to_string(),
            access_token: "access-0".to_string(),
            refresh_token: "refresh-0".to_string(),
        });

        shared.refresh(&FixedRefresher).await.unwrap();
        let cred = shared.get().await;
        assert_eq!(cred.access_token, "access-1");
        assert_eq!(cred.refresh_token, "refresh-1");
    }
}
