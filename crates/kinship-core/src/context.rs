//! Explicit dependency bundle for the session controller.

use std::sync::Arc;

use anyhow::Result;

use crate::auth::{AuthService, RestAuthService};
use crate::config::{Config, SessionConfig};
use crate::navigator::Navigator;
use crate::profile::{ProfileService, RestProfileService};
use crate::store::CredentialStore;

/// Everything the controller talks to, built once at startup.
#[derive(Clone)]
pub struct AuthContext {
    pub auth: Arc<dyn AuthService>,
    pub profiles: Arc<dyn ProfileService>,
    pub store: Arc<dyn CredentialStore>,
    pub navigator: Arc<dyn Navigator>,
    pub config: SessionConfig,
}

impl AuthContext {
    pub fn new(
        auth: Arc<dyn AuthService>,
        profiles: Arc<dyn ProfileService>,
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
        config: SessionConfig,
    ) -> Self {
        Self {
            auth,
            profiles,
            store,
            navigator,
            config,
        }
    }
}

/// Clients for the hosted backend.
pub struct RemoteServices {
    /// Kept concrete so callers can adopt callback tokens.
    pub auth: Arc<RestAuthService>,
    pub profiles: Arc<RestProfileService>,
}

impl RemoteServices {
    /// Builds the HTTP clients from `config`, restoring any persisted session
    /// from `store`.
    ///
    /// # Errors
    /// Returns an error if the backend URL or API key is missing or invalid.
    pub fn connect(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let base_url = config.backend_url()?;
        let anon_key = config.anon_key()?;
        tracing::debug!(backend = %base_url, "Connecting to backend");

        let auth = Arc::new(RestAuthService::new(&base_url, &anon_key, store));
        let auth_dyn: Arc<dyn AuthService> = Arc::clone(&auth) as Arc<dyn AuthService>;
        let profiles = Arc::new(RestProfileService::new(&base_url, &anon_key, auth_dyn));
        Ok(Self { auth, profiles })
    }

    pub fn context(
        &self,
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
        config: SessionConfig,
    ) -> AuthContext {
        AuthContext::new(
            Arc::clone(&self.auth) as Arc<dyn AuthService>,
            Arc::clone(&self.profiles) as Arc<dyn ProfileService>,
            store,
            navigator,
            config,
        )
    }
}
