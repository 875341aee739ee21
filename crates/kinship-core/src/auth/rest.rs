//! GoTrue-compatible HTTP auth client.
//!
//! Holds the current session in memory and persists it to the local store
//! under `kinship.auth.token`, so a restarted client picks it back up.
//! Tokens are never logged in full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use kinship_types::{
    AuthChangeEvent, AuthEventKind, OAuthRedirect, OAuthRequest, Session, SignOutScope, User,
    UserMetadata,
};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use super::{
    AUTH_EVENT_CAPACITY, AuthError, AuthErrorKind, AuthResult, AuthService, ServiceFuture,
};
use crate::logging::mask_token;
use crate::routes::CallbackTokens;
use crate::store::{CredentialStore, keys};

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Reads the `exp` claim of a JWT access token without verifying it.
fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp").and_then(Value::as_i64)
}

/// Completes expiry metadata on a freshly issued session.
fn finalize_session(session: Session) -> Session {
    let mut session = session.with_expiry_from(now_unix());
    if session.expires_at.is_none() {
        session.expires_at = jwt_expiry(&session.access_token);
    }
    session
}

pub struct RestAuthService {
    auth_url: String,
    anon_key: String,
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthChangeEvent>,
    initial_emitted: AtomicBool,
}

impl RestAuthService {
    /// Creates a client for `<base_url>/auth/v1`, restoring any persisted session.
    pub fn new(base_url: &str, anon_key: &str, store: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        let restored = restore_session(store.as_ref());
        Self {
            auth_url: format!("{}/auth/v1", base_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
            http: reqwest::Client::new(),
            store,
            session: Mutex::new(restored),
            events,
            initial_emitted: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        tracing::debug!(event = %kind, has_session = session.is_some(), "Auth state changed");
        // No receivers is fine.
        let _ = self.events.send(AuthChangeEvent::new(kind, session));
    }

    fn adopt(&self, session: &Session) -> AuthResult<()> {
        if let Ok(mut current) = self.session.lock() {
            *current = Some(session.clone());
        }
        let json = serde_json::to_string(session)
            .map_err(|e| AuthError::internal(format!("Failed to serialize session: {e}")))?;
        self.store
            .set(keys::SESSION, &json)
            .map_err(|e| AuthError::storage(&e))
    }

    fn drop_session(&self) {
        if let Ok(mut current) = self.session.lock() {
            *current = None;
        }
        if let Err(err) = self.store.remove(keys::SESSION) {
            tracing::warn!(error = %format!("{err:#}"), "Failed to remove persisted session");
        }
    }

    fn request(&self, builder: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer.unwrap_or(&self.anon_key))
    }

    async fn send(&self, builder: RequestBuilder) -> AuthResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AuthError::from_response(status.as_u16(), &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> AuthResult<T> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| AuthError::from_transport(&e))
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> AuthResult<Session> {
        let builder = self
            .http
            .post(format!("{}/token", self.auth_url))
            .query(&[("grant_type", grant_type)])
            .json(&body);
        let session: Session = self.send_json(self.request(builder, None)).await?;
        Ok(finalize_session(session))
    }

    async fn refresh_with(&self, refresh_token: &str) -> AuthResult<Session> {
        tracing::debug!(token = %mask_token(refresh_token), "Refreshing session");
        match self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(session) => {
                self.adopt(&session)?;
                self.emit(AuthEventKind::TokenRefreshed, Some(session.clone()));
                Ok(session)
            }
            Err(err) => {
                // 401 on the token endpoint means the refresh credential is dead.
                let terminal = err.is_session_missing() || err.status == Some(401);
                if terminal {
                    tracing::warn!(error = %err, "Refresh credential rejected; dropping session");
                    self.drop_session();
                    self.emit(AuthEventKind::SignedOut, None);
                    let mut err = err;
                    err.kind = AuthErrorKind::SessionMissing;
                    return Err(err);
                }
                Err(err)
            }
        }
    }

    async fn get_session_inner(&self) -> AuthResult<Option<Session>> {
        let session = match self.current() {
            Some(stale) if stale.is_expired(now_unix()) => {
                tracing::debug!("Persisted session expired; refreshing");
                match self.refresh_with(&stale.refresh_token).await {
                    Ok(session) => Some(session),
                    Err(err) if err.is_session_missing() => None,
                    Err(err) => return Err(err),
                }
            }
            other => other,
        };

        if !self.initial_emitted.swap(true, Ordering::SeqCst) {
            self.emit(AuthEventKind::InitialSession, session.clone());
        }
        Ok(session)
    }

    async fn sign_up_inner(
        &self,
        email: &str,
        password: &str,
        metadata: UserMetadata,
    ) -> AuthResult<User> {
        let builder = self
            .http
            .post(format!("{}/signup", self.auth_url))
            .json(&json!({ "email": email, "password": password, "data": metadata }));
        let body: Value = self.send_json(self.request(builder, None)).await?;

        // Auto-confirmed projects answer with a session, others with the bare user.
        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value(body)
                .map_err(|e| AuthError::new(AuthErrorKind::Parse, e.to_string()))?;
            let session = finalize_session(session);
            self.adopt(&session)?;
            self.emit(AuthEventKind::SignedIn, Some(session.clone()));
            return Ok(session.user);
        }

        let user_value = body.get("user").cloned().unwrap_or(body);
        serde_json::from_value(user_value)
            .map_err(|e| AuthError::new(AuthErrorKind::Parse, e.to_string()))
    }

    async fn sign_in_inner(&self, email: &str, password: &str) -> AuthResult<Session> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        self.adopt(&session)?;
        tracing::info!(user_id = %session.user.id, "Signed in with password");
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out_inner(&self, scope: SignOutScope) -> AuthResult<()> {
        let current = self.current();
        if scope != SignOutScope::Others {
            self.drop_session();
            self.emit(AuthEventKind::SignedOut, None);
        }

        let Some(session) = current else {
            return Ok(());
        };

        let builder = self
            .http
            .post(format!("{}/logout", self.auth_url))
            .query(&[("scope", scope.as_str())]);
        match self
            .send(self.request(builder, Some(&session.access_token)))
            .await
        {
            Ok(_) => Ok(()),
            // Already invalid on the server: nothing left to revoke.
            Err(err)
                if matches!(err.status, Some(401 | 404)) || err.is_session_missing() =>
            {
                tracing::debug!(error = %err, "Session already gone server-side");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn refresh_session_inner(&self) -> AuthResult<Session> {
        let Some(session) = self.current() else {
            return Err(AuthError::session_missing("Auth session missing!"));
        };
        self.refresh_with(&session.refresh_token).await
    }

    fn oauth_url(&self, request: &OAuthRequest) -> AuthResult<OAuthRedirect> {
        let mut url = url::Url::parse(&format!("{}/authorize", self.auth_url))
            .map_err(|e| AuthError::internal(format!("Invalid auth URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", &request.provider);
            query.append_pair("redirect_to", &request.redirect_to);
            for (key, value) in &request.query_params {
                query.append_pair(key, value);
            }
        }
        Ok(OAuthRedirect {
            provider: request.provider.clone(),
            url: url.to_string(),
        })
    }

    async fn fetch_user(&self, access_token: &str) -> AuthResult<User> {
        let builder = self.http.get(format!("{}/user", self.auth_url));
        self.send_json(self.request(builder, Some(access_token)))
            .await
            .map_err(|err| {
                if err.status == Some(401) {
                    AuthError {
                        kind: AuthErrorKind::SessionMissing,
                        ..err
                    }
                } else {
                    err
                }
            })
    }

    fn replace_user(&self, user: &User) -> AuthResult<()> {
        if let Some(mut session) = self.current() {
            session.user = user.clone();
            self.adopt(&session)?;
        }
        Ok(())
    }

    async fn get_user_inner(&self) -> AuthResult<Option<User>> {
        let Some(session) = self.current() else {
            return Ok(None);
        };
        let user = self.fetch_user(&session.access_token).await?;
        self.replace_user(&user)?;
        Ok(Some(user))
    }

    async fn reset_password_inner(&self, email: &str, redirect_to: &str) -> AuthResult<()> {
        let builder = self
            .http
            .post(format!("{}/recover", self.auth_url))
            .query(&[("redirect_to", redirect_to)])
            .json(&json!({ "email": email }));
        self.send(self.request(builder, None)).await?;
        Ok(())
    }

    async fn update_password_inner(&self, new_password: &str) -> AuthResult<User> {
        let Some(session) = self.current() else {
            return Err(AuthError::session_missing("Auth session missing!"));
        };
        let builder = self
            .http
            .put(format!("{}/user", self.auth_url))
            .json(&json!({ "password": new_password }));
        let user: User = self
            .send_json(self.request(builder, Some(&session.access_token)))
            .await?;
        self.replace_user(&user)?;
        self.emit(AuthEventKind::UserUpdated, self.current());
        Ok(user)
    }

    /// Adopts the tokens delivered to the OAuth or recovery callback URL.
    ///
    /// Emits `PASSWORD_RECOVERY` for recovery links and `SIGNED_IN` otherwise.
    ///
    /// # Errors
    /// Returns an error if the tokens are rejected by the backend.
    pub async fn set_session_from_callback(&self, tokens: &CallbackTokens) -> AuthResult<Session> {
        let user = self.fetch_user(&tokens.access_token).await?;
        let session = finalize_session(Session {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            token_type: tokens
                .token_type
                .clone()
                .unwrap_or_else(|| "bearer".to_string()),
            expires_in: tokens.expires_in.unwrap_or(0),
            expires_at: tokens.expires_at,
            user,
        });
        self.adopt(&session)?;

        let kind = if tokens.is_recovery() {
            AuthEventKind::PasswordRecovery
        } else {
            AuthEventKind::SignedIn
        };
        self.emit(kind, Some(session.clone()));
        Ok(session)
    }
}

fn restore_session(store: &dyn CredentialStore) -> Option<Session> {
    let raw = match store.get(keys::SESSION) {
        Ok(raw) => raw?,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "Failed to read persisted session");
            return None;
        }
    };
    match serde_json::from_str::<Session>(&raw) {
        Ok(session) => {
            tracing::debug!(user_id = %session.user.id, "Restored persisted session");
            Some(session)
        }
        Err(err) => {
            tracing::warn!(error = %err, "Discarding unreadable persisted session");
            let _ = store.remove(keys::SESSION);
            None
        }
    }
}

impl AuthService for RestAuthService {
    fn get_session(&self) -> ServiceFuture<'_, Option<Session>> {
        Box::pin(self.get_session_inner())
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
        metadata: UserMetadata,
    ) -> ServiceFuture<'a, User> {
        Box::pin(self.sign_up_inner(email, password, metadata))
    }

    fn sign_in_with_password<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> ServiceFuture<'a, Session> {
        Box::pin(self.sign_in_inner(email, password))
    }

    fn sign_out(&self, scope: SignOutScope) -> ServiceFuture<'_, ()> {
        Box::pin(self.sign_out_inner(scope))
    }

    fn refresh_session(&self) -> ServiceFuture<'_, Session> {
        Box::pin(self.refresh_session_inner())
    }

    fn sign_in_with_oauth(&self, request: OAuthRequest) -> ServiceFuture<'_, OAuthRedirect> {
        let result = self.oauth_url(&request);
        Box::pin(async move { result })
    }

    fn get_user(&self) -> ServiceFuture<'_, Option<User>> {
        Box::pin(self.get_user_inner())
    }

    fn reset_password_for_email<'a>(
        &'a self,
        email: &'a str,
        redirect_to: &'a str,
    ) -> ServiceFuture<'a, ()> {
        Box::pin(self.reset_password_inner(email, redirect_to))
    }

    fn update_password<'a>(&'a self, new_password: &'a str) -> ServiceFuture<'a, User> {
        Box::pin(self.update_password_inner(new_password))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCredentialStore;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u","exp":{exp}}}"#));
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn test_jwt_expiry_reads_exp_claim() {
        assert_eq!(jwt_expiry(&jwt_with_exp(1_900_000_000)), Some(1_900_000_000));
        assert_eq!(jwt_expiry("not-a-jwt"), None);
    }

    #[test]
    fn test_finalize_session_prefers_expires_in_then_jwt() {
        let session = Session {
            access_token: jwt_with_exp(1_900_000_000),
            refresh_token: "r".into(),
            token_type: "bearer".into(),
            expires_in: 0,
            expires_at: None,
            user: User::new("u", None),
        };
        assert_eq!(finalize_session(session).expires_at, Some(1_900_000_000));
    }

    #[test]
    fn test_restore_discards_corrupt_session() {
        let store = MemoryCredentialStore::new();
        store.set(keys::SESSION, "{broken").unwrap();
        assert!(restore_session(&store).is_none());
        assert_eq!(store.get(keys::SESSION).unwrap(), None);
    }

    #[tokio::test]
    async fn test_oauth_url_carries_provider_params() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let service = RestAuthService::new("https://b.example/", "anon", store);
        let redirect = service
            .sign_in_with_oauth(OAuthRequest {
                provider: "google".into(),
                redirect_to: "http://localhost:5173/auth/callback".into(),
                query_params: vec![
                    ("access_type".into(), "offline".into()),
                    ("prompt".into(), "consent".into()),
                ],
            })
            .await
            .unwrap();

        let url = url::Url::parse(&redirect.url).unwrap();
        assert_eq!(url.path(), "/auth/v1/authorize");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("provider".into(), "google".into())));
        assert!(pairs.contains(&(
            "redirect_to".into(),
            "http://localhost:5173/auth/callback".into()
        )));
        assert!(pairs.contains(&("access_type".into(), "offline".into())));
        assert!(pairs.contains(&("prompt".into(), "consent".into())));
    }

    #[tokio::test]
    async fn test_refresh_without_session_is_session_missing() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let service = RestAuthService::new("https://b.example", "anon", store);
        let err = service.refresh_session().await.unwrap_err();
        assert!(err.is_session_missing());
    }
}
