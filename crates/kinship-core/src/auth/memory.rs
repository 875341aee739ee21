//! In-process auth backend.
//!
//! Behaves like the hosted service (same events, same error kinds) without a
//! network, and lets callers script failures and inspect call counts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kinship_types::{
    AuthChangeEvent, AuthEventKind, OAuthRedirect, OAuthRequest, Session, SignOutScope, User,
    UserMetadata,
};
use tokio::sync::broadcast;

use super::{AUTH_EVENT_CAPACITY, AuthError, AuthErrorKind, AuthResult, AuthService, ServiceFuture};

const SESSION_LIFETIME_SECS: i64 = 3600;
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Default)]
struct Calls {
    get_session: AtomicUsize,
    sign_in: AtomicUsize,
    sign_up: AtomicUsize,
    sign_out: AtomicUsize,
    refresh: AtomicUsize,
    get_user: AtomicUsize,
}

#[derive(Debug, Default)]
struct Faults {
    get_session: Option<AuthError>,
    refresh: Option<AuthError>,
    sign_out: Option<AuthError>,
}

/// Scripted auth backend.
#[derive(Debug)]
pub struct MemoryAuthService {
    session: Mutex<Option<Session>>,
    accounts: Mutex<HashMap<String, (String, User)>>,
    faults: Mutex<Faults>,
    recovery_emails: Mutex<Vec<String>>,
    oauth_requests: Mutex<Vec<OAuthRequest>>,
    latency: Option<Duration>,
    calls: Calls,
    events: broadcast::Sender<AuthChangeEvent>,
    token_counter: AtomicUsize,
}

impl Default for MemoryAuthService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            session: Mutex::new(None),
            accounts: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            recovery_emails: Mutex::new(Vec::new()),
            oauth_requests: Mutex::new(Vec::new()),
            latency: None,
            calls: Calls::default(),
            events,
            token_counter: AtomicUsize::new(0),
        }
    }

    /// Starts with an existing session (as if restored from storage).
    #[must_use]
    pub fn with_session(self, session: Session) -> Self {
        self.set_session(Some(session));
        self
    }

    /// Delays every network-like call, making overlap observable.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Registers an account that `sign_in_with_password` accepts.
    pub fn register(&self, email: &str, password: &str, user: User) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(email.to_string(), (password.to_string(), user));
        }
    }

    /// Replaces the session silently (another tab changing it behind our back).
    pub fn set_session(&self, session: Option<Session>) {
        if let Ok(mut current) = self.session.lock() {
            *current = session;
        }
    }

    /// Pushes an event onto the feed.
    pub fn emit(&self, event: AuthChangeEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_next_get_session(&self, err: AuthError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.get_session = Some(err);
        }
    }

    pub fn fail_next_refresh(&self, err: AuthError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.refresh = Some(err);
        }
    }

    pub fn fail_next_sign_out(&self, err: AuthError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.sign_out = Some(err);
        }
    }

    pub fn get_session_calls(&self) -> usize {
        self.calls.get_session.load(Ordering::SeqCst)
    }

    pub fn sign_in_calls(&self) -> usize {
        self.calls.sign_in.load(Ordering::SeqCst)
    }

    pub fn sign_up_calls(&self) -> usize {
        self.calls.sign_up.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.calls.sign_out.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.calls.refresh.load(Ordering::SeqCst)
    }

    pub fn get_user_calls(&self) -> usize {
        self.calls.get_user.load(Ordering::SeqCst)
    }

    pub fn recovery_emails(&self) -> Vec<String> {
        self.recovery_emails
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn oauth_requests(&self) -> Vec<OAuthRequest> {
        self.oauth_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    /// Issues a session for `user` expiring `lifetime_secs` from now.
    pub fn issue_session(&self, user: User, lifetime_secs: i64) -> Session {
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
        Session {
            access_token: format!("access-{n}"),
            refresh_token: format!("refresh-{n}"),
            token_type: "bearer".to_string(),
            expires_in: lifetime_secs,
            expires_at: Some(chrono::Utc::now().timestamp() + lifetime_secs),
            user,
        }
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> Option<AuthError>) -> Option<AuthError> {
        self.faults.lock().ok().and_then(|mut f| pick(&mut f))
    }

    fn send(&self, kind: AuthEventKind, session: Option<Session>) {
        self.emit(AuthChangeEvent::new(kind, session));
    }

    async fn get_session_inner(&self) -> AuthResult<Option<Session>> {
        self.calls.get_session.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(err) = self.take_fault(|f| f.get_session.take()) {
            return Err(err);
        }
        Ok(self.current_session())
    }

    async fn sign_up_inner(
        &self,
        email: &str,
        password: &str,
        metadata: UserMetadata,
    ) -> AuthResult<User> {
        self.calls.sign_up.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if password.len() < MIN_PASSWORD_LEN {
            let mut err = AuthError::new(
                AuthErrorKind::Api,
                format!("Password should be at least {MIN_PASSWORD_LEN} characters."),
            );
            err.code = Some("weak_password".to_string());
            return Err(err);
        }

        let mut accounts = self
            .accounts
            .lock()
            .map_err(|_| AuthError::internal("accounts poisoned"))?;
        if accounts.contains_key(email) {
            let mut err = AuthError::new(AuthErrorKind::Api, "User already registered");
            err.code = Some("user_already_exists".to_string());
            return Err(err);
        }

        let mut user = User::new(format!("user-{}", accounts.len() + 1), Some(email.to_string()));
        user.user_metadata = metadata;
        accounts.insert(email.to_string(), (password.to_string(), user.clone()));
        Ok(user)
    }

    async fn sign_in_inner(&self, email: &str, password: &str) -> AuthResult<Session> {
        self.calls.sign_in.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let user = self
            .accounts
            .lock()
            .ok()
            .and_then(|accounts| accounts.get(email).cloned())
            .filter(|(expected, _)| expected == password)
            .map(|(_, user)| user);

        let Some(user) = user else {
            let mut err = AuthError::new(AuthErrorKind::Api, "Invalid login credentials");
            err.status = Some(400);
            err.code = Some("invalid_credentials".to_string());
            return Err(err);
        };

        let session = self.issue_session(user, SESSION_LIFETIME_SECS);
        self.set_session(Some(session.clone()));
        self.send(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out_inner(&self, scope: SignOutScope) -> AuthResult<()> {
        self.calls.sign_out.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if scope != SignOutScope::Others {
            self.set_session(None);
            self.send(AuthEventKind::SignedOut, None);
        }
        match self.take_fault(|f| f.sign_out.take()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn refresh_inner(&self) -> AuthResult<Session> {
        self.calls.refresh.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(err) = self.take_fault(|f| f.refresh.take()) {
            if err.is_session_missing() {
                self.set_session(None);
                self.send(AuthEventKind::SignedOut, None);
            }
            return Err(err);
        }

        let Some(current) = self.current_session() else {
            return Err(AuthError::session_missing("Auth session missing!"));
        };
        let session = self.issue_session(current.user, SESSION_LIFETIME_SECS);
        self.set_session(Some(session.clone()));
        self.send(AuthEventKind::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }

    async fn get_user_inner(&self) -> AuthResult<Option<User>> {
        self.calls.get_user.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self.current_session().map(|s| s.user))
    }

    async fn update_password_inner(&self, new_password: &str) -> AuthResult<User> {
        self.pause().await;
        let Some(session) = self.current_session() else {
            return Err(AuthError::session_missing("Auth session missing!"));
        };
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::new(
                AuthErrorKind::Api,
                format!("Password should be at least {MIN_PASSWORD_LEN} characters."),
            ));
        }
        if let Some(email) = &session.user.email
            && let Ok(mut accounts) = self.accounts.lock()
            && let Some(entry) = accounts.get_mut(email)
        {
            entry.0 = new_password.to_string();
        }
        self.send(AuthEventKind::UserUpdated, Some(session.clone()));
        Ok(session.user)
    }
}

impl AuthService for MemoryAuthService {
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
        Box::pin(self.refresh_inner())
    }

    fn sign_in_with_oauth(&self, request: OAuthRequest) -> ServiceFuture<'_, OAuthRedirect> {
        let mut url = match url::Url::parse("memory://auth/authorize") {
            Ok(url) => url,
            Err(e) => return Box::pin(async move { Err(AuthError::internal(e.to_string())) }),
        };
        url.query_pairs_mut()
            .append_pair("provider", &request.provider)
            .append_pair("redirect_to", &request.redirect_to)
            .extend_pairs(&request.query_params);
        let redirect = OAuthRedirect {
            provider: request.provider.clone(),
            url: url.to_string(),
        };
        if let Ok(mut requests) = self.oauth_requests.lock() {
            requests.push(request);
        }
        Box::pin(async move { Ok(redirect) })
    }

    fn get_user(&self) -> ServiceFuture<'_, Option<User>> {
        Box::pin(self.get_user_inner())
    }

    fn reset_password_for_email<'a>(
        &'a self,
        email: &'a str,
        _redirect_to: &'a str,
    ) -> ServiceFuture<'a, ()> {
        if let Ok(mut emails) = self.recovery_emails.lock() {
            emails.push(email.to_string());
        }
        Box::pin(async { Ok(()) })
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

    #[tokio::test]
    async fn test_sign_in_emits_signed_in_with_session() {
        let service = MemoryAuthService::new();
        service.register("a@example.com", "secret1", User::new("u-1", None));
        let mut feed = service.subscribe();

        let session = service
            .sign_in_with_password("a@example.com", "secret1")
            .await
            .unwrap();
        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, AuthEventKind::SignedIn);
        assert_eq!(event.session, Some(session));
    }

    #[tokio::test]
    async fn test_wrong_password_is_api_error() {
        let service = MemoryAuthService::new();
        service.register("a@example.com", "secret1", User::new("u-1", None));
        let err = service
            .sign_in_with_password("a@example.com", "nope")
            .await
            .unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::Api);
        assert!(service.current_session().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_sign_up_rejected() {
        let service = MemoryAuthService::new();
        service
            .sign_up("a@example.com", "secret1", UserMetadata::default())
            .await
            .unwrap();
        let err = service
            .sign_up("a@example.com", "secret1", UserMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("user_already_exists"));
    }

    #[tokio::test]
    async fn test_scripted_session_missing_refresh_drops_session() {
        let service = MemoryAuthService::new();
        let session = service.issue_session(User::new("u", None), 10);
        service.set_session(Some(session));
        service.fail_next_refresh(AuthError::session_missing("gone"));

        assert!(service.refresh_session().await.unwrap_err().is_session_missing());
        assert!(service.current_session().is_none());
        assert_eq!(service.refresh_calls(), 1);
    }
}
