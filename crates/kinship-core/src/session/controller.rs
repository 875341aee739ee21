use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kinship_types::{
    AuthChangeEvent, AuthEventKind, OAuthRedirect, OAuthRequest, ProfileCompletion, Session,
    SignOutScope, User, UserMetadata,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::completion::resolve_completion;
use super::guard::InFlight;
use super::state::{AuthState, SessionPhase};
use crate::auth::{AuthError, AuthResult};
use crate::context::AuthContext;
use crate::navigator::Navigator;
use crate::store::keys;

/// Result of [`SessionController::refresh_session_if_needed`].
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// A new session was issued.
    Refreshed(Session),
    /// The session was far enough from expiry to keep.
    Current(Session),
}

impl RefreshOutcome {
    pub fn session(&self) -> &Session {
        match self {
            RefreshOutcome::Refreshed(session) | RefreshOutcome::Current(session) => session,
        }
    }
}

/// Owns the authenticated-user lifecycle and publishes it as [`AuthState`].
///
/// Cloning is cheap; clones share the same state and guards.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: AuthContext,
    state: watch::Sender<AuthState>,
    initializing: InFlight,
    init_completed: AtomicBool,
    profile_check: InFlight,
    /// User whose completion flag was last published by a profile check.
    resolved_for: Mutex<Option<String>>,
    listener: Mutex<Option<CancellationToken>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock()
            && let Some(token) = listener.take()
        {
            token.cancel();
        }
    }
}

impl SessionController {
    pub fn new(ctx: AuthContext) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        Self {
            inner: Arc::new(Inner {
                ctx,
                state,
                initializing: InFlight::new(),
                init_completed: AtomicBool::new(false),
                profile_check: InFlight::new(),
                resolved_for: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    fn ctx(&self) -> &AuthContext {
        &self.inner.ctx
    }

    // ---- state access ----

    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn user(&self) -> Option<User> {
        self.inner.state.borrow().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn error(&self) -> Option<AuthError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn profile_completed(&self) -> bool {
        self.inner.state.borrow().profile_completed
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.borrow().phase
    }

    /// Applies `f` and notifies watchers only when something changed, so
    /// replayed events never wake dependents.
    fn update(&self, f: impl FnOnce(&mut AuthState)) {
        self.inner.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    fn begin_operation(&self, loading: bool) {
        self.update(|s| {
            s.error = None;
            if loading {
                s.loading = true;
            }
        });
    }

    fn record_failure(&self, err: &AuthError) {
        let err = err.clone();
        self.update(|s| {
            s.loading = false;
            s.error = Some(err);
        });
    }

    fn current_user_id(&self) -> Option<String> {
        self.inner.state.borrow().user_id().map(str::to_string)
    }

    // ---- lifecycle ----

    /// Discovers an existing session and starts listening to the
    /// session-change feed.
    ///
    /// Only the first call does any work; calls made while it runs or after it
    /// finished return immediately.
    pub async fn initialize(&self) {
        if self.inner.init_completed.load(Ordering::Acquire) {
            tracing::debug!("Session controller already initialized");
            return;
        }
        let Some(_guard) = self.inner.initializing.try_begin() else {
            tracing::debug!("Session controller initialization already running");
            return;
        };
        if self.inner.init_completed.load(Ordering::Acquire) {
            return;
        }

        self.update(|s| {
            s.phase = SessionPhase::Initializing;
            s.loading = true;
        });
        self.start_listener();

        match self.ctx().auth.get_session().await {
            Ok(Some(session)) => {
                tracing::info!(user_id = %session.user.id, "Existing session found");
                self.apply_session(&session);
                self.resolve_profile_completion(&session.user).await;
            }
            Ok(None) => {
                tracing::info!("No existing session");
                self.update(AuthState::clear_identity);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Session discovery failed");
                self.update(|s| {
                    s.clear_identity();
                    s.error = Some(err);
                });
            }
        }

        self.update(|s| s.loading = false);
        self.inner.init_completed.store(true, Ordering::Release);
    }

    /// Stops listening to the session-change feed.
    pub fn shutdown(&self) {
        if let Ok(mut listener) = self.inner.listener.lock()
            && let Some(token) = listener.take()
        {
            tracing::debug!("Stopping session-change listener");
            token.cancel();
        }
    }

    fn start_listener(&self) {
        let Ok(mut slot) = self.inner.listener.lock() else {
            tracing::error!("Listener slot poisoned; session-change feed not observed");
            return;
        };
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let mut feed = self.ctx().auth.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    received = feed.recv() => match received {
                        Ok(event) => {
                            let Some(inner) = weak.upgrade() else { break };
                            SessionController { inner }.handle_auth_event(event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Session-change listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Session-change listener stopped");
        });
        *slot = Some(token);
    }

    /// Applies one session-change event.
    ///
    /// Safe to call repeatedly with the same event: identical state is not
    /// re-published and profile completion is only re-resolved when the
    /// identity changes or the event says the user changed.
    pub async fn handle_auth_event(&self, event: AuthChangeEvent) {
        tracing::debug!(event = %event.kind, has_session = event.session.is_some(), "Handling auth event");
        match (event.kind, event.session) {
            (AuthEventKind::SignedOut, _) => {
                self.clear_markers();
                self.update(|s| {
                    s.clear_identity();
                    s.loading = false;
                });
            }
            (_, None) => {
                self.update(|s| {
                    s.clear_identity();
                    s.loading = false;
                });
            }
            (kind, Some(session)) => {
                let identity_changed =
                    self.current_user_id().as_deref() != Some(session.user.id.as_str());
                if identity_changed {
                    // Gate consumers until the new user's profile flag is known.
                    self.update(|s| s.loading = true);
                }
                self.apply_session(&session);
                if kind == AuthEventKind::TokenRefreshed {
                    self.write_marker(keys::LAST_SESSION_REFRESH, &Utc::now().to_rfc3339());
                }
                if identity_changed
                    || matches!(kind, AuthEventKind::SignedIn | AuthEventKind::UserUpdated)
                {
                    self.resolve_profile_completion(&session.user).await;
                }
                self.update(|s| s.loading = false);
            }
        }
    }

    fn apply_session(&self, session: &Session) {
        let user = session.user.clone();
        self.forget_resolution_unless(&user.id);
        self.update(|s| {
            if s.user_id() != Some(user.id.as_str()) {
                s.profile_completed = false;
            }
            s.user = Some(user);
            s.phase = SessionPhase::Authenticated;
        });
        self.write_session_markers(session);
    }

    fn apply_user(&self, user: &User) {
        let user = user.clone();
        self.forget_resolution_unless(&user.id);
        self.update(|s| {
            if s.user_id() != Some(user.id.as_str()) {
                s.profile_completed = false;
            }
            s.user = Some(user);
            s.phase = SessionPhase::Authenticated;
        });
    }

    // ---- profile completion ----

    fn forget_resolution_unless(&self, user_id: &str) {
        if self.current_user_id().as_deref() != Some(user_id)
            && let Ok(mut resolved) = self.inner.resolved_for.lock()
        {
            *resolved = None;
        }
    }

    fn resolved_for(&self, user_id: &str) -> bool {
        self.inner
            .resolved_for
            .lock()
            .is_ok_and(|resolved| resolved.as_deref() == Some(user_id))
    }

    /// Resolves and publishes the profile completion flag for `user`.
    ///
    /// Never runs two checks at once. A caller arriving while one is in
    /// flight waits for it and returns `None` if it settled the flag for
    /// `user` (it follows whichever user is current when it finishes);
    /// otherwise the caller runs its own check. A result is only published
    /// while its user is still the signed-in one.
    pub async fn resolve_profile_completion(&self, user: &User) -> Option<bool> {
        let _guard = loop {
            if let Some(guard) = self.inner.profile_check.try_begin() {
                break guard;
            }
            tracing::debug!(user_id = %user.id, "Profile check already in progress; waiting");
            self.inner.profile_check.wait_idle().await;
            if self.resolved_for(&user.id) {
                return None;
            }
        };

        let config = &self.ctx().config;
        let mut target = user.clone();
        loop {
            let completed = resolve_completion(
                self.ctx().profiles.as_ref(),
                &target,
                config.profile_check_attempts,
                config.profile_retry_delay,
            )
            .await;

            let mut successor = None;
            let mut published = false;
            self.update(|s| match &s.user {
                Some(current) if current.id == target.id => {
                    s.profile_completed = completed;
                    published = true;
                }
                Some(current) => successor = Some(current.clone()),
                None => {}
            });
            if published && let Ok(mut resolved) = self.inner.resolved_for.lock() {
                *resolved = Some(target.id.clone());
            }

            match successor {
                Some(next) => {
                    tracing::debug!(from = %target.id, to = %next.id, "User changed during profile check");
                    target = next;
                }
                None => return Some(completed),
            }
        }
    }

    /// Persists the completion (or skip) flag and marks the profile complete.
    ///
    /// # Errors
    /// Returns an error when nobody is signed in or the write fails.
    pub async fn mark_profile_completed(&self, skipped: bool) -> AuthResult<()> {
        let Some(user_id) = self.current_user_id() else {
            return Err(AuthError::session_missing("No active session"));
        };
        let flags = if skipped {
            ProfileCompletion {
                is_profile_completed: None,
                profile_skipped: Some(true),
            }
        } else {
            ProfileCompletion {
                is_profile_completed: Some(true),
                profile_skipped: None,
            }
        };

        match self.ctx().profiles.update_completion(&user_id, flags).await {
            Ok(()) => {
                self.update(|s| {
                    if s.user_id() == Some(user_id.as_str()) {
                        s.profile_completed = true;
                    }
                });
                Ok(())
            }
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "Failed to update profile completion");
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    // ---- explicit user intents ----

    /// Registers a new identity. Profile rows are created later, by onboarding.
    ///
    /// # Errors
    /// Returns the backend's error (duplicate account, weak password...).
    pub async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> AuthResult<User> {
        self.begin_operation(true);
        let metadata = UserMetadata::with_full_name(full_name);
        match self.ctx().auth.sign_up(email, password, metadata).await {
            Ok(user) => {
                tracing::info!(user_id = %user.id, "Signed up");
                self.update(|s| s.loading = false);
                Ok(user)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Sign-up failed");
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Signs in with email and password.
    ///
    /// The user is set by the resulting `SIGNED_IN` event, not here.
    ///
    /// # Errors
    /// Returns the backend's error, e.g. invalid credentials.
    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<()> {
        self.begin_operation(true);
        match self.ctx().auth.sign_in_with_password(email, password).await {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "Sign-in failed");
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Signs out everywhere and hard-redirects to the landing route.
    ///
    /// Never fails: a remote error is logged and local state is cleared
    /// anyway. If this future is dropped or panics midway, the redirect still
    /// fires after the fallback delay.
    pub async fn sign_out(&self) {
        let config = &self.ctx().config;
        let fallback = PendingRedirect::new(
            Arc::clone(&self.ctx().navigator),
            &config.landing_route,
            Some(config.sign_out_fallback_delay),
        )
        .with_reset(self.clone());

        if let Err(err) = self.purge_known_keys() {
            tracing::warn!(error = %err, "Failed to purge local credentials");
        }

        match self.ctx().auth.get_session().await {
            Ok(Some(_)) => {
                if let Err(err) = self.ctx().auth.sign_out(SignOutScope::Global).await {
                    tracing::warn!(error = %err, "Remote sign-out failed; continuing");
                }
            }
            Ok(None) => tracing::debug!("No live session to invalidate"),
            Err(err) => tracing::warn!(error = %err, "Could not read session before sign-out"),
        }

        self.update(|s| {
            s.clear_identity();
            s.loading = false;
            s.error = None;
        });
        tracing::info!("Signed out");
        fallback.fire_now();
    }

    /// Best-effort sign-out for a controller that may itself be broken.
    ///
    /// Removes every auth-related key the store holds, drops the backend's
    /// local session and always ends with a redirect to the landing route,
    /// even when this future is dropped midway.
    pub async fn emergency_sign_out(&self) {
        let _redirect = PendingRedirect::new(
            Arc::clone(&self.ctx().navigator),
            &self.ctx().config.landing_route,
            None,
        );
        tracing::warn!("Emergency sign-out");

        let store = &self.ctx().store;
        match store.keys() {
            Ok(all) => {
                for key in all.iter().filter(|k| keys::is_auth_related(k)) {
                    if let Err(err) = store.remove(key) {
                        tracing::warn!(key = %key, error = %format!("{err:#}"), "Failed to remove key");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "Failed to enumerate storage"),
        }

        self.update(|s| {
            s.clear_identity();
            s.loading = false;
        });

        if let Err(err) = self.ctx().auth.sign_out(SignOutScope::Local).await {
            tracing::warn!(error = %err, "Local sign-out after emergency purge failed");
        }
    }

    /// Refreshes the session when it is within the configured threshold of
    /// expiry, or unconditionally with `force`.
    ///
    /// # Errors
    /// Returns `SessionMissing` when there is no session or the refresh
    /// credential was rejected (the latter also signs out). Other refresh
    /// errors are returned as-is and leave the session alone.
    pub async fn refresh_session_if_needed(&self, force: bool) -> AuthResult<RefreshOutcome> {
        let session = match self.ctx().auth.get_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                if self.is_authenticated() {
                    tracing::info!("Session vanished; clearing user");
                    self.update(AuthState::clear_identity);
                }
                return Err(AuthError::session_missing("No active session"));
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read session");
                return Err(err);
            }
        };

        let remaining = session.seconds_until_expiry(Utc::now().timestamp());
        let threshold = self.ctx().config.refresh_threshold_secs;
        if !force && remaining >= threshold {
            tracing::debug!(remaining, "Session fresh; no refresh needed");
            self.reconcile(&session).await;
            return Ok(RefreshOutcome::Current(session));
        }

        tracing::info!(remaining, force, "Refreshing session");
        self.update(|s| s.phase = SessionPhase::Refreshing);
        match self.ctx().auth.refresh_session().await {
            Ok(fresh) => {
                self.apply_session(&fresh);
                self.write_marker(keys::LAST_SESSION_REFRESH, &Utc::now().to_rfc3339());
                self.resolve_profile_completion(&fresh.user).await;
                Ok(RefreshOutcome::Refreshed(fresh))
            }
            Err(err) if err.is_session_missing() => {
                tracing::warn!(error = %err, "Refresh credential rejected; signing out");
                self.update(AuthState::clear_identity);
                self.sign_out().await;
                Err(AuthError::session_missing("Session expired"))
            }
            Err(err) => {
                tracing::warn!(error = %err, "Session refresh failed");
                self.update(|s| {
                    s.phase = if s.user.is_some() {
                        SessionPhase::Authenticated
                    } else {
                        SessionPhase::Anonymous
                    };
                });
                Err(err)
            }
        }
    }

    /// Follows a session whose identity drifted from ours (another tab).
    async fn reconcile(&self, session: &Session) {
        if self.current_user_id().as_deref() == Some(session.user.id.as_str()) {
            return;
        }
        tracing::info!(user_id = %session.user.id, "Session identity drifted; reconciling");
        self.apply_session(session);
        self.resolve_profile_completion(&session.user).await;
    }

    /// Starts the configured provider's redirect flow, asking for offline
    /// access and forced consent so a refresh credential is issued.
    ///
    /// # Errors
    /// Returns an error if the flow cannot be started.
    pub async fn sign_in_with_google(
        &self,
        redirect_to: Option<&str>,
    ) -> AuthResult<OAuthRedirect> {
        let config = &self.ctx().config;
        let redirect_to = redirect_to
            .map(str::to_string)
            .unwrap_or_else(|| config.default_redirect_target());
        let request = OAuthRequest {
            provider: config.oauth_provider.clone(),
            redirect_to,
            query_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        };

        self.begin_operation(false);
        self.ctx().auth.sign_in_with_oauth(request).await.map_err(|err| {
            tracing::warn!(error = %err, "OAuth sign-in could not start");
            self.record_failure(&err);
            err
        })
    }

    /// Sends a password-recovery email.
    ///
    /// # Errors
    /// Returns the backend's error.
    pub async fn reset_password(&self, email: &str) -> AuthResult<()> {
        self.begin_operation(false);
        let target = self.ctx().config.password_reset_target();
        self.ctx()
            .auth
            .reset_password_for_email(email, &target)
            .await
            .map_err(|err| {
                self.record_failure(&err);
                err
            })
    }

    /// Changes the signed-in user's password.
    ///
    /// # Errors
    /// Returns the backend's error.
    pub async fn update_password(&self, new_password: &str) -> AuthResult<User> {
        self.begin_operation(false);
        self.ctx()
            .auth
            .update_password(new_password)
            .await
            .map_err(|err| {
                self.record_failure(&err);
                err
            })
    }

    /// Re-reads the user from the backend and re-resolves profile
    /// completion. Failures are only logged.
    pub async fn refresh_user_data(&self) {
        match self.ctx().auth.get_user().await {
            Ok(Some(user)) => {
                self.apply_user(&user);
                self.resolve_profile_completion(&user).await;
            }
            Ok(None) => tracing::debug!("No user to refresh"),
            Err(err) => tracing::warn!(error = %err, "Failed to refresh user data"),
        }
    }

    pub fn redirect_to_home(&self) {
        self.ctx().navigator.redirect(&self.ctx().config.home_route);
    }

    // ---- advisory markers ----

    fn write_marker(&self, key: &str, value: &str) {
        if let Err(err) = self.ctx().store.set(key, value) {
            tracing::debug!(key, error = %format!("{err:#}"), "Failed to write marker");
        }
    }

    fn write_session_markers(&self, session: &Session) {
        self.write_marker(keys::HAS_SESSION, "true");
        self.write_marker(keys::AUTH_USER_ID, &session.user.id);
        if let Some(expires_at) = session
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        {
            self.write_marker(keys::SESSION_EXPIRES_AT, &expires_at.to_rfc3339());
        }
    }

    fn clear_markers(&self) {
        for key in [
            keys::HAS_SESSION,
            keys::AUTH_USER_ID,
            keys::SESSION_EXPIRES_AT,
            keys::LAST_SESSION_REFRESH,
        ] {
            if let Err(err) = self.ctx().store.remove(key) {
                tracing::debug!(key, error = %format!("{err:#}"), "Failed to remove marker");
            }
        }
    }

    fn purge_known_keys(&self) -> AuthResult<()> {
        let mut first_error = None;
        for key in keys::KNOWN {
            if let Err(err) = self.ctx().store.remove(key) {
                first_error.get_or_insert_with(|| AuthError::storage(&err));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reads an advisory marker (`has_session`, `session_expires_at`, ...).
    pub fn marker(&self, key: &str) -> Option<String> {
        self.ctx().store.get(key).ok().flatten()
    }
}

/// Redirect that fires when dropped unless already fired.
///
/// With a delay, firing on drop clears the controller state and schedules
/// the redirect on the runtime (immediately when there is none).
struct PendingRedirect {
    navigator: Arc<dyn Navigator>,
    route: String,
    delay: Option<Duration>,
    reset: Option<SessionController>,
    armed: bool,
}

impl PendingRedirect {
    fn new(navigator: Arc<dyn Navigator>, route: &str, delay: Option<Duration>) -> Self {
        Self {
            navigator,
            route: route.to_string(),
            delay,
            reset: None,
            armed: true,
        }
    }

    fn with_reset(mut self, controller: SessionController) -> Self {
        self.reset = Some(controller);
        self
    }

    fn fire_now(mut self) {
        self.armed = false;
        self.navigator.redirect(&self.route);
    }
}

impl Drop for PendingRedirect {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(controller) = self.reset.take() {
            controller.update(|s| {
                s.clear_identity();
                s.loading = false;
            });
        }

        let delay = self.delay.filter(|d| !d.is_zero());
        match (delay, tokio::runtime::Handle::try_current()) {
            (Some(delay), Ok(handle)) => {
                tracing::warn!(route = %self.route, "Scheduling fallback redirect");
                let navigator = Arc::clone(&self.navigator);
                let route = std::mem::take(&mut self.route);
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    navigator.redirect(&route);
                });
            }
            _ => self.navigator.redirect(&self.route),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use kinship_types::User;

    use super::*;
    use crate::auth::MemoryAuthService;
    use crate::config::SessionConfig;
    use crate::profile::MemoryProfileService;
    use crate::store::{CredentialStore, MemoryCredentialStore};

    #[derive(Default)]
    struct CountingNavigator {
        count: AtomicUsize,
        last: Mutex<Option<String>>,
    }

    impl Navigator for CountingNavigator {
        fn redirect(&self, route: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last.lock() {
                *last = Some(route.to_string());
            }
        }
    }

    fn controller(
        auth: Arc<MemoryAuthService>,
        store: Arc<MemoryCredentialStore>,
        navigator: Arc<CountingNavigator>,
    ) -> SessionController {
        SessionController::new(AuthContext::new(
            auth,
            Arc::new(MemoryProfileService::default()),
            store,
            navigator,
            SessionConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_emergency_sign_out_purges_auth_keys_and_redirects() {
        let auth = Arc::new(MemoryAuthService::new());
        let store = Arc::new(MemoryCredentialStore::new());
        store.set("sb-project-auth-token", "x").unwrap();
        store.set(keys::HAS_SESSION, "true").unwrap();
        store.set("theme", "dark").unwrap();
        let navigator = Arc::new(CountingNavigator::default());
        let controller = controller(auth, Arc::clone(&store), Arc::clone(&navigator));

        controller.emergency_sign_out().await;

        assert_eq!(store.keys().unwrap(), vec!["theme".to_string()]);
        assert_eq!(navigator.count.load(Ordering::SeqCst), 1);
        assert_eq!(navigator.last.lock().unwrap().as_deref(), Some("/"));
        assert!(!controller.loading());
    }

    #[tokio::test]
    async fn test_session_markers_written_and_cleared() {
        let auth = Arc::new(MemoryAuthService::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let navigator = Arc::new(CountingNavigator::default());
        let controller = controller(Arc::clone(&auth), Arc::clone(&store), navigator);

        let session = auth.issue_session(User::new("u-1", None), 3600);
        controller
            .handle_auth_event(AuthChangeEvent::new(AuthEventKind::SignedIn, Some(session)))
            .await;
        assert_eq!(controller.marker(keys::AUTH_USER_ID).as_deref(), Some("u-1"));
        assert!(controller.marker(keys::SESSION_EXPIRES_AT).is_some());

        controller
            .handle_auth_event(AuthChangeEvent::new(AuthEventKind::SignedOut, None))
            .await;
        assert_eq!(controller.marker(keys::HAS_SESSION), None);
        assert!(!controller.is_authenticated());
    }

    #[tokio::test]
    async fn test_dropped_sign_out_still_redirects() {
        let auth = Arc::new(MemoryAuthService::new().with_latency(Duration::from_secs(60)));
        let store = Arc::new(MemoryCredentialStore::new());
        let navigator = Arc::new(CountingNavigator::default());
        let controller = controller(auth, store, Arc::clone(&navigator));

        let attempt =
            tokio::time::timeout(Duration::from_millis(10), controller.sign_out()).await;
        assert!(attempt.is_err());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(navigator.count.load(Ordering::SeqCst), 1);
        assert!(!controller.is_authenticated());
    }

    #[test]
    fn test_refresh_outcome_session() {
        let auth = MemoryAuthService::new();
        let session = auth.issue_session(User::new("u", None), 10);
        assert_eq!(RefreshOutcome::Current(session.clone()).session(), &session);
    }
}
