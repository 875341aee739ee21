//! Route gating and the OAuth callback landing.

use std::time::{Duration, Instant};

use url::Url;

use crate::config::SessionConfig;
use crate::session::AuthState;

/// Routes reachable without a session, besides the callback path.
const PUBLIC_ROUTES: &[&str] = &["/", "/login", "/register", "/reset-password"];
const CALLBACK_PREFIX: &str = "/callback";
const REGISTER_ROUTE: &str = "/register";

const LOOP_WINDOW: Duration = Duration::from_secs(1);
const LOOP_THRESHOLD: u32 = 5;

/// What a protected view should do for the current auth state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    /// Auth state not settled yet; render a placeholder.
    Loading,
    Redirect(String),
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn is_public(path: &str, config: &SessionConfig) -> bool {
    PUBLIC_ROUTES.contains(&path)
        || path == config.landing_route
        || path == config.login_route
        || under(path, CALLBACK_PREFIX)
        || under(path, &config.callback_path)
}

/// Decides whether `path` may render for `state`.
pub fn gate(path: &str, state: &AuthState, config: &SessionConfig) -> RouteDecision {
    if state.loading {
        return RouteDecision::Loading;
    }

    let public = is_public(path, config);
    if !state.is_authenticated() {
        if public {
            return RouteDecision::Allow;
        }
        return RouteDecision::Redirect(config.login_route.clone());
    }

    if state.profile_completed {
        if path == config.login_route || path == REGISTER_ROUTE {
            return RouteDecision::Redirect(config.home_route.clone());
        }
        return RouteDecision::Allow;
    }

    if !public && path != config.complete_profile_route {
        return RouteDecision::Redirect(config.complete_profile_route.clone());
    }
    RouteDecision::Allow
}

/// Where a client opening a route ends up once gate redirects are followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Landing {
    Route(String),
    Loading,
    /// The redirects never settle. The client should offer an emergency
    /// sign-out instead of bouncing.
    Looping,
}

/// Follows [`gate`] redirects from `path` until a route renders.
pub fn settle_route(path: &str, state: &AuthState, config: &SessionConfig) -> Landing {
    let mut loop_guard = RedirectLoopGuard::new();
    // Hops are evaluated back to back, so they all fall in one burst.
    let now = Instant::now();
    let mut current = path.to_string();
    loop {
        match gate(&current, state, config) {
            RouteDecision::Allow => return Landing::Route(current),
            RouteDecision::Loading => return Landing::Loading,
            RouteDecision::Redirect(next) => {
                if loop_guard.record(now) {
                    return Landing::Looping;
                }
                tracing::debug!(from = %current, to = %next, "Following gate redirect");
                current = next;
            }
        }
    }
}

/// Tokens handed back in a provider or recovery redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub expires_at: Option<i64>,
    /// Flow that produced the redirect (`recovery`, `signup`, `magiclink`...).
    pub flow: Option<String>,
}

impl CallbackTokens {
    pub fn is_recovery(&self) -> bool {
        self.flow.as_deref() == Some("recovery")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The provider reported an error.
    Failed(String),
    Tokens(CallbackTokens),
    /// Nothing to adopt; the session may already exist.
    Empty,
}

/// Reads the outcome of a provider redirect.
///
/// Parameters are taken from the fragment when it has any, else from the
/// query string.
pub fn parse_callback(raw: &str) -> CallbackOutcome {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => return CallbackOutcome::Failed(format!("Invalid callback URL: {e}")),
    };

    let params: Vec<(String, String)> = match url.fragment().filter(|f| !f.is_empty()) {
        Some(fragment) => url::form_urlencoded::parse(fragment.as_bytes())
            .into_owned()
            .collect(),
        None => url.query_pairs().into_owned().collect(),
    };
    let get = |key: &str| {
        params
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.clone())
    };

    if let Some(error) = get("error") {
        let message = get("error_description").unwrap_or(error);
        return CallbackOutcome::Failed(message);
    }

    match (get("access_token"), get("refresh_token")) {
        (Some(access_token), Some(refresh_token)) => CallbackOutcome::Tokens(CallbackTokens {
            access_token,
            refresh_token,
            token_type: get("token_type"),
            expires_in: get("expires_in").and_then(|v| v.parse().ok()),
            expires_at: get("expires_at").and_then(|v| v.parse().ok()),
            flow: get("type"),
        }),
        _ => CallbackOutcome::Empty,
    }
}

/// Detects a client bouncing between redirects.
#[derive(Debug, Default)]
pub struct RedirectLoopGuard {
    last: Option<Instant>,
    burst: u32,
}

impl RedirectLoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a redirect at `now`; true once the burst looks like a loop.
    pub fn record(&mut self, now: Instant) -> bool {
        let close = self
            .last
            .is_some_and(|last| now.saturating_duration_since(last) < LOOP_WINDOW);
        self.burst = if close { self.burst + 1 } else { 1 };
        self.last = Some(now);

        let looping = self.burst > LOOP_THRESHOLD;
        if looping {
            tracing::warn!(redirects = self.burst, "Redirect loop detected");
        }
        looping
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.burst = 0;
    }
}
