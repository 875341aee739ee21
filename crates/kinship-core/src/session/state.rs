use std::fmt;

use kinship_types::User;

use crate::auth::AuthError;

/// Lifecycle of the controller's session.
///
/// `Uninitialized -> Initializing -> {Authenticated, Anonymous}`, with
/// `Authenticated -> Refreshing -> {Authenticated, Anonymous}`. `Anonymous`
/// is re-enterable; the controller itself is never torn down by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    Initializing,
    Authenticated,
    Anonymous,
    Refreshing,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Initializing => "initializing",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Anonymous => "anonymous",
            SessionPhase::Refreshing => "refreshing",
        };
        f.write_str(name)
    }
}

/// Reactive state exposed to dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    pub user: Option<User>,
    pub loading: bool,
    /// Last observed failure of an auth operation.
    pub error: Option<AuthError>,
    pub profile_completed: bool,
    pub phase: SessionPhase,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            user: None,
            loading: true,
            error: None,
            profile_completed: false,
            phase: SessionPhase::Uninitialized,
        }
    }
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Drops identity and derived flags, leaving the anonymous state.
    pub(crate) fn clear_identity(&mut self) {
        self.user = None;
        self.profile_completed = false;
        self.phase = SessionPhase::Anonymous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_loading_and_anonymous() {
        let state = AuthState::default();
        assert!(state.loading);
        assert!(!state.is_authenticated());
        assert!(!state.profile_completed);
        assert_eq!(state.phase, SessionPhase::Uninitialized);
    }

    #[test]
    fn test_clear_identity_keeps_error() {
        let mut state = AuthState {
            user: Some(User::new("u-1", None)),
            loading: false,
            error: Some(AuthError::network("offline")),
            profile_completed: true,
            phase: SessionPhase::Authenticated,
        };
        state.clear_identity();
        assert_eq!(state.user_id(), None);
        assert!(!state.profile_completed);
        assert_eq!(state.phase, SessionPhase::Anonymous);
        assert!(state.error.is_some());
    }
}
