//! Shared identity, session and auth-event types.
//!
//! These mirror the JSON shapes returned by the hosted auth backend, so they
//! deserialize straight from its responses and can be persisted verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// User-supplied metadata attached to an auth identity.
///
/// Only the keys the client reasons about are typed; everything else is
/// preserved in `extra` so a round-trip never drops data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_skipped: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserMetadata {
    /// Metadata carrying only a display name (used on sign-up).
    pub fn with_full_name(name: impl Into<String>) -> Self {
        Self {
            full_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// True when the metadata itself marks onboarding as finished or skipped.
    pub fn affirms_profile_completion(&self) -> bool {
        self.profile_completed == Some(true) || self.profile_skipped == Some(true)
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            email,
            user_metadata: UserMetadata::default(),
            created_at: None,
        }
    }
}

/// Credential material for the current user, bounded by `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    /// Expiry as unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// Seconds left before expiry. A session without an expiry counts as
    /// already expired.
    pub fn seconds_until_expiry(&self, now_unix: i64) -> i64 {
        self.expires_at.unwrap_or(0) - now_unix
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.seconds_until_expiry(now_unix) <= 0
    }

    /// Fills `expires_at` from `expires_in` when the backend omitted it.
    #[must_use]
    pub fn with_expiry_from(mut self, issued_at_unix: i64) -> Self {
        if self.expires_at.is_none() && self.expires_in > 0 {
            self.expires_at = Some(issued_at_unix + self.expires_in);
        }
        self
    }
}

/// Session-change feed event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthEventKind::InitialSession => "INITIAL_SESSION",
            AuthEventKind::SignedIn => "SIGNED_IN",
            AuthEventKind::SignedOut => "SIGNED_OUT",
            AuthEventKind::TokenRefreshed => "TOKEN_REFRESHED",
            AuthEventKind::UserUpdated => "USER_UPDATED",
            AuthEventKind::PasswordRecovery => "PASSWORD_RECOVERY",
        };
        f.write_str(name)
    }
}

/// One entry on the session-change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChangeEvent {
    pub kind: AuthEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

impl AuthChangeEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

/// Which sessions a sign-out invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignOutScope {
    /// Every device and tab.
    #[default]
    Global,
    /// Only the current session.
    Local,
    /// Every session except the current one.
    Others,
}

impl SignOutScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignOutScope::Global => "global",
            SignOutScope::Local => "local",
            SignOutScope::Others => "others",
        }
    }
}

/// Parameters for starting a provider redirect flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthRequest {
    pub provider: String,
    pub redirect_to: String,
    /// Extra query parameters forwarded to the provider.
    pub query_params: Vec<(String, String)>,
}

/// Where the browser must go to continue a provider sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthRedirect {
    pub provider: String,
    pub url: String,
}

/// Onboarding flags stored on the app-domain profile row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileCompletion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_profile_completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_skipped: Option<bool>,
}

impl ProfileCompletion {
    pub fn is_complete(&self) -> bool {
        self.is_profile_completed == Some(true) || self.profile_skipped == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_deserializes_backend_token_response() {
        let json = r#"{
            "access_token": "at",
            "refresh_token": "rt",
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": 1700003600,
            "user": {
                "id": "u-1",
                "email": "a@example.com",
                "user_metadata": {"full_name": "Ada", "avatar_url": "x.png"}
            }
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.expires_at, Some(1_700_003_600));
        assert_eq!(session.user.user_metadata.full_name.as_deref(), Some("Ada"));
        assert_eq!(
            session.user.user_metadata.extra.get("avatar_url"),
            Some(&Value::String("x.png".to_string()))
        );
    }

    #[test]
    fn test_seconds_until_expiry_without_expiry_is_non_positive() {
        let session = Session {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "bearer".into(),
            expires_in: 0,
            expires_at: None,
            user: User::new("u", None),
        };
        assert!(session.is_expired(1));
    }

    #[test]
    fn test_with_expiry_from_fills_missing_expires_at() {
        let session = Session {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "bearer".into(),
            expires_in: 3600,
            expires_at: None,
            user: User::new("u", None),
        }
        .with_expiry_from(100);
        assert_eq!(session.expires_at, Some(3700));
        assert_eq!(session.seconds_until_expiry(700), 3000);
    }

    #[test]
    fn test_metadata_flags() {
        let mut meta = UserMetadata::default();
        assert!(!meta.affirms_profile_completion());
        meta.profile_skipped = Some(true);
        assert!(meta.affirms_profile_completion());
    }

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&AuthEventKind::TokenRefreshed).unwrap();
        assert_eq!(json, "\"TOKEN_REFRESHED\"");
        assert_eq!(AuthEventKind::SignedOut.to_string(), "SIGNED_OUT");
    }
}
