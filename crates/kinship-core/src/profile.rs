//! Profile Data Service: the onboarding flags on the `profiles` table.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kinship_types::ProfileCompletion;
use reqwest::StatusCode;

use crate::auth::{AuthError, AuthErrorKind, AuthResult, AuthService, ServiceFuture};

const PROFILES_TABLE: &str = "profiles";
const COMPLETION_COLUMNS: &str = "is_profile_completed,profile_skipped";
/// Makes PostgREST return a single object and fail with PGRST116 on zero rows.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Remote table access for profile completion flags.
pub trait ProfileService: Send + Sync {
    /// Reads the completion flags of one profile row.
    fn fetch_completion<'a>(&'a self, user_id: &'a str) -> ServiceFuture<'a, ProfileCompletion>;

    /// Writes the completion flags of one profile row.
    fn update_completion<'a>(
        &'a self,
        user_id: &'a str,
        flags: ProfileCompletion,
    ) -> ServiceFuture<'a, ()>;
}

/// PostgREST client for the `profiles` table.
pub struct RestProfileService {
    base_url: String,
    anon_key: String,
    auth: Arc<dyn AuthService>,
    http: reqwest::Client,
}

impl RestProfileService {
    /// Requests are authorized with the auth client's current access token,
    /// falling back to the anon key.
    pub fn new(base_url: &str, anon_key: &str, auth: Arc<dyn AuthService>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            auth,
            http: reqwest::Client::new(),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{PROFILES_TABLE}", self.base_url)
    }

    async fn bearer(&self) -> String {
        match self.auth.get_session().await {
            Ok(Some(session)) => session.access_token,
            Ok(None) => self.anon_key.clone(),
            Err(err) => {
                tracing::debug!(error = %err, "No session for profile request; using anon key");
                self.anon_key.clone()
            }
        }
    }

    async fn fetch(&self, user_id: &str) -> AuthResult<ProfileCompletion> {
        let bearer = self.bearer().await;
        let response = self
            .http
            .get(self.table_url())
            .query(&[
                ("id", format!("eq.{user_id}")),
                ("select", COMPLETION_COLUMNS.to_string()),
            ])
            .header("apikey", &self.anon_key)
            .header("Accept", SINGLE_OBJECT)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut err = AuthError::from_response(status.as_u16(), &body);
            // Without a PostgREST body, 406 still means "no single row".
            if status == StatusCode::NOT_ACCEPTABLE && err.code.is_none() {
                err.kind = AuthErrorKind::NotFound;
            }
            return Err(err);
        }

        response
            .json::<ProfileCompletion>()
            .await
            .map_err(|e| AuthError::from_transport(&e))
    }

    async fn update(&self, user_id: &str, flags: ProfileCompletion) -> AuthResult<()> {
        let bearer = self.bearer().await;
        let response = self
            .http
            .patch(self.table_url())
            .query(&[("id", format!("eq.{user_id}"))])
            .header("apikey", &self.anon_key)
            .header("Prefer", "return=minimal")
            .bearer_auth(bearer)
            .json(&flags)
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::from_response(status.as_u16(), &body));
        }
        Ok(())
    }
}

impl ProfileService for RestProfileService {
    fn fetch_completion<'a>(&'a self, user_id: &'a str) -> ServiceFuture<'a, ProfileCompletion> {
        Box::pin(self.fetch(user_id))
    }

    fn update_completion<'a>(
        &'a self,
        user_id: &'a str,
        flags: ProfileCompletion,
    ) -> ServiceFuture<'a, ()> {
        Box::pin(self.update(user_id, flags))
    }
}

/// Scripted profile service for tests and offline use.
///
/// Queued lookup results are consumed in order; once the queue is empty every
/// lookup returns the fallback.
#[derive(Debug)]
pub struct MemoryProfileService {
    script: Mutex<VecDeque<AuthResult<ProfileCompletion>>>,
    fallback: Mutex<AuthResult<ProfileCompletion>>,
    fetch_calls: AtomicUsize,
    updates: Mutex<Vec<(String, ProfileCompletion)>>,
}

impl Default for MemoryProfileService {
    fn default() -> Self {
        Self::new(Err(AuthError::not_found("profile not found")))
    }
}

impl MemoryProfileService {
    pub fn new(fallback: AuthResult<ProfileCompletion>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            fetch_calls: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Lookup always answers with these flags.
    pub fn with_flags(flags: ProfileCompletion) -> Self {
        Self::new(Ok(flags))
    }

    /// Queues one lookup result ahead of the fallback.
    #[must_use]
    pub fn then(self, result: AuthResult<ProfileCompletion>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
        self
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(String, ProfileCompletion)> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    fn next_result(&self) -> AuthResult<ProfileCompletion> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(result) => result,
            None => self
                .fallback
                .lock()
                .map_err(|_| AuthError::internal("profile script poisoned"))
                .and_then(|f| f.clone()),
        }
    }
}

impl ProfileService for MemoryProfileService {
    fn fetch_completion<'a>(&'a self, _user_id: &'a str) -> ServiceFuture<'a, ProfileCompletion> {
        let result = self.next_result();
        Box::pin(async move { result })
    }

    fn update_completion<'a>(
        &'a self,
        user_id: &'a str,
        flags: ProfileCompletion,
    ) -> ServiceFuture<'a, ()> {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((user_id.to_string(), flags));
        }
        if let Ok(mut fallback) = self.fallback.lock() {
            *fallback = Ok(flags);
        }
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_profile_script_then_fallback() {
        let service = MemoryProfileService::with_flags(ProfileCompletion {
            is_profile_completed: Some(true),
            profile_skipped: None,
        })
        .then(Err(AuthError::network("down")));

        assert!(service.fetch_completion("u").await.is_err());
        assert!(service.fetch_completion("u").await.unwrap().is_complete());
        assert_eq!(service.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_memory_profile_update_changes_later_lookups() {
        let service = MemoryProfileService::default();
        assert!(service.fetch_completion("u").await.unwrap_err().is_not_found());

        let flags = ProfileCompletion {
            is_profile_completed: None,
            profile_skipped: Some(true),
        };
        service.update_completion("u", flags).await.unwrap();

        assert!(service.fetch_completion("u").await.unwrap().is_complete());
        assert_eq!(service.updates(), vec![("u".to_string(), flags)]);
    }
}
