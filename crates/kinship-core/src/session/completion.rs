use std::time::Duration;

use kinship_types::User;

use crate::profile::ProfileService;

/// Resolves whether `user` has finished (or skipped) onboarding.
///
/// Metadata flags win without a remote call. Otherwise the profile row is
/// looked up up to `attempts` times with a fixed `delay` between tries, but
/// only transient failures are retried. A missing row is definitive. Every
/// unresolved path yields `false`.
pub async fn resolve_completion(
    profiles: &dyn ProfileService,
    user: &User,
    attempts: u32,
    delay: Duration,
) -> bool {
    if user.user_metadata.affirms_profile_completion() {
        tracing::debug!(user_id = %user.id, "Profile completion affirmed by metadata");
        return true;
    }

    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match profiles.fetch_completion(&user.id).await {
            Ok(flags) => {
                tracing::debug!(
                    user_id = %user.id,
                    attempt,
                    completed = ?flags.is_profile_completed,
                    skipped = ?flags.profile_skipped,
                    "Profile completion resolved"
                );
                return flags.is_complete();
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!(user_id = %user.id, "No profile row; treating as incomplete");
                return false;
            }
            Err(err) if !err.is_transient() => {
                tracing::warn!(
                    user_id = %user.id,
                    error = %err,
                    "Profile completion lookup rejected"
                );
                return false;
            }
            Err(err) => {
                tracing::warn!(
                    user_id = %user.id,
                    attempt,
                    attempts,
                    error = %err,
                    "Profile completion lookup failed"
                );
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    tracing::warn!(user_id = %user.id, "Profile completion unresolved; assuming incomplete");
    false
}

#[cfg(test)]
mod tests {
    use kinship_types::{ProfileCompletion, UserMetadata};

    use super::*;
    use crate::auth::AuthError;
    use crate::profile::MemoryProfileService;

    const DELAY: Duration = Duration::from_secs(1);

    fn completed() -> ProfileCompletion {
        ProfileCompletion {
            is_profile_completed: Some(true),
            profile_skipped: None,
        }
    }

    fn bare_user() -> User {
        User::new("u-1", Some("a@example.com".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_short_circuits() {
        let profiles = MemoryProfileService::with_flags(completed());
        let mut user = bare_user();
        user.user_metadata = UserMetadata {
            profile_completed: Some(true),
            ..UserMetadata::default()
        };

        assert!(resolve_completion(&profiles, &user, 3, DELAY).await);
        assert_eq!(profiles.fetch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let profiles = MemoryProfileService::with_flags(completed())
            .then(Err(AuthError::network("timeout")))
            .then(Err(AuthError::network("timeout")));

        let started = tokio::time::Instant::now();
        assert!(resolve_completion(&profiles, &bare_user(), 3, DELAY).await);
        assert_eq!(profiles.fetch_calls(), 3);
        assert_eq!(started.elapsed(), DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_closed() {
        let profiles = MemoryProfileService::new(Err(AuthError::network("unreachable")));

        assert!(!resolve_completion(&profiles, &bare_user(), 3, DELAY).await);
        assert_eq!(profiles.fetch_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_lookup_is_not_retried() {
        let profiles = MemoryProfileService::with_flags(completed())
            .then(Err(AuthError::from_response(401, "JWT expired")));

        let started = tokio::time::Instant::now();
        assert!(!resolve_completion(&profiles, &bare_user(), 3, DELAY).await);
        assert_eq!(profiles.fetch_calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_definitive() {
        let profiles = MemoryProfileService::default();

        assert!(!resolve_completion(&profiles, &bare_user(), 3, DELAY).await);
        assert_eq!(profiles.fetch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_with_no_flags_is_incomplete() {
        let profiles = MemoryProfileService::with_flags(ProfileCompletion::default());
        assert!(!resolve_completion(&profiles, &bare_user(), 3, DELAY).await);
    }
}
