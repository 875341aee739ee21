//! Auth Service seam and its implementations.
//!
//! - `error`: error taxonomy shared by auth and profile calls
//! - `rest`: GoTrue-compatible HTTP client
//! - `memory`: scripted in-process double

use std::future::Future;
use std::pin::Pin;

use kinship_types::{
    AuthChangeEvent, OAuthRedirect, OAuthRequest, Session, SignOutScope, User, UserMetadata,
};
use tokio::sync::broadcast;

pub mod error;
pub mod memory;
pub mod rest;

pub use error::{AuthError, AuthErrorKind, AuthResult};
pub use memory::MemoryAuthService;
pub use rest::RestAuthService;

/// Boxed future returned by the async service seams.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = AuthResult<T>> + Send + 'a>>;

/// Capacity of the session-change feed. Slow listeners lose the oldest events,
/// which is harmless because every handler re-reads the session it is given.
pub const AUTH_EVENT_CAPACITY: usize = 32;

/// The remote authentication backend.
pub trait AuthService: Send + Sync {
    /// Current session, if any. May refresh a stale persisted credential.
    fn get_session(&self) -> ServiceFuture<'_, Option<Session>>;

    /// Registers a new identity. Returns the created user.
    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
        metadata: UserMetadata,
    ) -> ServiceFuture<'a, User>;

    fn sign_in_with_password<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> ServiceFuture<'a, Session>;

    fn sign_out(&self, scope: SignOutScope) -> ServiceFuture<'_, ()>;

    /// Exchanges the refresh credential for a new session.
    fn refresh_session(&self) -> ServiceFuture<'_, Session>;

    /// Starts a provider redirect flow; completion arrives on the feed.
    fn sign_in_with_oauth(&self, request: OAuthRequest) -> ServiceFuture<'_, OAuthRedirect>;

    fn get_user(&self) -> ServiceFuture<'_, Option<User>>;

    fn reset_password_for_email<'a>(
        &'a self,
        email: &'a str,
        redirect_to: &'a str,
    ) -> ServiceFuture<'a, ()>;

    fn update_password<'a>(&'a self, new_password: &'a str) -> ServiceFuture<'a, User>;

    /// Subscribes to the session-change feed.
    fn subscribe(&self) -> broadcast::Receiver<AuthChangeEvent>;
}
