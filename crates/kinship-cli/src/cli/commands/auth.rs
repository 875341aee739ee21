//! Auth command handlers.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kinship_core::auth::MemoryAuthService;
use kinship_core::config::{Config, SessionConfig, paths};
use kinship_core::context::{AuthContext, RemoteServices};
use kinship_core::navigator::{LogNavigator, Navigator};
use kinship_core::profile::MemoryProfileService;
use kinship_core::routes::{self, CallbackOutcome, Landing};
use kinship_core::session::{RefreshOutcome, SessionController};
use kinship_core::store::{CredentialStore, FileCredentialStore, keys};
use kinship_types::User;
use serde_json::json;

/// How long to wait for the session-change feed to deliver a sign-in.
const FEED_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper bound on the backend sign-out during `recover`.
const RECOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// A session controller wired to the hosted backend and the local store.
pub struct Client {
    controller: SessionController,
    remote: RemoteServices,
    navigator: Arc<LogNavigator>,
    config: SessionConfig,
}

impl Client {
    pub async fn open(home: &Path, config: &Config) -> Result<Self> {
        let store: Arc<dyn CredentialStore> =
            Arc::new(FileCredentialStore::new(paths::storage_path_in(home)));
        let remote = RemoteServices::connect(config, Arc::clone(&store))?;
        let navigator = Arc::new(LogNavigator::new());
        let session_config = config.session_config();

        let ctx = remote.context(
            store,
            Arc::clone(&navigator) as Arc<dyn Navigator>,
            session_config.clone(),
        );
        let controller = SessionController::new(ctx);
        controller.initialize().await;

        Ok(Self {
            controller,
            remote,
            navigator,
            config: session_config,
        })
    }

    pub fn close(&self) {
        self.controller.shutdown();
    }

    /// Waits until the feed has delivered a signed-in user and the profile
    /// check settled.
    async fn wait_for_user(&self) -> Result<User> {
        let mut rx = self.controller.subscribe_state();
        let state = tokio::time::timeout(
            FEED_TIMEOUT,
            rx.wait_for(|s| s.user.is_some() && !s.loading),
        )
        .await
        .context("timed out waiting for the session")?
        .context("session controller stopped")?;
        state.user.clone().context("no user in session")
    }

    fn print_redirect(&self) {
        if let Some(route) = self.navigator.last_route() {
            println!("  Redirect: {route}");
        }
    }
}

fn display_email(user: &User) -> &str {
    user.email.as_deref().unwrap_or("<no email>")
}

/// Uses the given password, or reads one line from stdin.
fn resolve_password(password: Option<String>) -> Result<String> {
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        return Ok(password);
    }

    print!("Password: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    let password = input.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

pub fn status(client: &Client, json: bool) -> Result<()> {
    let state = client.controller.state();
    let expires_at = client.controller.marker(keys::SESSION_EXPIRES_AT);
    let landing = routes::settle_route(&client.config.home_route, &state, &client.config);
    let next_route = match landing {
        Landing::Route(route) => route,
        Landing::Loading => client.config.landing_route.clone(),
        Landing::Looping => anyhow::bail!(
            "Authentication redirect loop detected; run `kinship recover` to reset local auth state"
        ),
    };

    if json {
        let body = json!({
            "authenticated": state.is_authenticated(),
            "user_id": state.user_id(),
            "email": state.user.as_ref().and_then(|u| u.email.as_deref()),
            "profile_completed": state.profile_completed,
            "phase": state.phase.to_string(),
            "session_expires_at": expires_at,
            "next_route": next_route,
            "error": state.error.as_ref().map(ToString::to_string),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    match &state.user {
        Some(user) => {
            println!("Signed in as {} ({})", display_email(user), user.id);
            let profile = if state.profile_completed {
                "complete"
            } else {
                "incomplete"
            };
            println!("  Profile: {profile}");
            if let Some(expires_at) = expires_at {
                println!("  Session expires: {expires_at}");
            }
            println!("  Next route: {next_route}");
        }
        None => println!("Not signed in."),
    }
    if let Some(err) = &state.error {
        println!("  Last error: {err}");
    }
    Ok(())
}

pub async fn login(client: &Client, email: &str, password: Option<String>) -> Result<()> {
    let password = resolve_password(password)?;
    client
        .controller
        .sign_in(email, &password)
        .await
        .context("sign in")?;

    let user = client.wait_for_user().await?;
    println!("✓ Signed in as {}", display_email(&user));
    if !client.controller.profile_completed() {
        println!(
            "  Profile incomplete: finish onboarding with `kinship complete-profile` (route {}).",
            client.config.complete_profile_route
        );
    }
    Ok(())
}

pub async fn signup(
    client: &Client,
    email: &str,
    name: &str,
    password: Option<String>,
) -> Result<()> {
    let password = resolve_password(password)?;
    let user = client
        .controller
        .sign_up(email, &password, name)
        .await
        .context("sign up")?;

    println!("✓ Account created for {} ({})", display_email(&user), user.id);
    println!("  If email confirmation is enabled, confirm your address before logging in.");
    Ok(())
}

pub async fn logout(client: &Client) -> Result<()> {
    client.controller.sign_out().await;
    println!("✓ Signed out");
    client.print_redirect();
    Ok(())
}

pub async fn refresh(client: &Client, force: bool) -> Result<()> {
    let outcome = client
        .controller
        .refresh_session_if_needed(force)
        .await
        .context("refresh session")?;

    let remaining = outcome
        .session()
        .seconds_until_expiry(chrono::Utc::now().timestamp());
    match outcome {
        RefreshOutcome::Refreshed(_) => println!("✓ Session refreshed (expires in {remaining}s)"),
        RefreshOutcome::Current(_) => {
            println!("Session valid for another {remaining}s; not refreshed.");
        }
    }
    Ok(())
}

pub async fn google(client: &Client, redirect_to: Option<&str>) -> Result<()> {
    let redirect = client
        .controller
        .sign_in_with_google(redirect_to)
        .await
        .context("start Google sign-in")?;

    println!("To sign in with {}:", redirect.provider);
    println!();
    println!("  1. A browser window will open (or visit the URL below)");
    println!("  2. Sign in and grant access");
    println!("  3. Run `kinship callback <URL>` with the address the browser lands on");
    println!();
    println!("Authorization URL:");
    println!("  {}", redirect.url);

    // Best effort, skipped in tests
    if std::env::var("KINSHIP_NO_BROWSER").is_err() {
        let _ = open::that(&redirect.url);
    }
    Ok(())
}

pub async fn callback(client: &Client, url: &str) -> Result<()> {
    let tokens = match routes::parse_callback(url) {
        CallbackOutcome::Failed(message) => anyhow::bail!("Sign-in failed: {message}"),
        CallbackOutcome::Empty => {
            if let Some(user) = client.controller.user() {
                println!("Already signed in as {}", display_email(&user));
                return Ok(());
            }
            anyhow::bail!("No tokens found in callback URL");
        }
        CallbackOutcome::Tokens(tokens) => tokens,
    };

    client
        .remote
        .auth
        .set_session_from_callback(&tokens)
        .await
        .context("adopt callback session")?;
    let user = client.wait_for_user().await?;

    if tokens.is_recovery() {
        println!("✓ Recovery session active for {}", display_email(&user));
        println!("  Set a new password with `kinship password`.");
        return Ok(());
    }

    println!("✓ Signed in as {}", display_email(&user));
    if client.controller.profile_completed() {
        client.controller.redirect_to_home();
    } else {
        client
            .navigator
            .redirect(&client.config.complete_profile_route);
    }
    client.print_redirect();
    Ok(())
}

pub async fn reset_password(client: &Client, email: &str) -> Result<()> {
    client
        .controller
        .reset_password(email)
        .await
        .context("send recovery email")?;
    println!("✓ Recovery email sent to {email}");
    Ok(())
}

pub async fn update_password(client: &Client, password: Option<String>) -> Result<()> {
    if !client.controller.is_authenticated() {
        anyhow::bail!(
            "Not signed in. Run `kinship login`, or `kinship callback` with a recovery link."
        );
    }
    let password = resolve_password(password)?;
    client
        .controller
        .update_password(&password)
        .await
        .context("update password")?;
    println!("✓ Password updated");
    Ok(())
}

pub async fn complete_profile(client: &Client, skip: bool) -> Result<()> {
    client
        .controller
        .mark_profile_completed(skip)
        .await
        .context("update profile")?;
    let verb = if skip { "skipped" } else { "completed" };
    println!("✓ Onboarding {verb}");
    client.controller.redirect_to_home();
    client.print_redirect();
    Ok(())
}

/// Emergency sign-out. Works without a configured backend, in which case
/// only local state is purged.
pub async fn recover(home: &Path, config: &Config) -> Result<()> {
    let store: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(paths::storage_path_in(home)));
    let navigator = Arc::new(LogNavigator::new());
    let nav: Arc<dyn Navigator> = Arc::clone(&navigator) as Arc<dyn Navigator>;

    let ctx = match RemoteServices::connect(config, Arc::clone(&store)) {
        Ok(remote) => remote.context(store, nav, config.session_config()),
        Err(err) => {
            tracing::debug!(error = %format!("{err:#}"), "Backend unavailable; purging offline");
            AuthContext::new(
                Arc::new(MemoryAuthService::new()),
                Arc::new(MemoryProfileService::default()),
                store,
                nav,
                config.session_config(),
            )
        }
    };

    let controller = SessionController::new(ctx);
    if tokio::time::timeout(RECOVER_TIMEOUT, controller.emergency_sign_out())
        .await
        .is_err()
    {
        tracing::warn!("Backend sign-out timed out; local state already purged");
    }
    println!("✓ Local auth state purged");
    if let Some(route) = navigator.last_route() {
        println!("  Redirect: {route}");
    }
    Ok(())
}
