//! CLI entry and dispatch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use kinship_core::config::{self, paths};
use kinship_core::logging;

mod commands;

#[derive(Parser)]
#[command(name = "kinship")]
#[command(version)]
#[command(about = "Kinship session and account tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config, local storage and logs
    #[arg(long, global = true, env = "KINSHIP_HOME", value_name = "DIR")]
    home: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    #[command(flatten)]
    Session(SessionCommands),

    /// Purge every local auth artifact, even when the session is broken
    Recover,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Commands that talk to the backend through a session controller.
#[derive(clap::Subcommand)]
enum SessionCommands {
    /// Show the current session
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        /// Password (prompted on stdin when omitted)
        #[arg(long, env = "KINSHIP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Create an account
    Signup {
        #[arg(long)]
        email: String,
        /// Display name stored with the account
        #[arg(long)]
        name: String,
        /// Password (prompted on stdin when omitted)
        #[arg(long, env = "KINSHIP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Sign out on every device and clear local credentials
    Logout,

    /// Refresh the session if it is close to expiry
    Refresh {
        /// Refresh even if the session is still fresh
        #[arg(long)]
        force: bool,
    },

    /// Start Google sign-in in the browser
    Google {
        /// Where the provider should send the browser back to
        #[arg(long, value_name = "URL")]
        redirect_to: Option<String>,
    },

    /// Finish a provider or recovery sign-in from the redirect URL
    Callback {
        /// Full URL the browser landed on
        #[arg(value_name = "URL")]
        url: String,
    },

    /// Email a password-recovery link
    ResetPassword {
        #[arg(long)]
        email: String,
    },

    /// Change the signed-in user's password
    Password {
        /// New password (prompted on stdin when omitted)
        #[arg(long, env = "KINSHIP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Mark onboarding as finished for the signed-in user
    CompleteProfile {
        /// Record that onboarding was skipped instead
        #[arg(long)]
        skip: bool,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(paths::kinship_home);

    let config = config::Config::load_from(&paths::config_path_in(&home)).context("load config")?;
    let _log_guard = logging::init(&config.logging, &paths::logs_dir_in(&home))?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli.command, &home, &config).await })
}

async fn dispatch(command: Commands, home: &Path, config: &config::Config) -> Result<()> {
    match command {
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path(home);
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(home),
        },
        Commands::Recover => commands::auth::recover(home, config).await,
        Commands::Session(command) => {
            let client = commands::auth::Client::open(home, config).await?;
            let result = run_session_command(&client, command).await;
            client.close();
            result
        }
    }
}

async fn run_session_command(
    client: &commands::auth::Client,
    command: SessionCommands,
) -> Result<()> {
    use commands::auth;

    match command {
        SessionCommands::Status { json } => auth::status(client, json),
        SessionCommands::Login { email, password } => auth::login(client, &email, password).await,
        SessionCommands::Signup {
            email,
            name,
            password,
        } => auth::signup(client, &email, &name, password).await,
        SessionCommands::Logout => auth::logout(client).await,
        SessionCommands::Refresh { force } => auth::refresh(client, force).await,
        SessionCommands::Google { redirect_to } => {
            auth::google(client, redirect_to.as_deref()).await
        }
        SessionCommands::Callback { url } => auth::callback(client, &url).await,
        SessionCommands::ResetPassword { email } => auth::reset_password(client, &email).await,
        SessionCommands::Password { password } => auth::update_password(client, password).await,
        SessionCommands::CompleteProfile { skip } => auth::complete_profile(client, skip).await,
    }
}
