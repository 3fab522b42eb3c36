use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `EngineProxy` (async) for the daemon interface.
#[zbus::proxy(
    interface = "io.warden.Engine1",
    default_service = "io.warden.Engine1",
    default_path = "/io/warden/Engine1"
)]
trait Engine {
    async fn check_consent(&self, store_id: &str, subject_id: &str, actor_id: &str) -> zbus::Result<String>;
    async fn record_consent(
        &self,
        store_id: &str,
        subject_id: &str,
        legal_basis: &str,
        actor_id: &str,
    ) -> zbus::Result<String>;
    async fn withdraw_consent(&self, store_id: &str, subject_id: &str, actor_id: &str) -> zbus::Result<String>;
    async fn enroll(
        &self,
        image: &[u8],
        store_id: &str,
        subject_id: &str,
        legal_basis: &str,
        actor_id: &str,
    ) -> zbus::Result<String>;
    async fn identify(
        &self,
        image: &[u8],
        store_id: &str,
        subject_id: &str,
        threshold: f64,
        actor_id: &str,
    ) -> zbus::Result<String>;
    async fn erase_subject(&self, store_id: &str, subject_id: &str, actor_id: &str) -> zbus::Result<String>;
    async fn export_subject_report(&self, store_id: &str, subject_id: &str, actor_id: &str) -> zbus::Result<String>;
    async fn add_to_watchlist(
        &self,
        image: &[u8],
        store_id: &str,
        display_name: &str,
        category: &str,
        risk_level: &str,
        subject_id: &str,
        legal_authorization: &str,
        actor_id: &str,
    ) -> zbus::Result<String>;
    async fn deactivate_watchlist_entry(&self, entry_id: &str, actor_id: &str) -> zbus::Result<bool>;
    async fn watchlist_stats(&self, store_id: &str) -> zbus::Result<String>;
    async fn sweep_now(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "warden", about = "Warden biometric recognition CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    /// Operator identity recorded in the compliance ledger
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

/// Store and optional subject a request is about.
#[derive(Args)]
struct Target {
    /// Store (site) identifier
    #[arg(long)]
    store: String,
    /// Subject identifier; omit for an anonymous visitor
    #[arg(long)]
    subject: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or change consent records
    Consent {
        #[command(subcommand)]
        action: ConsentAction,
    },
    /// Enroll a face template from an image file
    Enroll {
        image: PathBuf,
        #[command(flatten)]
        target: Target,
        /// Legal basis the operator asserts (consent, legitimate_interest, legal_obligation)
        #[arg(long)]
        basis: Option<String>,
    },
    /// Search the store's watchlist with a capture
    Identify {
        image: PathBuf,
        #[command(flatten)]
        target: Target,
        /// Match threshold in [0, 1]; defaults to the daemon's setting
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Erase every template held for a subject (right to erasure)
    Erase {
        #[arg(long)]
        store: String,
        #[arg(long)]
        subject: String,
    },
    /// Export everything held about a subject (right of access)
    Export {
        #[arg(long)]
        store: String,
        #[arg(long)]
        subject: String,
    },
    /// Manage watchlist entries
    Watchlist {
        #[command(subcommand)]
        action: WatchlistAction,
    },
    /// Run a retention sweep now
    Sweep,
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ConsentAction {
    /// Show the current consent decision
    Check(Target),
    /// Record consent for a subject
    Grant {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "consent")]
        basis: String,
    },
    /// Withdraw consent; the sweeper removes the subject's templates
    Withdraw(Target),
}

#[derive(Subcommand)]
enum WatchlistAction {
    /// Add a watchlist entry from an image file
    Add {
        image: PathBuf,
        #[command(flatten)]
        target: Target,
        /// Name shown to operators on a match
        #[arg(long)]
        name: String,
        /// security_threat, banned_individual or person_of_interest
        #[arg(long)]
        category: String,
        /// low, medium, high or critical
        #[arg(long, default_value = "medium")]
        risk: String,
        /// Reference to the legal authorization (warrant, ban notice, ...)
        #[arg(long)]
        authorization: Option<String>,
    },
    /// Deactivate a watchlist entry
    Remove {
        /// Entry ID to deactivate
        id: String,
    },
    /// Show watchlist counts for a store
    Stats {
        #[arg(long)]
        store: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = EngineProxy::new(&conn)
        .await
        .context("wardend is not reachable")?;
    let actor = cli.actor.as_str();

    let output = match cli.command {
        Commands::Consent { action } => match action {
            ConsentAction::Check(t) => {
                proxy.check_consent(&t.store, subject(&t), actor).await?
            }
            ConsentAction::Grant { target, basis } => {
                proxy
                    .record_consent(&target.store, subject(&target), &basis, actor)
                    .await?
            }
            ConsentAction::Withdraw(t) => {
                proxy.withdraw_consent(&t.store, subject(&t), actor).await?
            }
        },
        Commands::Enroll { image, target, basis } => {
            let bytes = read_image(&image)?;
            proxy
                .enroll(
                    &bytes,
                    &target.store,
                    subject(&target),
                    basis.as_deref().unwrap_or(""),
                    actor,
                )
                .await?
        }
        Commands::Identify {
            image,
            target,
            threshold,
        } => {
            let bytes = read_image(&image)?;
            proxy
                .identify(
                    &bytes,
                    &target.store,
                    subject(&target),
                    threshold.unwrap_or(-1.0),
                    actor,
                )
                .await?
        }
        Commands::Erase { store, subject } => proxy.erase_subject(&store, &subject, actor).await?,
        Commands::Export { store, subject } => {
            proxy.export_subject_report(&store, &subject, actor).await?
        }
        Commands::Watchlist { action } => match action {
            WatchlistAction::Add {
                image,
                target,
                name,
                category,
                risk,
                authorization,
            } => {
                let bytes = read_image(&image)?;
                proxy
                    .add_to_watchlist(
                        &bytes,
                        &target.store,
                        &name,
                        &category,
                        &risk,
                        subject(&target),
                        authorization.as_deref().unwrap_or(""),
                        actor,
                    )
                    .await?
            }
            WatchlistAction::Remove { id } => {
                let changed = proxy.deactivate_watchlist_entry(&id, actor).await?;
                serde_json::json!({ "entry_id": id, "deactivated": changed }).to_string()
            }
            WatchlistAction::Stats { store } => proxy.watchlist_stats(&store).await?,
        },
        Commands::Sweep => proxy.sweep_now().await?,
        Commands::Status => proxy.status().await?,
    };

    println!("{}", pretty(&output));
    Ok(())
}

fn subject(target: &Target) -> &str {
    target.subject.as_deref().unwrap_or("")
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

/// Re-indent a JSON reply; anything else is printed as received.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watchlist_add() {
        let cli = Cli::try_parse_from([
            "warden",
            "watchlist",
            "add",
            "face.png",
            "--store",
            "store-1",
            "--name",
            "J. Doe",
            "--category",
            "banned_individual",
            "--authorization",
            "ban notice 88",
        ])
        .unwrap();
        match cli.command {
            Commands::Watchlist {
                action: WatchlistAction::Add { risk, authorization, target, .. },
            } => {
                assert_eq!(risk, "medium");
                assert_eq!(authorization.as_deref(), Some("ban notice 88"));
                assert_eq!(subject(&target), "");
            }
            _ => panic!("parsed into the wrong command"),
        }
    }

    #[test]
    fn test_pretty_passes_through_non_json() {
        assert_eq!(pretty("true"), "true");
        assert_eq!(pretty("not json"), "not json");
        assert_eq!(pretty(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
    }
}
