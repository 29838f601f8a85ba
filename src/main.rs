use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use gym_permissions::authz::{self, Identity, PermissionController, RoleId};
use gym_permissions::config::PermissionsConfig;
use gym_permissions::fetcher::{HttpPermissionFetcher, PermissionFetcher};
use gym_permissions::{create_app, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about = "gym permission cache tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve role permissions from a JSON seed file (development server-of-record)
    Serve {
        #[arg(long)]
        matrix: PathBuf,
    },
    /// Fetch a role's permissions once and print the decision
    Check {
        #[arg(long)]
        role: u64,
        #[arg(long)]
        module: String,
        #[arg(long)]
        privilege: Option<String>,
    },
    /// Load a role into a store and print its debug dump
    Dump {
        #[arg(long)]
        role: u64,
    },
    /// Keep a controller active for a role and print every snapshot change
    Watch {
        #[arg(long)]
        role: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = PermissionsConfig::from_env()?;

    match cli.command {
        Commands::Serve { matrix } => serve(&config, &matrix).await?,
        Commands::Check {
            role,
            module,
            privilege,
        } => check(&config, RoleId(role), &module, privilege.as_deref()).await?,
        Commands::Dump { role } => dump(&config, RoleId(role)).await?,
        Commands::Watch { role } => watch(&config, RoleId(role)).await?,
    }

    Ok(())
}

async fn serve(config: &PermissionsConfig, matrix: &std::path::Path) -> anyhow::Result<()> {
    let state = AppState::load(matrix)?;
    let app = create_app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn check(
    config: &PermissionsConfig,
    role_id: RoleId,
    module: &str,
    privilege: Option<&str>,
) -> anyhow::Result<()> {
    let fetcher = HttpPermissionFetcher::from_config(config);
    let matrix = fetcher.fetch_permissions(role_id).await?;

    let allowed = match privilege {
        Some(privilege) => matrix.has_privilege(module, privilege),
        None => matrix.has_module_access(module),
    };
    let target = match privilege {
        Some(privilege) => format!("{module}:{privilege}"),
        None => module.to_string(),
    };
    println!("role {role_id} {target}: {}", if allowed { "granted" } else { "denied" });
    Ok(())
}

async fn dump(config: &PermissionsConfig, role_id: RoleId) -> anyhow::Result<()> {
    let store = authz::global::install(
        Arc::new(HttpPermissionFetcher::from_config(config)),
        config.store_config(),
    )?;
    if let Err(err) = store.initialize(role_id).await {
        tracing::warn!(error = %err, "initial permission load failed");
    }

    println!("{}", serde_json::to_string_pretty(&store.debug_permissions())?);
    Ok(())
}

async fn watch(config: &PermissionsConfig, role_id: RoleId) -> anyhow::Result<()> {
    let store = authz::global::install(
        Arc::new(HttpPermissionFetcher::from_config(config)),
        config.store_config(),
    )?;
    let controller = PermissionController::new(store.clone(), config.controller_config());
    let mut snapshots = controller.subscribe();

    if let Err(err) = controller.activate(Identity::with_role(role_id)).await {
        tracing::warn!(error = %err, "initial permission load failed");
    }
    println!("{}", serde_json::to_string(&*snapshots.borrow_and_update())?);

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", serde_json::to_string(&*snapshots.borrow_and_update())?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.deactivate();
    authz::global::reset_session();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
    }
}

fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(crate_env);
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
