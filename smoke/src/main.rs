mod bootstrap;
mod smoke;

use anyhow::Context;
use bootstrap::{ambient_env, bootstrap, BootstrapConfig, BootstrapError, CREDENTIALS_VAR};
use clap::Parser;
use datastore::{open_store, StoreBackend};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Save one reading to the device datastore and read it back.
#[derive(Parser, Debug)]
#[command(name = "smoke", version, about)]
struct Args {
    /// Project root; defaults to the current directory
    #[arg(long, env = "PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Env file loaded when DATABASE_URL is unset [default: <root>/config/credentials.env]
    #[arg(long)]
    credentials_path: Option<PathBuf>,

    /// Runtime directory created by one-time setup [default: <root>/runtime]
    #[arg(long)]
    runtime_env_path: Option<PathBuf>,

    /// Store to run against (memory, postgres) [default: STORE_BACKEND from
    /// the session, else postgres]
    #[arg(long)]
    backend: Option<StoreBackend>,

    #[arg(long, default_value = smoke::DEFAULT_DEVICE_ID)]
    device_id: String,

    #[arg(long, default_value = smoke::DEFAULT_METRIC)]
    metric: String,
}

impl Args {
    fn bootstrap_config(&self) -> anyhow::Result<BootstrapConfig> {
        let root = match &self.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("cannot resolve current directory")?,
        };
        let mut config = BootstrapConfig::for_project(root);
        if let Some(path) = &self.credentials_path {
            config.credentials_path = path.clone();
        }
        if let Some(path) = &self.runtime_env_path {
            config.runtime_env_path = path.clone();
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<BootstrapError>() {
                Some(setup) => eprintln!("{}", setup),
                None => {
                    error!("Smoke test failed: {:#}", e);
                    eprintln!("Error: {:#}", e);
                }
            }
            ExitCode::from(failure_code(&e))
        }
    }
}

/// Process exit status for a failed run.
fn failure_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<BootstrapError>() {
        Some(setup) => setup.exit_code(),
        None => 1,
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.bootstrap_config()?;
    let session = bootstrap(&config, ambient_env())?;
    info!(
        "Session ready: root={} runtime={} module_path={:?} credentials_loaded={}",
        session.project_root.display(),
        session.runtime_env_path.display(),
        session.module_path(),
        session.credentials_loaded
    );

    let backend = args
        .backend
        .or_else(|| session.var("STORE_BACKEND").and_then(|v| v.parse().ok()))
        .unwrap_or(StoreBackend::Postgres);

    let database_url = match backend {
        StoreBackend::Memory => String::new(),
        StoreBackend::Postgres => session
            .var(CREDENTIALS_VAR)
            .with_context(|| format!("{} is not set after loading credentials", CREDENTIALS_VAR))?
            .to_string(),
    };

    let store = open_store(backend, &database_url).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let report = smoke::run_smoke(store.as_ref(), &args.device_id, &args.metric, &mut out).await?;
    info!(
        "Smoke test complete: saved={} rows={} limited_rows={} latest={:?}",
        report.saved, report.all_rows, report.limited_rows, report.latest
    );

    Ok(())
}
