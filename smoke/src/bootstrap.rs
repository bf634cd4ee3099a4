//! Local environment bootstrap.
//!
//! Produces a [`Session`] from an explicit [`BootstrapConfig`] and a
//! snapshot of the ambient environment. The process environment itself is
//! never modified.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Presence of this variable means credentials are already configured.
pub const CREDENTIALS_VAR: &str = "DATABASE_URL";
/// Module search path handed to the datastore client.
pub const MODULE_PATH_VAR: &str = "DATASTORE_PATH";
pub const RUNTIME_ENV_VAR: &str = "DATASTORE_RUNTIME_ENV";
pub const SETUP_INSTRUCTION: &str =
    "you have not run ./scripts/local_development_one_time_setup.sh";

const ACTIVATE_FILE: &str = "activate.env";

pub type EnvSnapshot = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub credentials_path: PathBuf,
    pub project_root: PathBuf,
    /// The prepared runtime directory. Its presence is the setup marker.
    pub runtime_env_path: PathBuf,
}

impl BootstrapConfig {
    /// Default layout under a project root: `config/credentials.env` and
    /// `runtime/`.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            credentials_path: project_root.join("config").join("credentials.env"),
            runtime_env_path: project_root.join("runtime"),
            project_root,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("{} (missing {})", SETUP_INSTRUCTION, .0.display())]
    SetupMissing(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BootstrapError {
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// The environment a smoke run executes in.
#[derive(Debug, Clone)]
pub struct Session {
    pub env: EnvSnapshot,
    pub project_root: PathBuf,
    pub runtime_env_path: PathBuf,
    pub credentials_loaded: bool,
}

impl Session {
    pub fn var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn module_path(&self) -> Option<&str> {
        self.var(MODULE_PATH_VAR)
    }
}

/// Snapshot of the current process environment.
pub fn ambient_env() -> EnvSnapshot {
    std::env::vars().collect()
}

pub fn bootstrap(
    config: &BootstrapConfig,
    ambient: EnvSnapshot,
) -> Result<Session, BootstrapError> {
    let project_root =
        fs::canonicalize(&config.project_root).unwrap_or_else(|_| config.project_root.clone());
    let mut env = ambient;

    let mut credentials_loaded = false;
    if !env.contains_key(CREDENTIALS_VAR) {
        info!(
            "{} not set, loading {}",
            CREDENTIALS_VAR,
            config.credentials_path.display()
        );
        // Not verified: a missing credentials file only surfaces later.
        match fs::read_to_string(&config.credentials_path) {
            Ok(contents) => {
                env.extend(parse_env_file(&contents, &config.credentials_path));
                credentials_loaded = true;
            }
            Err(e) => warn!(
                "Could not read credentials {}: {}",
                config.credentials_path.display(),
                e
            ),
        }
    }

    if !config.runtime_env_path.is_dir() {
        return Err(BootstrapError::SetupMissing(config.runtime_env_path.clone()));
    }

    activate(&config.runtime_env_path, &mut env)?;
    env.insert(
        MODULE_PATH_VAR.to_string(),
        project_root.display().to_string(),
    );

    Ok(Session {
        env,
        project_root,
        runtime_env_path: config.runtime_env_path.clone(),
        credentials_loaded,
    })
}

/// Load `activate.env` from the runtime directory, if there is one.
fn activate(runtime_env_path: &Path, env: &mut EnvSnapshot) -> Result<(), BootstrapError> {
    let activate_file = runtime_env_path.join(ACTIVATE_FILE);
    match fs::read_to_string(&activate_file) {
        Ok(contents) => {
            env.extend(parse_env_file(&contents, &activate_file));
            debug!("Activated {}", activate_file.display());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(BootstrapError::Io {
                path: activate_file,
                source,
            })
        }
    }
    env.insert(
        RUNTIME_ENV_VAR.to_string(),
        runtime_env_path.display().to_string(),
    );
    Ok(())
}

/// Parse `KEY=VALUE` and `export KEY=VALUE` lines. Blank lines and `#`
/// comments are skipped, as are malformed lines (with a warning).
pub fn parse_env_file(contents: &str, origin: &Path) -> Vec<(String, String)> {
    let mut vars = Vec::new();

    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            warn!("{}:{}: ignoring line without '='", origin.display(), lineno + 1);
            continue;
        };
        let key = key.trim();
        if !is_valid_key(key) {
            warn!("{}:{}: ignoring invalid name {:?}", origin.display(), lineno + 1, key);
            continue;
        }

        vars.push((key.to_string(), unquote(value.trim()).to_string()));
    }

    vars
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
