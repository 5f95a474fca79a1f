use std::path::{Path, PathBuf};

use crate::connection::Credential;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("{} cannot be executed by the current user", .0.display())]
    NotExecutable(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Startup configuration, read from the environment and validated before the
/// agent connects. Validation failures are fatal.
#[derive(Debug)]
pub struct AgentConfig {
    pub control_url: String,
    pub credential: Credential,
    pub executable: PathBuf,
    pub work_dir: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_url = env_var("DOOMSRV_CONTROL_URL").ok_or(ConfigError::Missing("DOOMSRV_CONTROL_URL"))?;
        let control_url = parse_ws_url(&raw_url);
        let key = env_var("DOOMSRV_AGENT_KEY").ok_or(ConfigError::Missing("DOOMSRV_AGENT_KEY"))?;
        let executable = env_var("DOOMSRV_SERVER_EXECUTABLE")
            .ok_or(ConfigError::Missing("DOOMSRV_SERVER_EXECUTABLE"))?;
        let work_dir = env_var("DOOMSRV_WORKDIR").unwrap_or_else(|| ".".to_string());

        let executable = std::path::absolute(executable)?;
        let work_dir = std::path::absolute(work_dir)?;
        validate_paths(&executable, &work_dir)?;

        Ok(Self {
            control_url,
            credential: Credential::new(key),
            executable,
            work_dir,
        })
    }
}

fn validate_paths(executable: &Path, work_dir: &Path) -> Result<(), ConfigError> {
    if !work_dir.is_dir() {
        return Err(ConfigError::NotADirectory(work_dir.to_path_buf()));
    }
    if !is_executable_file(executable) {
        return Err(ConfigError::NotExecutable(executable.to_path_buf()));
    }
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Support http(s) URLs by converting to ws(s).
fn parse_ws_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return format!("wss://{rest}");
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return format!("ws://{rest}");
    }
    trimmed.to_string()
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        return meta.permissions().mode() & 0o111 != 0;
    }

    #[cfg(not(unix))]
    true
}
