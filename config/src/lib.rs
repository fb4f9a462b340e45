//! `~/.tether/config.toml`: restart tuning and per-service launch settings.
//!
//! ```toml
//! [supervisor]
//! max_restarts = 5
//! cooldown_ms = 250
//!
//! [services.rust]
//! program = "rust-analyzer"
//! override_env = "RUST_ANALYZER_PATH"
//! search_path = ["~/.cargo/bin"]
//! execution_target = "host"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tether_types::{
    DescriptorError, ExecutionTarget, LaunchDescriptor, ProgramSpec, RestartPolicy, StderrPolicy,
};
use thiserror::Error;

#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    pub supervisor: Option<SupervisorConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Overrides for the default [`RestartPolicy`]. Unset fields keep the default.
#[derive(Debug, Default, Deserialize)]
pub struct SupervisorConfig {
    pub auto_restart: Option<bool>,
    pub max_restarts: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub stable_after_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    /// Let every service write to the terminal's stderr.
    #[serde(default)]
    pub inherit_stderr: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub override_env: Option<String>,
    pub override_path: Option<PathBuf>,
    #[serde(default)]
    pub search_path: Vec<String>,
    #[serde(default)]
    pub execution_target: ExecutionTarget,
    #[serde(default)]
    pub inherit_stderr: bool,
    /// Relative to the project root.
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TetherConfig {
    /// Load from [`path`](Self::path). A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), services = config.services.len(), "loaded config");
                Ok(config)
            }
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    /// Sorted names of the configured services.
    #[must_use]
    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        let mut policy = RestartPolicy::default();
        let Some(supervisor) = &self.supervisor else {
            return policy;
        };
        if let Some(auto_restart) = supervisor.auto_restart {
            policy.auto_restart = auto_restart;
        }
        if let Some(max_restarts) = supervisor.max_restarts {
            policy.max_restarts = max_restarts;
        }
        if let Some(ms) = supervisor.cooldown_ms {
            policy.cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = supervisor.stable_after_ms {
            policy.stable_after = Duration::from_millis(ms);
        }
        if let Some(ms) = supervisor.stop_grace_ms {
            policy.stop_grace = Duration::from_millis(ms);
        }
        policy
    }

    #[must_use]
    pub fn inherit_stderr(&self) -> bool {
        self.supervisor.as_ref().is_some_and(|s| s.inherit_stderr)
    }
}

impl ServiceConfig {
    /// Build the launch descriptor for a project rooted at `project_root`.
    pub fn to_descriptor(
        &self,
        project_root: &Path,
        global_inherit_stderr: bool,
    ) -> Result<LaunchDescriptor, DescriptorError> {
        let mut program = ProgramSpec::new(self.program.as_str());
        if let Some(var) = &self.override_env {
            program = program.with_override_env(var.as_str());
        }
        if let Some(path) = &self.override_path {
            program = program.with_override_path(expand_home(&path.to_string_lossy()));
        }
        for dir in &self.search_path {
            program = program.with_search_dir(expand_home(dir));
        }

        let working_dir = match &self.working_dir {
            Some(dir) => project_root.join(dir),
            None => project_root.to_path_buf(),
        };
        let stderr = if self.inherit_stderr || global_inherit_stderr {
            StderrPolicy::Inherit
        } else {
            StderrPolicy::Silence
        };

        let mut builder = LaunchDescriptor::builder(program, working_dir)
            .args(self.args.iter().cloned())
            .stderr(stderr)
            .target(self.execution_target);
        for (key, value) in &self.env {
            builder = builder.env(key.as_str(), value.as_str());
        }
        builder.build()
    }
}

/// Replace a leading `~` with the home directory.
#[must_use]
pub fn expand_home(value: &str) -> PathBuf {
    let rest = if value == "~" {
        Some("")
    } else {
        value.strip_prefix("~/")
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}
