//! Configuration model
//!
//! Mirrors the layout of `stratus.yaml`:
//!
//! ```yaml
//! project: my-project
//! default_environment: dev
//! backend:
//!   type: local
//!   path: .stratus/state
//! lock:
//!   max_attempts: 10
//!   initial_delay_ms: 500
//! provisioner:
//!   binary: tofu
//!   modules_dir: infra/modules
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level project configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name; the first component of every state key
    pub project: String,

    /// Environment used when none is given explicitly
    #[serde(default)]
    pub default_environment: Option<String>,

    /// Where state records and locks live
    #[serde(default)]
    pub backend: BackendConfig,

    /// Retry policy for environment-level lock acquisition
    #[serde(default)]
    pub lock: LockRetryConfig,

    /// Settings for the OpenTofu provisioner
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

impl ProjectConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            default_environment: None,
            backend: BackendConfig::default(),
            lock: LockRetryConfig::default(),
            provisioner: ProvisionerConfig::default(),
        }
    }

    /// Rebase every relative path onto `base_dir` (the directory holding the config file)
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if let BackendConfig::Local { path } = &mut self.backend {
            rebase(path, base_dir);
        }
        rebase(&mut self.provisioner.modules_dir, base_dir);
        rebase(&mut self.provisioner.work_dir, base_dir);
    }

    /// Check semantic constraints serde cannot express
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.project.trim().is_empty() {
            return Err("project must not be empty".to_string());
        }
        if let Some(env) = &self.default_environment {
            if env.trim().is_empty() {
                return Err("default_environment must not be empty".to_string());
            }
        }
        if let BackendConfig::Remote { url, .. } = &self.backend {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("remote backend url must be http(s): {}", url));
            }
        }
        if self.lock.max_attempts == 0 {
            return Err("lock.max_attempts must be at least 1".to_string());
        }
        if self.lock.multiplier < 1.0 {
            return Err("lock.multiplier must be >= 1.0".to_string());
        }
        if self.provisioner.timeout_secs == 0 {
            return Err("provisioner.timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

fn rebase(path: &mut PathBuf, base_dir: &Path) {
    if path.is_relative() {
        *path = base_dir.join(&*path);
    }
}

/// State backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// JSON files and lock files on the local filesystem
    Local {
        #[serde(default = "default_state_path")]
        path: PathBuf,
    },
    /// HTTP control-plane service
    Remote {
        url: String,
        /// Name of the environment variable holding the bearer token
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".stratus/state")
}

/// Exponential backoff used when waiting on a contended lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl LockRetryConfig {
    /// A single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), in milliseconds
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        (delay as u64).min(self.max_delay_ms)
    }
}

/// OpenTofu / Terraform provisioner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    /// One module directory per product tag
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,
    /// Per-entity working directories (tfvars, local state, logs)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_binary() -> String {
    "tofu".to_string()
}
fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}
fn default_work_dir() -> PathBuf {
    PathBuf::from(".stratus/work")
}
fn default_timeout() -> u64 {
    1800
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            modules_dir: default_modules_dir(),
            work_dir: default_work_dir(),
            timeout_secs: default_timeout(),
        }
    }
}
