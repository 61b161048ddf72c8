//! Agent configuration stored in `codeloop.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "codeloop.toml";

/// Agent configuration (TOML).
///
/// Every field has a default so an absent or partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CodeloopConfig {
    pub session: SessionConfig,
    pub provider: ProviderConfig,
    pub supervisor: SupervisorConfig,
    pub dependencies: DependencyConfig,
    pub feedback: FeedbackConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Target directory for fresh projects when `--path` is not given.
    pub project_root: PathBuf,
    /// Generation attempts allowed per requirement.
    pub retry_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("generated_projects/project"),
            retry_budget: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Client-side request timeout. Unset means wait as long as the transport allows.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            temperature: 0.0,
            max_tokens: Some(8192),
            request_timeout_secs: None,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Program and leading arguments; the entry point path is appended.
    pub command: Vec<String>,
    /// Entry point file names tried in order, relative to the project root.
    pub entry_candidates: Vec<String>,
    /// Time a fresh process gets to exit before it is treated as a service.
    pub startup_window_ms: u64,
    /// How often the child and the interrupt flag are checked.
    pub poll_interval_ms: u64,
    /// Time the process group gets between SIGTERM and SIGKILL.
    pub terminate_grace_ms: u64,
    /// Upper bound on the running phase; unset waits for the operator.
    pub max_running_secs: Option<u64>,
    /// Bytes of stdout and of stderr kept (most recent) for diagnostics.
    pub capture_limit_bytes: usize,
    /// Output substrings that mark a failure even when the exit code is 0.
    pub error_markers: Vec<String>,
    /// Mirror child output to the operator's terminal while capturing it.
    pub echo_output: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "-u".to_string()],
            entry_candidates: vec!["main.py".to_string()],
            startup_window_ms: 5_000,
            poll_interval_ms: 100,
            terminate_grace_ms: 2_000,
            max_running_secs: None,
            capture_limit_bytes: 64 * 1024,
            error_markers: vec!["Traceback (most recent call last)".to_string()],
            echo_output: true,
        }
    }
}

impl SupervisorConfig {
    pub fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn max_running(&self) -> Option<Duration> {
        self.max_running_secs.map(Duration::from_secs)
    }
}

/// Exits 0 when the installed distribution satisfies `sys.argv[1]`.
const REQUIREMENT_CHECK: &str = "\
import sys
from importlib import metadata
try:
    from packaging.requirements import Requirement
except ImportError:
    from pip._vendor.packaging.requirements import Requirement
req = Requirement(sys.argv[1])
sys.exit(0 if req.specifier.contains(metadata.version(req.name), prereleases=True) else 1)
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DependencyConfig {
    /// Install missing packages before each run.
    pub enabled: bool,
    /// Requirements file scanned for package references.
    pub manifest: String,
    /// Command that exits 0 when a requirement is already satisfied; the
    /// requirement spec (`flask>=3`) is appended.
    pub check_command: Vec<String>,
    /// Command that installs a package; the requirement spec is appended.
    pub install_command: Vec<String>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            manifest: "requirements.txt".to_string(),
            check_command: vec![
                "python3".to_string(),
                "-c".to_string(),
                REQUIREMENT_CHECK.to_string(),
            ],
            install_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Diagnostic bytes kept (most recent) in a repair prompt.
    pub trace_limit_bytes: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            trace_limit_bytes: 12_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebConfig {
    /// Open the served page when a `web` project reaches the running phase.
    pub open_browser: bool,
    pub host: String,
    /// Ports checked, in order, for the generated server.
    pub ports: Vec<u16>,
    /// How long to keep checking before giving up on the browser.
    pub wait_secs: u64,
    /// Browser launcher; the URL is appended.
    pub browser_command: Vec<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            open_browser: true,
            host: "127.0.0.1".to_string(),
            ports: vec![5000, 8000, 8080, 3000, 8501],
            wait_secs: 15,
            browser_command: vec![if cfg!(target_os = "macos") {
                "open".to_string()
            } else {
                "xdg-open".to_string()
            }],
        }
    }
}

impl WebConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

impl CodeloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session.retry_budget == 0 {
            return Err(anyhow!("session.retry_budget must be > 0"));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(anyhow!("provider.base_url must not be empty"));
        }
        if self.provider.model.trim().is_empty() {
            return Err(anyhow!("provider.model must not be empty"));
        }
        if self.provider.api_key_env.trim().is_empty() {
            return Err(anyhow!("provider.api_key_env must not be empty"));
        }
        if self.supervisor.command.is_empty() || self.supervisor.command[0].trim().is_empty() {
            return Err(anyhow!("supervisor.command must be a non-empty array"));
        }
        if self.supervisor.entry_candidates.is_empty() {
            return Err(anyhow!("supervisor.entry_candidates must not be empty"));
        }
        if self.supervisor.startup_window_ms == 0 {
            return Err(anyhow!("supervisor.startup_window_ms must be > 0"));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(anyhow!("supervisor.poll_interval_ms must be > 0"));
        }
        if self.supervisor.capture_limit_bytes == 0 {
            return Err(anyhow!("supervisor.capture_limit_bytes must be > 0"));
        }
        if self.dependencies.enabled
            && (self.dependencies.check_command.is_empty()
                || self.dependencies.install_command.is_empty())
        {
            return Err(anyhow!(
                "dependencies.check_command and dependencies.install_command must be non-empty"
            ));
        }
        if self.web.open_browser && (self.web.ports.is_empty() || self.web.browser_command.is_empty())
        {
            return Err(anyhow!(
                "web.ports and web.browser_command must be non-empty when web.open_browser is set"
            ));
        }
        if self.feedback.trace_limit_bytes == 0 {
            return Err(anyhow!("feedback.trace_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CodeloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<CodeloopConfig> {
    if !path.exists() {
        let cfg = CodeloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CodeloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
