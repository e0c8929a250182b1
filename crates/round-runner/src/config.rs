use anyhow::{bail, Context, Result};
use round_harness::protocol::ProtocolConfig;
use round_harness::retry::{RetryPolicy, DEFAULT_ATTEMPTS, DEFAULT_DELAY_MS};
use round_harness::{EvaluationHarness, LocalHarness, ParHarness};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Replaces the service URL of a `par` harness
pub const URL_ENV: &str = "ROUND_RUNNER_URL";
/// Replaces the result directory of a `local` harness
pub const RESULT_DIR_ENV: &str = "ROUND_RUNNER_RESULT_DIR";

fn default_retry_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_detection_threshold() -> f64 {
    0.5
}

/// Which evaluation harness to talk to
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarnessConfig {
    /// In-process file provider
    Local {
        data_dir: PathBuf,
        result_dir: PathBuf,
        work_dir: PathBuf,
    },
    /// Remote evaluation service
    Par {
        url: String,
        save_directory: PathBuf,
        #[serde(default = "default_retry_attempts")]
        retry_attempts: u32,
        #[serde(default = "default_retry_delay_ms")]
        retry_delay_ms: u64,
    },
}

impl HarnessConfig {
    pub fn build(&self) -> Result<Arc<dyn EvaluationHarness>> {
        match self {
            Self::Local {
                data_dir,
                result_dir,
                work_dir,
            } => {
                let harness = LocalHarness::new(data_dir, result_dir, work_dir)
                    .context("Failed to set up the local harness")?;
                Ok(Arc::new(harness))
            }
            Self::Par {
                url,
                save_directory,
                retry_attempts,
                retry_delay_ms,
            } => {
                let harness = ParHarness::new(url.as_str(), save_directory)
                    .context("Failed to build the HTTP harness client")?
                    .with_retry(RetryPolicy::new(
                        *retry_attempts,
                        Duration::from_millis(*retry_delay_ms),
                    ));
                Ok(Arc::new(harness))
            }
        }
    }

    /// Where run artifacts such as the summary go
    pub fn output_dir(&self) -> &Path {
        match self {
            Self::Local { result_dir, .. } => result_dir,
            Self::Par { save_directory, .. } => save_directory,
        }
    }
}

/// One `[[algorithms]]` entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlgorithmConfig {
    pub name: String,
    /// Registry key
    pub kind: String,
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Top-level runner configuration, parsed from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunnerConfig {
    pub harness: HarnessConfig,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub algorithms: Vec<AlgorithmConfig>,
}

impl RunnerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RunnerConfig =
            toml::from_str(content).context("Failed to parse runner config TOML")?;
        Ok(config)
    }

    /// Apply `ROUND_RUNNER_URL` / `ROUND_RUNNER_RESULT_DIR`
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(URL_ENV).ok(),
            std::env::var(RESULT_DIR_ENV).ok().map(PathBuf::from),
        );
    }

    pub fn apply_overrides(&mut self, url: Option<String>, result_dir: Option<PathBuf>) {
        match &mut self.harness {
            HarnessConfig::Par { url: current, .. } => {
                if let Some(url) = url {
                    *current = url;
                }
            }
            HarnessConfig::Local {
                result_dir: current,
                ..
            } => {
                if let Some(dir) = result_dir {
                    *current = dir;
                }
            }
        }
    }

    /// Resume the given sessions, keyed by algorithm name
    pub fn apply_resume(&mut self, sessions: Vec<(String, String)>) {
        if sessions.is_empty() {
            return;
        }
        self.protocol.resume_session = true;
        self.protocol.resume_session_ids.extend(sessions);
    }

    pub fn validate(&self) -> Result<()> {
        if self.algorithms.is_empty() {
            bail!("No algorithms configured");
        }
        let mut names: Vec<&str> = self.algorithms.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            bail!("Algorithm name {} is configured twice", dup[0]);
        }
        self.protocol.validate().context("Invalid [protocol] section")?;
        Ok(())
    }
}

/// Parse `algorithm=session` for `--resume`
pub fn parse_resume(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((algorithm, session)) if !algorithm.is_empty() && !session.is_empty() => {
            Ok((algorithm.trim().to_string(), session.trim().to_string()))
        }
        _ => Err(format!("expected <algorithm>=<session id>, got {raw:?}")),
    }
}
