//! Layered configuration: `.branchline/branchline.toml` → environment → CLI.
//!
//! Later layers only override fields they actually set; everything else
//! keeps the previous layer's value.

use std::path::{Path, PathBuf};

use anyhow::Context;
use glob::glob;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Relative to the project directory.
pub const CONFIG_RELATIVE_PATH: &str = ".branchline/branchline.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tiers: TiersConfig,
    pub branch: BranchConfig,
    pub agents: AgentsConfig,
    pub auto_correction: AutoCorrectionConfig,
    pub resilience: ResilienceConfig,
    pub director: DirectorConfig,
    pub cleanup: CleanupConfig,
    pub adapters: AdaptersConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
    /// The `claude` CLI binary to invoke for both pipeline and conflict
    /// agents.
    pub claude_cmd: String,
    pub skip_permissions: bool,
    /// Image used to provision a sandbox container for a pipeline run when
    /// Docker is reachable. Ignored otherwise.
    pub sandbox_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tiers: TiersConfig::default(),
            branch: BranchConfig::default(),
            agents: AgentsConfig::default(),
            auto_correction: AutoCorrectionConfig::default(),
            resilience: ResilienceConfig::default(),
            director: DirectorConfig::default(),
            cleanup: CleanupConfig::default(),
            adapters: AdaptersConfig::default(),
            events: EventsConfig::default(),
            logging: LoggingConfig::default(),
            claude_cmd: "claude".to_string(),
            skip_permissions: false,
            sandbox_image: "branchline/agent-sandbox:latest".to_string(),
        }
    }
}

impl Config {
    /// Load `.branchline/branchline.toml` under `project_dir`, falling back to
    /// a discovered location, then a user-level default, then hardcoded
    /// defaults if none of those exist, then apply environment and CLI
    /// overrides.
    pub fn load(project_dir: &Path, cli: CliOverrides) -> anyhow::Result<Self> {
        let mut config = match Self::discover_config_path(project_dir)? {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
                toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?
            }
            None => Self::load_user_default()?,
        };
        config.apply_env();
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Locate the project's config file: the canonical
    /// `.branchline/branchline.toml` first, then a root-level
    /// `branchline*.toml` (for repos that keep it unhidden), then a bounded
    /// recursive search for a nested `.branchline/branchline.toml` (repos
    /// that keep the dotdir under a subdirectory) — the same
    /// preferred-location-then-glob-fallback shape the teacher's
    /// `find_spec_file` uses for spec discovery.
    fn discover_config_path(project_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
        let preferred = project_dir.join(CONFIG_RELATIVE_PATH);
        if preferred.exists() {
            return Ok(Some(preferred));
        }

        let pattern = project_dir.join("branchline*.toml").to_string_lossy().to_string();
        let mut matches: Vec<PathBuf> =
            glob(&pattern).context("invalid config discovery glob pattern")?.filter_map(|entry| entry.ok()).collect();
        matches.sort();
        if let Some(path) = matches.into_iter().next() {
            return Ok(Some(path));
        }

        let nested = WalkDir::new(project_dir)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .find(|entry| {
                entry.file_name() == "branchline.toml"
                    && entry.path().components().any(|c| c.as_os_str() == ".branchline")
            });
        Ok(nested.map(|entry| entry.path().to_path_buf()))
    }

    /// Lowest-precedence layer below "no project config found at all": a
    /// user-level config at the platform config directory (e.g.
    /// `~/.config/branchline/config.toml` on Linux), shared across every
    /// project on the machine. Absent either the directory or the file,
    /// falls through to hardcoded defaults.
    fn load_user_default() -> anyhow::Result<Self> {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(Self::default());
        };
        let path = config_dir.join("branchline").join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw =
            std::fs::read_to_string(&path).map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("BRANCHLINE_LOGGING_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("BRANCHLINE_BRANCH_MAIN") {
            self.branch.main = v;
        }
        if let Ok(v) = std::env::var("BRANCHLINE_EVENTS_PATH") {
            self.events.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BRANCHLINE_DIRECTOR_SCHEDULE_INTERVAL_MS")
            && let Ok(ms) = v.parse()
        {
            self.director.schedule_interval_ms = ms;
        }
        if let Ok(v) = std::env::var("CLAUDE_CMD") {
            self.claude_cmd = v;
        }
        if std::env::var("BRANCHLINE_SKIP_PERMISSIONS").is_ok() {
            self.skip_permissions = true;
        }
    }

    fn apply_cli(&mut self, cli: CliOverrides) {
        if let Some(v) = cli.log_level {
            self.logging.level = v;
        }
        if let Some(v) = cli.main_branch {
            self.branch.main = v;
        }
        if let Some(v) = cli.events_path {
            self.events.path = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.branch.pipeline_prefix.ends_with('/') {
            anyhow::bail!("branch.pipeline_prefix must end with '/'");
        }
        if !self.branch.integration_prefix.ends_with('/') {
            anyhow::bail!("branch.integration_prefix must end with '/'");
        }
        Ok(())
    }

    /// The project-relative manifest path the ManifestManager owns.
    pub fn manifest_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(".pipeline/manifest.json")
    }

    /// The project-relative active-pipelines (idempotency) path.
    pub fn active_pipelines_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(".branchline/active-pipelines.json")
    }

    pub fn dlq_path(&self, project_dir: &Path) -> PathBuf {
        if self.resilience.dlq.path.is_absolute() {
            self.resilience.dlq.path.clone()
        } else {
            project_dir.join(&self.resilience.dlq.path)
        }
    }

    pub fn events_path(&self, project_dir: &Path) -> PathBuf {
        if self.events.path.is_absolute() {
            self.events.path.clone()
        } else {
            project_dir.join(&self.events.path)
        }
    }
}

/// Flags carried down from `clap` that may override config-file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_level: Option<String>,
    pub main_branch: Option<String>,
    pub events_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub small: TierBand,
    pub medium: TierBand,
    pub large: TierBand,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            small: TierBand {
                max_files: Some(3),
                max_lines: Some(100),
                agents: vec!["implementer".into()],
            },
            medium: TierBand {
                max_files: Some(15),
                max_lines: Some(500),
                agents: vec!["implementer".into(), "reviewer".into()],
            },
            large: TierBand {
                max_files: None,
                max_lines: None,
                agents: vec!["implementer".into(), "reviewer".into(), "architect".into()],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBand {
    pub max_files: Option<u32>,
    pub max_lines: Option<u32>,
    pub agents: Vec<String>,
}

impl Default for TierBand {
    fn default() -> Self {
        Self { max_files: None, max_lines: None, agents: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub pipeline_prefix: String,
    pub integration_prefix: String,
    pub main: String,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            pipeline_prefix: "pipeline/".into(),
            integration_prefix: "integration/".into(),
            main: "main".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub pipeline: AgentRoleConfig,
    pub conflict: AgentRoleConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            pipeline: AgentRoleConfig {
                model: "claude-sonnet-4-5".into(),
                permission_mode: "standard".into(),
                max_turns: 40,
            },
            conflict: AgentRoleConfig {
                model: "claude-sonnet-4-5".into(),
                permission_mode: "standard".into(),
                max_turns: 10,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRoleConfig {
    pub model: String,
    pub permission_mode: String,
    pub max_turns: u32,
}

impl Default for AgentRoleConfig {
    fn default() -> Self {
        Self { model: "claude-sonnet-4-5".into(), permission_mode: "standard".into(), max_turns: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCorrectionConfig {
    pub max_attempts: u32,
}

impl Default for AutoCorrectionConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakersConfig,
    pub dlq: DlqConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self { circuit_breaker: CircuitBreakersConfig::default(), dlq: DlqConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakersConfig {
    pub agent: CircuitBreakerConfig,
    pub forge: CircuitBreakerConfig,
}

impl Default for CircuitBreakersConfig {
    fn default() -> Self {
        Self {
            agent: CircuitBreakerConfig { failure_threshold: 5, reset_timeout_ms: 30_000 },
            forge: CircuitBreakerConfig { failure_threshold: 3, reset_timeout_ms: 60_000 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".pipeline/dlq"),
            max_retries: 5,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    pub auto_trigger_delay_ms: u64,
    pub default_priority: i64,
    pub schedule_interval_ms: u64,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self { auto_trigger_delay_ms: 2_000, default_priority: 0, schedule_interval_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub keep_on_failure: bool,
    pub stale_branch_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { keep_on_failure: false, stale_branch_days: 14 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    pub retry_interval_ms: u64,
    pub webhooks: Vec<WebhookConfig>,
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self { retry_interval_ms: 15_000, webhooks: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub path: PathBuf,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { path: PathBuf::from(".pipeline/events.jsonl") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_prefix_without_trailing_slash() {
        let mut config = Config::default();
        config.branch.pipeline_prefix = "pipeline".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_missing_file_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.branch.main, "main");
    }

    #[test]
    fn parses_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".branchline")).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_RELATIVE_PATH),
            r#"
            [branch]
            main = "trunk"

            [director]
            schedule_interval_ms = 0
            "#,
        )
        .unwrap();
        let config = Config::load(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.branch.main, "trunk");
        assert_eq!(config.director.schedule_interval_ms, 0);
    }

    #[test]
    fn discovers_root_level_toml_when_dotdir_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("branchline.toml"), "[branch]\nmain = \"trunk\"\n").unwrap();
        let config = Config::load(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.branch.main, "trunk");
    }

    #[test]
    fn discovers_nested_dotdir_config_via_recursive_search() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("service").join(".branchline");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("branchline.toml"), "[branch]\nmain = \"trunk\"\n").unwrap();
        let config = Config::load(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.branch.main, "trunk");
    }

    #[test]
    fn cli_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliOverrides { main_branch: Some("develop".into()), ..Default::default() };
        let config = Config::load(dir.path(), cli).unwrap();
        assert_eq!(config.branch.main, "develop");
    }
}
