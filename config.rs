//! TAKT configuration types and loading (§10.3)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::PermissionMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub concurrency: ConcurrencyConfig,
    /// How long a worker sleeps between manifest polls when nothing is
    /// pending.
    #[serde(rename = "task-poll-interval-ms")]
    pub task_poll_interval_ms: u64,
    /// Rounds a `(review, fix)` fingerprint pair may repeat before the
    /// engine forces an arbitration transition.
    #[serde(rename = "cycle-window")]
    pub cycle_window: usize,
    pub git: GitConfig,
    pub paths: PathsConfig,
    /// Per-provider permission-mode overrides from whichever config file won
    /// `Config::load`'s fallback chain (§6 resolution levels 1 and 3).
    #[serde(rename = "provider-profiles")]
    pub provider_profiles: ProviderProfiles,
    /// The user-global config's `provider-profiles`, loaded independently of
    /// which file won above (§6 resolution levels 2 and 4) — the project and
    /// global layers must both stay reachable at once, unlike every other
    /// field here, which is single-winner.
    #[serde(skip)]
    pub global_provider_profiles: ProviderProfiles,
    /// Never read from a config file — `TAKT_VERBOSE` only.
    #[serde(skip)]
    pub verbose: bool,
    /// Never read from a config file — `TAKT_MOCK_SCENARIO` only, for
    /// deterministic fixture runs against the mock provider.
    #[serde(skip)]
    pub mock_scenario: Option<String>,
}

/// One provider's permission-mode defaults and per-movement overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderProfile {
    pub default: Option<PermissionMode>,
    pub movements: HashMap<String, PermissionMode>,
}

pub type ProviderProfiles = HashMap<String, ProviderProfile>;

impl Config {
    /// Load configuration with the same fallback chain as the teacher's
    /// `config.rs`: explicit path → project-local → user-global → default.
    /// Environment-variable overrides are applied last, highest precedence.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load_from_file(path).context(format!("failed to load config from {}", path.display()))?
        } else if let Some(config) = Self::try_project_local() {
            config
        } else if let Some(config) = Self::try_user_global() {
            config
        } else {
            tracing::info!("no config file found, using defaults");
            Self::default()
        };

        config.global_provider_profiles = Self::load_global_provider_profiles();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Always attempted, independent of which file won the chain above —
    /// §6 permission-mode resolution needs project and global provider
    /// profiles available simultaneously, not collapsed to one winner.
    fn load_global_provider_profiles() -> ProviderProfiles {
        let Some(config_dir) = std::env::var("TAKT_CONFIG_DIR").map(PathBuf::from).ok().or_else(dirs::config_dir) else {
            return ProviderProfiles::new();
        };
        let path = config_dir.join("takt").join("config.yml");
        if !path.is_file() {
            return ProviderProfiles::new();
        }
        match Self::load_from_file(&path) {
            Ok(config) => config.provider_profiles,
            Err(e) => {
                tracing::warn!("failed to load global provider profiles from {}: {}", path.display(), e);
                ProviderProfiles::new()
            }
        }
    }

    /// Build the §6 five-level permission-mode resolver: project-movement >
    /// global-movement > project-default > global-default > the movement's
    /// own floor, which the last step always clamps up to regardless of what
    /// the first four resolve to.
    pub fn permission_resolver(&self) -> Arc<dyn Fn(&str, &str, PermissionMode) -> PermissionMode + Send + Sync> {
        let project = self.provider_profiles.clone();
        let global = self.global_provider_profiles.clone();
        Arc::new(move |provider, movement, floor| {
            let resolved = project
                .get(provider)
                .and_then(|p| p.movements.get(movement))
                .copied()
                .or_else(|| global.get(provider).and_then(|p| p.movements.get(movement)).copied())
                .or_else(|| project.get(provider).and_then(|p| p.default))
                .or_else(|| global.get(provider).and_then(|p| p.default));
            resolved.unwrap_or(floor).at_least(floor)
        })
    }

    fn try_project_local() -> Option<Self> {
        let local_config = PathBuf::from(".takt").join("config.yml");
        if !local_config.exists() {
            return None;
        }
        match Self::load_from_file(&local_config) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("failed to load config from {}: {}", local_config.display(), e);
                None
            }
        }
    }

    fn try_user_global() -> Option<Self> {
        let config_dir = std::env::var("TAKT_CONFIG_DIR").map(PathBuf::from).ok().or_else(dirs::config_dir)?;
        let user_config = config_dir.join("takt").join("config.yml");
        if !user_config.exists() {
            return None;
        }
        match Self::load_from_file(&user_config) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("failed to load config from {}: {}", user_config.display(), e);
                None
            }
        }
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("failed to parse config file")?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Environment variable > project config > global config > built-in
    /// default, per §6's configuration precedence.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(auto_pr) = std::env::var("TAKT_AUTO_PR") {
            self.git.auto_pr = auto_pr == "true";
        }
        if let Ok(base_branch) = std::env::var("TAKT_BASE_BRANCH") {
            self.git.base_branch = base_branch;
        }
        if let Ok(verbose) = std::env::var("TAKT_VERBOSE") {
            self.verbose = match verbose.as_str() {
                "true" => true,
                "false" => false,
                other => eyre::bail!("TAKT_VERBOSE must be `true` or `false`, got `{other}`"),
            };
        }
        if let Ok(scenario) = std::env::var("TAKT_MOCK_SCENARIO") {
            self.mock_scenario = Some(scenario);
        }
        self.apply_provider_option_overrides();
        Ok(())
    }

    /// `TAKT_PROVIDER_OPTIONS_<PROVIDER>_<FIELD>` overrides a field of
    /// `self.provider`, but only when `<PROVIDER>` matches the configured
    /// provider name (case-insensitively).
    fn apply_provider_option_overrides(&mut self) {
        let prefix = format!("TAKT_PROVIDER_OPTIONS_{}_", self.provider.provider.to_uppercase());
        for (key, value) in std::env::vars() {
            let Some(field) = key.strip_prefix(&prefix) else { continue };
            match field {
                "MODEL" => self.provider.model = value,
                "API_KEY_ENV" => self.provider.api_key_env = value,
                "TIMEOUT_MS" => {
                    if let Ok(timeout_ms) = value.parse() {
                        self.provider.timeout_ms = timeout_ms;
                    } else {
                        tracing::warn!(key, value, "ignoring non-numeric TIMEOUT_MS override");
                    }
                }
                other => tracing::warn!(field = other, "unknown provider option override field"),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub provider: String,
    pub model: String,
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    #[serde(rename = "max-workers")]
    pub max_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    #[serde(rename = "worktree-dir")]
    pub worktree_dir: PathBuf,
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,
    #[serde(rename = "base-branch")]
    pub base_branch: String,
    #[serde(rename = "auto-pr")]
    pub auto_pr: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from(".takt/worktrees"),
            branch_prefix: "takt".to_string(),
            base_branch: "main".to_string(),
            auto_pr: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(rename = "manifest-path")]
    pub manifest_path: PathBuf,
    #[serde(rename = "sessions-dir")]
    pub sessions_dir: PathBuf,
    #[serde(rename = "pieces-dir")]
    pub pieces_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from(".takt/tasks.yaml"),
            sessions_dir: PathBuf::from(".takt/sessions"),
            pieces_dir: PathBuf::from(".takt/pieces"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.provider.provider, "anthropic");
        assert_eq!(config.concurrency.max_workers, 1);
        assert_eq!(config.git.base_branch, "main");
    }

    #[test]
    fn deserializes_kebab_case_yaml() {
        let yaml = r#"
provider:
  provider: anthropic
  model: claude-opus-4
  api-key-env: MY_API_KEY
  timeout-ms: 60000

concurrency:
  max-workers: 4

task-poll-interval-ms: 5000
cycle-window: 5

git:
  worktree-dir: /tmp/takt/worktrees
  branch-prefix: wt
  base-branch: develop
  auto-pr: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.provider.model, "claude-opus-4");
        assert_eq!(config.concurrency.max_workers, 4);
        assert_eq!(config.task_poll_interval_ms, 5000);
        assert_eq!(config.cycle_window, 5);
        assert_eq!(config.git.base_branch, "develop");
        assert!(config.git.auto_pr);
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let yaml = r#"
provider:
  model: claude-haiku
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.provider.model, "claude-haiku");
        assert_eq!(config.provider.provider, "anthropic");
        assert_eq!(config.concurrency.max_workers, 1);
    }

    #[test]
    #[serial_test::serial]
    fn env_override_takes_precedence_over_file_value() {
        std::env::set_var("TAKT_BASE_BRANCH", "release");
        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        std::env::remove_var("TAKT_BASE_BRANCH");
        assert_eq!(config.git.base_branch, "release");
    }

    #[test]
    #[serial_test::serial]
    fn verbose_env_var_is_strict() {
        std::env::set_var("TAKT_VERBOSE", "yes");
        let mut config = Config::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("TAKT_VERBOSE");
        assert!(result.is_err());
    }

    #[test]
    #[serial_test::serial]
    fn provider_option_override_applies_only_to_matching_provider() {
        std::env::set_var("TAKT_PROVIDER_OPTIONS_ANTHROPIC_TIMEOUT_MS", "9000");
        std::env::set_var("TAKT_PROVIDER_OPTIONS_OPENAI_TIMEOUT_MS", "1");
        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        std::env::remove_var("TAKT_PROVIDER_OPTIONS_ANTHROPIC_TIMEOUT_MS");
        std::env::remove_var("TAKT_PROVIDER_OPTIONS_OPENAI_TIMEOUT_MS");
        assert_eq!(config.provider.timeout_ms, 9000);
    }

    #[test]
    fn permission_resolver_prefers_project_movement_override() {
        let mut config = Config::default();
        config.provider_profiles.insert(
            "anthropic".to_string(),
            ProviderProfile {
                default: Some(PermissionMode::Edit),
                movements: HashMap::from([("ai_fix".to_string(), PermissionMode::Full)]),
            },
        );
        config.global_provider_profiles.insert(
            "anthropic".to_string(),
            ProviderProfile {
                default: Some(PermissionMode::Readonly),
                movements: HashMap::new(),
            },
        );
        let resolver = config.permission_resolver();
        assert_eq!(resolver("anthropic", "ai_fix", PermissionMode::Readonly), PermissionMode::Full);
    }

    #[test]
    fn permission_resolver_falls_back_to_project_default_then_global_default() {
        let mut config = Config::default();
        config.provider_profiles.insert(
            "anthropic".to_string(),
            ProviderProfile {
                default: Some(PermissionMode::Edit),
                movements: HashMap::new(),
            },
        );
        let resolver = config.permission_resolver();
        assert_eq!(resolver("anthropic", "ai_review", PermissionMode::Readonly), PermissionMode::Edit);

        let mut config = Config::default();
        config.global_provider_profiles.insert(
            "anthropic".to_string(),
            ProviderProfile {
                default: Some(PermissionMode::Edit),
                movements: HashMap::new(),
            },
        );
        let resolver = config.permission_resolver();
        assert_eq!(resolver("anthropic", "ai_review", PermissionMode::Readonly), PermissionMode::Edit);
    }

    #[test]
    fn permission_resolver_never_resolves_below_the_movements_floor() {
        let mut config = Config::default();
        config.provider_profiles.insert(
            "anthropic".to_string(),
            ProviderProfile {
                default: Some(PermissionMode::Readonly),
                movements: HashMap::new(),
            },
        );
        let resolver = config.permission_resolver();
        assert_eq!(resolver("anthropic", "ai_review", PermissionMode::Full), PermissionMode::Full);
    }

    #[test]
    #[serial_test::serial]
    fn mock_scenario_is_only_set_from_the_environment() {
        std::env::set_var("TAKT_MOCK_SCENARIO", "happy-path");
        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        std::env::remove_var("TAKT_MOCK_SCENARIO");
        assert_eq!(config.mock_scenario.as_deref(), Some("happy-path"));
    }
}
