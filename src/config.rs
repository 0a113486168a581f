//! Configuration for acadagent.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ACADAGENT_HOME, ACADAGENT_STORAGE)
//! 2. Config file (.acadagent/config.yaml)
//! 3. Defaults (~/.acadagent)
//!
//! Config file discovery:
//! - Searches current directory and parents for .acadagent/config.yaml
//! - `paths.home` is relative to the .acadagent/ directory; every other
//!   path is relative to the project root (the parent of .acadagent/)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::adapters::ExpertKind;
use crate::core::reasoner::{ReasonerSettings, MAX_RETRIES};
use crate::core::registry::RecoveryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".acadagent";
const DEFAULT_EXPERT_TIMEOUT_SECS: u64 = 600;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Keyed by expert kind (`search`, `vision`, `clip_indexing`, ...)
    #[serde(default)]
    pub experts: HashMap<String, ExpertConfig>,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    /// Vision strategy name → instruction
    #[serde(default)]
    pub strategies: HashMap<String, String>,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .acadagent/)
    pub home: Option<String>,
    /// Uploaded and processed assets (relative to project root)
    pub storage: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    "https://api.deepseek.com".to_string()
}
fn default_model() -> String {
    "deepseek-chat".to_string()
}
fn default_api_key_env() -> String {
    "DEEPSEEK_API_KEY".to_string()
}
fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_seconds: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// How to launch one expert
#[derive(Debug, Clone, Deserialize)]
pub struct ExpertConfig {
    /// Program to run, e.g. `envs/vision/bin/python`
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Extracted frames root (relative to project root)
    #[serde(default)]
    pub frames_dir: Option<String>,
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}
fn default_top_k() -> usize {
    5
}
fn default_history_window() -> usize {
    3
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            top_k: default_top_k(),
            history_window: default_history_window(),
            frames_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestionConfig {
    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

/// Expert launch settings with absolute paths
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedExpert {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state (registry log, sessions)
    pub home: PathBuf,
    /// Uploaded and processed assets
    pub storage: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub llm: LlmConfig,
    pub experts: HashMap<ExpertKind, ResolvedExpert>,
    pub reasoning: ReasoningConfig,
    /// Absolute frames root
    pub frames_dir: PathBuf,
    pub strategies: HashMap<String, String>,
    pub recovery: RecoveryPolicy,
}

impl ResolvedConfig {
    pub fn registry_dir(&self) -> PathBuf {
        self.home.join("registry")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    pub fn reasoner_settings(&self) -> ReasonerSettings {
        ReasonerSettings {
            max_retries: self.reasoning.max_retries,
            top_k: self.reasoning.top_k.max(1),
            history_window: self.reasoning.history_window.max(1),
            frames_dir: self.frames_dir.clone(),
            strategies: self.strategies.clone(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Bare command names stay as-is so they are looked up on PATH
fn resolve_program(base: &Path, program: &str) -> PathBuf {
    if program.contains('/') {
        resolve_path(base, program)
    } else {
        PathBuf::from(program)
    }
}

fn expert_kind(name: &str) -> Option<ExpertKind> {
    ExpertKind::ALL.into_iter().find(|k| k.as_str() == name)
}

fn resolve_experts(base: &Path, raw: HashMap<String, ExpertConfig>) -> HashMap<ExpertKind, ResolvedExpert> {
    let mut experts = HashMap::new();
    for (name, cfg) in raw {
        let Some(kind) = expert_kind(&name) else {
            warn!(expert = %name, "Ignoring unknown expert in config");
            continue;
        };
        experts.insert(
            kind,
            ResolvedExpert {
                program: resolve_program(base, &cfg.program),
                args: cfg.args,
                working_dir: cfg.working_dir.map(|d| resolve_path(base, &d)),
                env: cfg.env,
                timeout: Duration::from_secs(cfg.timeout_seconds.unwrap_or(DEFAULT_EXPERT_TIMEOUT_SECS)),
            },
        );
    }
    experts
}

/// Resolve configuration from an optional config file plus the environment
fn resolve(config_file: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let env_home = std::env::var("ACADAGENT_HOME").ok().map(PathBuf::from);
    let env_storage = std::env::var("ACADAGENT_STORAGE").ok().map(PathBuf::from);

    let (config, config_dir, base_dir) = match config_file {
        Some(ref config_path) => {
            let config = load_config_file(config_path)?;
            // .acadagent/
            let config_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
            // project root
            let base_dir = config_dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            (config, Some(config_dir), Some(base_dir))
        }
        None => (ConfigFile::default(), None, None),
    };

    let home = env_home.unwrap_or_else(|| match (&config.paths.home, &config_dir) {
        (Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home.clone(),
    });

    let storage = env_storage.unwrap_or_else(|| match (&config.paths.storage, &base_dir) {
        (Some(storage), Some(base)) => resolve_path(base, storage),
        _ => home.join("storage"),
    });

    let base = base_dir.clone().unwrap_or_else(|| home.clone());
    let frames_dir = match config.reasoning.frames_dir {
        Some(ref dir) => resolve_path(&base, dir),
        None => storage.join("processed").join("video"),
    };

    Ok(ResolvedConfig {
        experts: resolve_experts(&base, config.experts),
        home,
        storage,
        config_file,
        llm: config.llm,
        reasoning: config.reasoning,
        frames_dir,
        strategies: config.strategies,
        recovery: config.ingestion.recovery,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve(find_config_file())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, yaml: &str) -> PathBuf {
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        config_path
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./state
  storage: ./storage
llm:
  model: deepseek-reasoner
experts:
  search:
    program: envs/search/bin/python
    args: ["services/wrappers/strengthened_search.py"]
    timeout_seconds: 30
reasoning:
  max_retries: 1
strategies:
  formula_ocr: "Transcribe any formula visible in this frame."
ingestion:
  recovery: fail
"#,
        );

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version.as_deref(), Some("1.0"));
        assert_eq!(config.llm.model, "deepseek-reasoner");
        assert_eq!(config.llm.base_url, "https://api.deepseek.com");
        assert_eq!(config.reasoning.max_retries, 1);
        assert_eq!(config.reasoning.top_k, 5);
        assert_eq!(config.ingestion.recovery, RecoveryPolicy::Fail);
        assert_eq!(config.experts["search"].timeout_seconds, Some(30));
    }

    #[test]
    fn test_resolve_paths_and_experts() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
experts:
  vision:
    program: envs/vision/bin/python
  sandbox:
    program: python3
  telepathy:
    program: nope
"#,
        );

        let config = resolve(Some(config_path)).unwrap();
        let vision = &config.experts[&ExpertKind::Vision];
        assert!(vision.program.is_absolute());
        assert!(vision.program.ends_with("envs/vision/bin/python"));
        assert_eq!(vision.timeout, Duration::from_secs(DEFAULT_EXPERT_TIMEOUT_SECS));
        assert_eq!(config.experts[&ExpertKind::Sandbox].program, PathBuf::from("python3"));
        assert_eq!(config.experts.len(), 2);
        assert!(config.frames_dir.ends_with("processed/video"));
    }

    #[test]
    fn test_state_dirs_and_reasoner_settings() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
paths:
  home: ./state
reasoning:
  max_retries: 1
  top_k: 0
"#,
        );

        let config = resolve(Some(config_path)).unwrap();
        let home = temp.path().join(CONFIG_DIR).join("state");
        assert_eq!(config.registry_dir(), home.join("registry"));
        assert_eq!(config.sessions_dir(), home.join("sessions"));

        let settings = config.reasoner_settings();
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.top_k, 1);
        assert_eq!(settings.frames_dir, config.frames_dir);
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(resolve_program(&base, "python3"), PathBuf::from("python3"));
    }
}
