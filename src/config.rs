//! TOML configuration for a Regulens project.
//!
//! A single [`Config`] value is loaded once by the binary and passed by
//! reference into the orchestrator and every component that needs a setting.
//! Relative paths are resolved against the directory containing the config
//! file so a project can be moved as a unit.
//!
//! ```toml
//! [project]
//! name = "acme-iso27001"
//! regulation = "regulation.json"
//!
//! [paths]
//! data_dir = "./data"
//!
//! [procedures]
//! root = "./procedures"
//!
//! [llm]
//! judge_model = "gpt-4o"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    pub procedures: ProceduresConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub name: String,
    /// JSON map of `clause_id -> "Title\nBody"`.
    pub regulation: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProceduresConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_doc_type")]
    pub doc_type: String,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.csv".to_string(),
        "**/*.tsv".to_string(),
    ]
}

fn default_doc_type() -> String {
    "procedure".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            max_tokens: default_max_tokens(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_max_tokens() -> usize {
    200
}
fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_chat_model")]
    pub need_check_model: String,
    #[serde(default = "default_chat_model")]
    pub audit_plan_model: String,
    #[serde(default = "default_chat_model")]
    pub judge_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            need_check_model: default_chat_model(),
            audit_plan_model: default_chat_model(),
            judge_model: default_chat_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

impl Config {
    /// Per-project working directory under the data dir.
    pub fn project_dir(&self) -> PathBuf {
        self.paths
            .data_dir
            .join("projects")
            .join(project_dir_name(&self.project.name))
    }
}

/// Directory name for a project: readable prefix plus a hash of the exact
/// name, so names that sanitize alike (`"acme iso"`, `"acme_iso"`) stay apart.
pub fn project_dir_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("{}_{}", sanitize_component(name), &hex::encode(digest)[..8])
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&content, base)
}

/// Parse and validate config text; relative paths are joined onto `base`.
pub fn parse_config(content: &str, base: &Path) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.project.name.trim().is_empty() {
        bail!("project.name must not be empty");
    }

    // Validate embedding
    if config.embedding.max_tokens == 0 {
        bail!("embedding.max_tokens must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.model.trim().is_empty() {
        bail!("embedding.model must not be empty");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }

    // Validate llm
    for (field, value) in [
        ("llm.need_check_model", &config.llm.need_check_model),
        ("llm.audit_plan_model", &config.llm.audit_plan_model),
        ("llm.judge_model", &config.llm.judge_model),
    ] {
        if value.trim().is_empty() {
            bail!("{} must not be empty", field);
        }
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }

    config.project.regulation = resolve(base, &config.project.regulation);
    config.paths.data_dir = resolve(base, &config.paths.data_dir);
    config.procedures.root = resolve(base, &config.procedures.root);

    Ok(config)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
