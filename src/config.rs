use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Path to the SQLite file backing the vector index.
    pub path: PathBuf,
    #[serde(default = "default_index_name")]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
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

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    pub model: String,
    pub dims: usize,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_gen_retries")]
    pub max_retries: u32,
    #[serde(default = "default_gen_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on reasoning steps before the agent is forced to answer.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Passages fetched per retrieval tool call.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_fetch_retries(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_index_name() -> String {
    "default".to_string()
}

fn default_window_chars() -> usize {
    800
}

fn default_overlap_chars() -> usize {
    100
}

fn default_top_k() -> usize {
    4
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_batch_size() -> usize {
    64
}

fn default_embed_retries() -> u32 {
    5
}

fn default_embed_timeout() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_gen_retries() -> u32 {
    3
}

fn default_gen_timeout() -> u64 {
    120
}

fn default_max_steps() -> usize {
    6
}

fn default_fetch_retries() -> u32 {
    2
}

fn default_fetch_timeout() -> u64 {
    20
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.window_chars == 0 {
        return Err(Error::Config("chunking.window_chars must be > 0".into()));
    }
    if config.chunking.overlap_chars >= config.chunking.window_chars {
        return Err(Error::Config(
            "chunking.overlap_chars must be smaller than chunking.window_chars".into(),
        ));
    }
    if config.embedding.dims == 0 {
        return Err(Error::Config("embedding.dims must be > 0".into()));
    }
    if config.retrieval.top_k == 0 || config.agent.top_k == 0 {
        return Err(Error::Config("top_k must be >= 1".into()));
    }
    if config.agent.max_steps == 0 {
        return Err(Error::Config("agent.max_steps must be >= 1".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    const MINIMAL: &str = r#"
        [index]
        path = "kb.db"

        [embedding]
        model = "text-embedding-3-small"
        dims = 1536

        [generation]
        model = "gpt-4o-mini"
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.index.name, "default");
        assert_eq!(config.chunking.window_chars, 800);
        assert_eq!(config.chunking.overlap_chars, 100);
        assert_eq!(config.agent.max_steps, 6);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.embedding.api_key_env, "OPENAI_API_KEY");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_overlap_must_be_below_window() {
        let mut config = parse(MINIMAL);
        config.chunking.window_chars = 50;
        config.chunking.overlap_chars = 50;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_max_steps_rejected() {
        let mut config = parse(MINIMAL);
        config.agent.max_steps = 0;
        assert!(validate(&config).is_err());
    }
}
