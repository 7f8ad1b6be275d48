use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

const DEFAULT_SERVER_PORT: u16 = 8090;
const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0";

const DEFAULT_LLM_BASE_URL: &str = "http://llm:8080";
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 15;

const DEFAULT_UPSTREAM_BASE_URL: &str = "http://open-webui:8081";

const DEFAULT_PROMPT_LIMIT_KB: usize = 32;
const DEFAULT_FILE_LIMIT_KB: usize = 2048;
const DEFAULT_SCRUB_DATA_PATH: &str = "/data/scrub";

const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./cloak.toml",
    "./config/cloak.toml",
    "~/.config/cloak.toml",
];

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub upstream: UpstreamConfig,
    pub scrub: ScrubConfig,
    pub dev_mode: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            address: DEFAULT_SERVER_ADDRESS.to_string(),
        }
    }
}

/// Downstream LLM server (llama.cpp-style, OpenAI-compatible API).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
        }
    }
}

/// The chat UI we sit in front of. Only its file endpoint matters, for
/// passthrough mode.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScrubConfig {
    pub prompt_limit_kb: usize,
    pub file_limit_kb: usize,
    pub data_path: PathBuf,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            prompt_limit_kb: DEFAULT_PROMPT_LIMIT_KB,
            file_limit_kb: DEFAULT_FILE_LIMIT_KB,
            data_path: PathBuf::from(DEFAULT_SCRUB_DATA_PATH),
        }
    }
}

impl ScrubConfig {
    /// Prompt size ceiling in bytes.
    pub fn prompt_limit(&self) -> usize {
        self.prompt_limit_kb * 1024
    }

    /// File size ceiling in bytes.
    pub fn file_limit(&self) -> usize {
        self.file_limit_kb * 1024
    }
}

impl Config {
    /// Load configuration in one pass: defaults, then the TOML file (an
    /// explicit path, or the first default location that exists), then
    /// environment overrides on top.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let home = env::var("HOME").unwrap_or_default();

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = config_path {
            candidates.push(PathBuf::from(path));
        }
        for path in DEFAULT_CONFIG_PATHS {
            candidates.push(PathBuf::from(path.replace('~', &home)));
        }

        let mut config = match candidates.into_iter().find(|p| p.exists()) {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Invalid TOML in {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Environment variables override file values.
    fn apply_env(&mut self) {
        if let Ok(v) = env::var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = env::var("LLM_TIMEOUT")
            && let Ok(secs) = v.parse()
        {
            self.llm.timeout_secs = secs;
        }
        if let Ok(v) = env::var("SCRUB_PROMPT_LIMIT_KB")
            && let Ok(kb) = v.parse()
        {
            self.scrub.prompt_limit_kb = kb;
        }
        if let Ok(v) = env::var("SCRUB_FILE_LIMIT_KB")
            && let Ok(kb) = v.parse()
        {
            self.scrub.file_limit_kb = kb;
        }
        if let Ok(v) = env::var("SCRUB_DATA_PATH") {
            self.scrub.data_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("OPENWEBUI_URL") {
            self.upstream.base_url = v;
        }
        if let Ok(v) = env::var("DEV_MODE") {
            self.dev_mode = v.eq_ignore_ascii_case("true");
        }
    }
}

/// Write a default config file, for `cloak init`.
pub fn generate_default_config(path: impl AsRef<Path>) -> Result<()> {
    let rendered = toml::to_string_pretty(&Config::default())
        .context("Failed to render default config as TOML")?;

    fs::write(&path, rendered)
        .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

    Ok(())
}
