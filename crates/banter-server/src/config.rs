//! Environment-driven configuration. Every knob has a default; parsing
//! failures are fatal at startup rather than silently falling back.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use banter_api::AiBackend;
use banter_gateway::Tuning;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub rto_base: Duration,
    pub rto_max: Duration,
    pub max_attempts: u32,
    pub key_dir: PathBuf,
    pub db_path: PathBuf,
    pub worker_threads: usize,
    pub ai: AiSettings,
}

#[derive(Debug, Clone)]
pub struct AiSettings {
    pub backend: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub context_messages: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_addr: parse_env("BIND_ADDR", "0.0.0.0:9999")?,
            metrics_addr: parse_env("METRICS_ADDR", "0.0.0.0:8080")?,
            idle_timeout: Duration::from_secs(parse_env("IDLE_TIMEOUT_SEC", "600")?),
            rto_base: Duration::from_millis(parse_env("RTO_BASE_MS", "1000")?),
            rto_max: Duration::from_millis(parse_env("RTO_MAX_MS", "8000")?),
            max_attempts: parse_env("MAX_ATTEMPTS", "5")?,
            key_dir: PathBuf::from(env_or("KEY_DIR", "./storage/keys")),
            db_path: PathBuf::from(env_or("DB_PATH", "./storage/banter.db")),
            worker_threads: parse_env("WORKER_THREADS", "4")?,
            ai: AiSettings {
                backend: env_or("AI_BACKEND", "none"),
                openai_api_key: env_or("OPENAI_API_KEY", ""),
                openai_model: env_or("OPENAI_MODEL", "gpt-3.5-turbo"),
                ollama_url: env_or("OLLAMA_URL", "http://127.0.0.1:11434"),
                ollama_model: env_or("OLLAMA_MODEL", "mistral"),
                context_messages: parse_env("AI_CONTEXT_MESSAGES", "20")?,
            },
        })
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            idle_timeout: self.idle_timeout,
            rto_base: self.rto_base,
            rto_max: self.rto_max,
            max_attempts: self.max_attempts,
        }
    }

    /// Build the configured generation backend. Misconfiguration (unknown
    /// backend, missing credentials) is a fatal startup error.
    pub fn ai_backend(&self) -> Result<AiBackend> {
        match self.ai.backend.as_str() {
            "none" => Ok(AiBackend::Disabled),
            "openai" => {
                if self.ai.openai_api_key.is_empty() {
                    bail!("AI_BACKEND=openai requires OPENAI_API_KEY");
                }
                AiBackend::openai(self.ai.openai_api_key.clone(), self.ai.openai_model.clone())
            }
            "ollama" => {
                AiBackend::ollama(self.ai.ollama_url.clone(), self.ai.ollama_model.clone())
            }
            other => bail!("unknown AI_BACKEND '{}' (expected openai|ollama|none)", other),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_or(key, default)
        .parse()
        .with_context(|| format!("invalid value for {}", key))
}
