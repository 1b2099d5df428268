//! Application configuration
//! Mission: Parse the closed environment-variable set once at startup

use anyhow::{bail, Result};
use std::env;

/// LLM provider selector. Closed set; anything else is a startup error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    ClaudeLike,
    VertexLike,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::ClaudeLike => "claude_like",
            LlmProvider::VertexLike => "vertex_like",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude_like" => Some(Self::ClaudeLike),
            "vertex_like" => Some(Self::VertexLike),
            _ => None,
        }
    }
}

/// Application configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project namespace for store and provider calls.
    pub gcp_project_id: String,
    pub gcp_region: String,
    pub port: u16,
    pub database_path: String,

    pub llm_provider: LlmProvider,
    pub anthropic_model: String,
    pub vertex_model: String,
    pub vertex_location: String,
    /// When false the orchestrator stops at the rule pass.
    pub llm_categorization_enabled: bool,

    pub cors_allowed_origin: Option<String>,
    /// Accept X-Dev-User instead of a bearer token. Must be false in prod.
    pub allow_local_dev_bypass: bool,
    pub jwt_secret: String,
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let gcp_project_id = match env::var("GCP_PROJECT_ID") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => bail!("GCP_PROJECT_ID missing (set env var)"),
        };

        let gcp_region =
            env::var("GCP_REGION").unwrap_or_else(|_| "northamerica-northeast1".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./pennybot.db".to_string());

        let llm_provider = match env::var("LLM_PROVIDER") {
            Ok(v) => match LlmProvider::parse(&v) {
                Some(p) => p,
                None => bail!("LLM_PROVIDER must be claude_like or vertex_like, got {v:?}"),
            },
            Err(_) => LlmProvider::VertexLike,
        };

        let anthropic_model = env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-3-5-haiku-20241022".to_string());
        let vertex_model =
            env::var("VERTEX_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string());
        let vertex_location = env::var("VERTEX_LOCATION").unwrap_or_else(|_| gcp_region.clone());

        let llm_categorization_enabled = env_bool("LLM_CATEGORIZATION_ENABLED", true);

        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let allow_local_dev_bypass = env_bool("ALLOW_LOCAL_DEV_BYPASS", false);

        let jwt_secret = env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

        Ok(Self {
            gcp_project_id,
            gcp_region,
            port,
            database_path,
            llm_provider,
            anthropic_model,
            vertex_model,
            vertex_location,
            llm_categorization_enabled,
            cors_allowed_origin,
            allow_local_dev_bypass,
            jwt_secret,
        })
    }
}
