use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-debate knobs. Immutable for the life of one debate; requests may
/// override individual fields over the environment-derived defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateConfig {
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub early_stop_score: u8,
    pub proposer_model: String,
    pub skeptic_model: String,
    pub synthesizer_model: String,
    pub proposer_temp: f32,
    pub skeptic_temp: f32,
    pub synthesizer_temp: f32,
    pub rag_top_k: usize,
    pub similarity_floor: f32,
    pub per_call_timeout_secs: u64,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            min_rounds: 1,
            max_rounds: 3,
            early_stop_score: 8,
            proposer_model: "llama3.1:8b".to_string(),
            skeptic_model: "llama3.1:8b".to_string(),
            synthesizer_model: "llama3.1:8b".to_string(),
            proposer_temp: 0.8,
            skeptic_temp: 0.6,
            synthesizer_temp: 0.4,
            rag_top_k: 3,
            similarity_floor: 0.35,
            per_call_timeout_secs: 120,
        }
    }
}

impl DebateConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.min_rounds < 1 {
            return Err("min_rounds must be at least 1".to_string());
        }
        if self.max_rounds < self.min_rounds {
            return Err("max_rounds must be >= min_rounds".to_string());
        }
        if !(1..=10).contains(&self.early_stop_score) {
            return Err("early_stop_score must be in 1..=10".to_string());
        }
        for (label, temp) in [
            ("proposer_temp", self.proposer_temp),
            ("skeptic_temp", self.skeptic_temp),
            ("synthesizer_temp", self.synthesizer_temp),
        ] {
            if !(0.0..=2.0).contains(&temp) {
                return Err(format!("{label} must be in 0.0..=2.0"));
            }
        }
        if self.rag_top_k < 1 {
            return Err("rag_top_k must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.similarity_floor) {
            return Err("similarity_floor must be in 0.0..=1.0".to_string());
        }
        if self.per_call_timeout_secs == 0 {
            return Err("per_call_timeout_secs must be positive".to_string());
        }
        Ok(())
    }

    /// Apply request-supplied overrides on top of the service defaults.
    pub fn merged(&self, overrides: &DebateOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(v) = overrides.min_rounds {
            merged.min_rounds = v;
        }
        if let Some(v) = overrides.max_rounds {
            merged.max_rounds = v;
        }
        if let Some(v) = overrides.early_stop_score {
            merged.early_stop_score = v;
        }
        if let Some(ref v) = overrides.proposer_model {
            merged.proposer_model = v.clone();
        }
        if let Some(ref v) = overrides.skeptic_model {
            merged.skeptic_model = v.clone();
        }
        if let Some(ref v) = overrides.synthesizer_model {
            merged.synthesizer_model = v.clone();
        }
        if let Some(v) = overrides.proposer_temp {
            merged.proposer_temp = v;
        }
        if let Some(v) = overrides.skeptic_temp {
            merged.skeptic_temp = v;
        }
        if let Some(v) = overrides.synthesizer_temp {
            merged.synthesizer_temp = v;
        }
        if let Some(v) = overrides.rag_top_k {
            merged.rag_top_k = v;
        }
        if let Some(v) = overrides.similarity_floor {
            merged.similarity_floor = v;
        }
        if let Some(v) = overrides.per_call_timeout_secs {
            merged.per_call_timeout_secs = v;
        }
        merged
    }
}

/// Optional per-request config fields accepted on debate start.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DebateOverrides {
    pub min_rounds: Option<u32>,
    pub max_rounds: Option<u32>,
    pub early_stop_score: Option<u8>,
    pub proposer_model: Option<String>,
    pub skeptic_model: Option<String>,
    pub synthesizer_model: Option<String>,
    pub proposer_temp: Option<f32>,
    pub skeptic_temp: Option<f32>,
    pub synthesizer_temp: Option<f32>,
    pub rag_top_k: Option<usize>,
    pub similarity_floor: Option<f32>,
    pub per_call_timeout_secs: Option<u64>,
}

/// Whole-service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub backend_url: String,
    pub embed_model: String,
    pub db_path: String,
    pub template_dirs: Vec<PathBuf>,
    pub prompt_dir: Option<PathBuf>,
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub debate_defaults: DebateConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8200)),
            backend_url: "http://127.0.0.1:11434".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            db_path: "disputant.db".to_string(),
            template_dirs: vec![PathBuf::from("templates")],
            prompt_dir: None,
            max_concurrent: 2,
            queue_depth: 8,
            debate_defaults: DebateConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Build the configuration from environment variables over compiled
    /// defaults. Unparseable values fail startup rather than being
    /// silently ignored.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(bind) = env::var("DISPUTANT_BIND") {
            config.bind = bind
                .parse::<SocketAddr>()
                .context("Invalid DISPUTANT_BIND (expected host:port)")?;
        }

        if let Ok(url) = env::var("DISPUTANT_BACKEND_URL") {
            if !url.trim().is_empty() {
                config.backend_url = url.trim().trim_end_matches('/').to_string();
            }
        }

        if let Ok(model) = env::var("DISPUTANT_EMBED_MODEL") {
            if !model.trim().is_empty() {
                config.embed_model = model.trim().to_string();
            }
        }

        if let Ok(path) = env::var("DISPUTANT_DB_PATH") {
            if !path.trim().is_empty() {
                config.db_path = path;
            }
        }

        if let Ok(dirs) = env::var("DISPUTANT_TEMPLATE_DIRS") {
            let parsed: Vec<PathBuf> = dirs
                .split(':')
                .filter(|part| !part.trim().is_empty())
                .map(PathBuf::from)
                .collect();
            if !parsed.is_empty() {
                config.template_dirs = parsed;
            }
        }

        if let Ok(dir) = env::var("DISPUTANT_PROMPT_DIR") {
            if !dir.trim().is_empty() {
                config.prompt_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(raw) = env::var("DISPUTANT_MAX_CONCURRENT") {
            config.max_concurrent = raw
                .parse()
                .context("Invalid DISPUTANT_MAX_CONCURRENT (expected positive integer)")?;
        }

        if let Ok(raw) = env::var("DISPUTANT_QUEUE_DEPTH") {
            config.queue_depth = raw
                .parse()
                .context("Invalid DISPUTANT_QUEUE_DEPTH (expected integer)")?;
        }

        let defaults = &mut config.debate_defaults;

        if let Ok(model) = env::var("DISPUTANT_PROPOSER_MODEL") {
            if !model.trim().is_empty() {
                defaults.proposer_model = model.trim().to_string();
            }
        }
        if let Ok(model) = env::var("DISPUTANT_SKEPTIC_MODEL") {
            if !model.trim().is_empty() {
                defaults.skeptic_model = model.trim().to_string();
            }
        }
        if let Ok(model) = env::var("DISPUTANT_SYNTHESIZER_MODEL") {
            if !model.trim().is_empty() {
                defaults.synthesizer_model = model.trim().to_string();
            }
        }

        if let Ok(raw) = env::var("DISPUTANT_PROPOSER_TEMP") {
            defaults.proposer_temp = raw.parse().context("Invalid DISPUTANT_PROPOSER_TEMP")?;
        }
        if let Ok(raw) = env::var("DISPUTANT_SKEPTIC_TEMP") {
            defaults.skeptic_temp = raw.parse().context("Invalid DISPUTANT_SKEPTIC_TEMP")?;
        }
        if let Ok(raw) = env::var("DISPUTANT_SYNTHESIZER_TEMP") {
            defaults.synthesizer_temp = raw
                .parse()
                .context("Invalid DISPUTANT_SYNTHESIZER_TEMP")?;
        }

        if let Ok(raw) = env::var("DISPUTANT_MIN_ROUNDS") {
            defaults.min_rounds = raw.parse().context("Invalid DISPUTANT_MIN_ROUNDS")?;
        }
        if let Ok(raw) = env::var("DISPUTANT_MAX_ROUNDS") {
            defaults.max_rounds = raw.parse().context("Invalid DISPUTANT_MAX_ROUNDS")?;
        }
        if let Ok(raw) = env::var("DISPUTANT_RAG_TOP_K") {
            defaults.rag_top_k = raw.parse().context("Invalid DISPUTANT_RAG_TOP_K")?;
        }
        if let Ok(raw) = env::var("DISPUTANT_SIMILARITY_FLOOR") {
            defaults.similarity_floor = raw
                .parse()
                .context("Invalid DISPUTANT_SIMILARITY_FLOOR")?;
        }
        if let Ok(raw) = env::var("DISPUTANT_BACKEND_TIMEOUT_SECS") {
            defaults.per_call_timeout_secs = raw
                .parse()
                .context("Invalid DISPUTANT_BACKEND_TIMEOUT_SECS")?;
        }

        if config.max_concurrent == 0 {
            anyhow::bail!("DISPUTANT_MAX_CONCURRENT must be at least 1");
        }
        config
            .debate_defaults
            .validate()
            .map_err(|message| anyhow::anyhow!("invalid debate defaults: {message}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DebateConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let config = DebateConfig {
            min_rounds: 0,
            ..DebateConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DebateConfig {
            min_rounds: 3,
            max_rounds: 2,
            ..DebateConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DebateConfig {
            skeptic_temp: 2.5,
            ..DebateConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DebateConfig {
            similarity_floor: 1.5,
            ..DebateConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DebateConfig {
            early_stop_score: 11,
            ..DebateConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn merged_applies_only_supplied_overrides() {
        let defaults = DebateConfig::default();
        let overrides = DebateOverrides {
            max_rounds: Some(5),
            skeptic_model: Some("qwen2.5:14b".to_string()),
            ..DebateOverrides::default()
        };

        let merged = defaults.merged(&overrides);
        assert_eq!(merged.max_rounds, 5);
        assert_eq!(merged.skeptic_model, "qwen2.5:14b");
        assert_eq!(merged.min_rounds, defaults.min_rounds);
        assert_eq!(merged.proposer_model, defaults.proposer_model);
    }

    #[test]
    fn overrides_parse_from_partial_json() {
        let overrides: DebateOverrides =
            serde_json::from_str(r#"{"maxRounds": 4, "proposerTemp": 1.1}"#).unwrap();
        assert_eq!(overrides.max_rounds, Some(4));
        assert_eq!(overrides.proposer_temp, Some(1.1));
        assert!(overrides.skeptic_model.is_none());
    }

    #[test]
    fn overrides_reject_unknown_fields() {
        let parsed: Result<DebateOverrides, _> = serde_json::from_str(r#"{"rounds": 4}"#);
        assert!(parsed.is_err());
    }
}
