use anyhow::{bail, Result};
use std::env;

use crate::api_connection::endpoints::{Provider, DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL};

pub const USDA_API_KEY_ENV_VAR: &str = "USDA_API_KEY";
pub const LLM_API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

/// Runtime configuration gathered from the environment. Loaded once at
/// startup; a missing catalog API key is fatal before any request is made.
#[derive(Debug, Clone)]
pub struct Config {
    pub usda_api_key: String,
    pub usda_base_url: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_available: bool,
    pub curated_mapping_file: String,
    pub cache_file: String,
    pub nutrient_definitions_file: String,
    pub rate_limit_delay_ms: u64,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub default_page_size: u32,
    pub default_data_type: String,
    pub max_acceptable_score: i32,
}

impl Config {
    pub fn load() -> Result<Self> {
        let usda_api_key = match env::var(USDA_API_KEY_ENV_VAR) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!(
                "{} is required. Set it in a .env file or environment variable.\n\
                 Get your free API key at: https://api.data.gov/signup/",
                USDA_API_KEY_ENV_VAR
            ),
        };

        let llm_available = env::var(LLM_API_KEY_ENV_VAR)
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false);

        Ok(Self {
            usda_api_key,
            usda_base_url: env::var("USDA_BASE_URL")
                .unwrap_or_else(|_| "https://api.nal.usda.gov/fdc/v1".to_string()),
            llm_base_url: env::var("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| DEFAULT_LLM_BASE_URL.to_string()),
            llm_model: env::var("OPENAI_MODEL_NAME")
                .unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            llm_available,
            curated_mapping_file: env::var("CURATED_MAPPING_FILE")
                .unwrap_or_else(|_| "data/common_ingredients_mapping.json".to_string()),
            cache_file: env::var("CACHE_FILE")
                .unwrap_or_else(|_| "data/ingredient_search_mapping.json".to_string()),
            nutrient_definitions_file: env::var("NUTRIENT_DEFINITIONS_FILE")
                .unwrap_or_else(|_| "data/nutrition_definitions.csv".to_string()),
            rate_limit_delay_ms: parse_env("RATE_LIMIT_DELAY_MS", 500),
            max_retries: parse_env("MAX_RETRIES", 3),
            timeout_secs: parse_env("TIMEOUT", 45),
            default_page_size: parse_env("DEFAULT_PAGE_SIZE", 50),
            default_data_type: env::var("DEFAULT_DATA_TYPE")
                .unwrap_or_else(|_| "Foundation,SR Legacy".to_string()),
            max_acceptable_score: parse_env("MAX_ACCEPTABLE_SCORE", 50),
        })
    }

    /// LLM provider for the intent/semantic/nutritional stages, or `None` when
    /// no LLM key is configured (those stages then run their fallbacks).
    pub fn llm_provider(&self) -> Option<Provider> {
        if self.llm_available {
            Some(Provider::openai_compatible(
                LLM_API_KEY_ENV_VAR,
                &self.llm_base_url,
                &self.llm_model,
            ))
        } else {
            None
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_default_when_unset() {
        assert_eq!(parse_env("NUTRITION_MAPPER_UNSET_VAR_XYZ", 500u64), 500);
    }

    #[test]
    fn test_parse_env_default_when_unparseable() {
        unsafe {
            env::set_var("NUTRITION_MAPPER_BAD_NUMBER", "not-a-number");
        }
        assert_eq!(parse_env("NUTRITION_MAPPER_BAD_NUMBER", 3u32), 3);
        unsafe {
            env::remove_var("NUTRITION_MAPPER_BAD_NUMBER");
        }
    }

    #[test]
    fn test_parse_env_reads_value() {
        unsafe {
            env::set_var("NUTRITION_MAPPER_GOOD_NUMBER", "1250");
        }
        assert_eq!(parse_env("NUTRITION_MAPPER_GOOD_NUMBER", 500u64), 1250);
        unsafe {
            env::remove_var("NUTRITION_MAPPER_GOOD_NUMBER");
        }
    }
}
