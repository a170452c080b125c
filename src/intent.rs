use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::api_connection::connection::ApiConnectionError;
use crate::api_connection::endpoints::{
    ChatCompletionRequest, ChatMessage, Provider, ResponseFormat,
};

/// A structured query plan for one ingredient. Treated as a pure value;
/// persisted per normalized ingredient.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SearchIntent {
    pub search_query: String,
    #[serde(default)]
    pub is_phrase: bool,
    #[serde(default)]
    pub preferred_form: String,
    #[serde(default)]
    pub avoid: Vec<String>,
    #[serde(default)]
    pub expected_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
}

impl SearchIntent {
    /// Deterministic fallback when the LLM is unavailable or keeps returning
    /// malformed output: search for the ingredient verbatim.
    pub fn fallback(ingredient: &str) -> Self {
        Self {
            search_query: ingredient.to_string(),
            is_phrase: ingredient.trim().contains(char::is_whitespace),
            preferred_form: String::new(),
            avoid: Vec::new(),
            expected_pattern: String::new(),
            retry_reason: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    version: String,
    last_updated: String,
    total_ingredients: usize,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CacheFile {
    #[serde(default)]
    metadata: Option<CacheMetadata>,
    #[serde(default)]
    mappings: HashMap<String, SearchIntent>,
}

/// Persistent cache of search intents keyed by the lowercased ingredient.
/// Loaded once; writes go through a single writer that rewrites the file.
pub struct IntentCache {
    path: PathBuf,
    mappings: HashMap<String, SearchIntent>,
    pub hits: u64,
    pub misses: u64,
}

impl IntentCache {
    pub fn load(path: &Path) -> Self {
        let mappings = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) => file.mappings,
                Err(e) => {
                    eprintln!("Warning: Could not parse intent cache {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            mappings,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, ingredient: &str) -> Option<SearchIntent> {
        let key = ingredient.to_lowercase().trim().to_string();
        match self.mappings.get(&key) {
            Some(intent) => {
                self.hits += 1;
                Some(intent.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, ingredient: &str, intent: SearchIntent) -> Result<()> {
        let key = ingredient.to_lowercase().trim().to_string();
        self.mappings.insert(key, intent);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let file = CacheFile {
            metadata: Some(CacheMetadata {
                version: "1.0".to_string(),
                last_updated: Local::now().to_rfc3339(),
                total_ingredients: self.mappings.len(),
            }),
            mappings: self.mappings.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
            }
        }
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write intent cache to {:?}", self.path))
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

fn intent_prompt(ingredient: &str) -> String {
    format!(
        r#"You are a nutrition database expert. Analyze this ingredient and generate search intent for USDA FoodData Central API keyword search.

Ingredient: "{ingredient}"

SEMANTIC UNDERSTANDING:
- "black pepper" = spice (pepper that is black), belongs to spices category. USDA format: "Spices, pepper, black" or "Pepper, black"
- "onion" = vegetable, can be yellow/red/white onion (VALID color types). USDA format: "Onions, raw" or "Onions, yellow"
- "vegetable oil" = generic cooking oil. USDA format: "Oil, vegetable" or "Vegetable oil"
- Color/type AFTER ingredient = VALID modifier (e.g., "Onions, yellow" for "onion")
- Color/type BEFORE ingredient = DIFFERENT variety (e.g., "Green onion" is different from "onion")

USDA API uses keyword search - generate search_query that will return the ingredient itself, not unrelated items.

Return JSON with 5 fields:

1. search_query: Best search terms for USDA keyword search. Be strategic:
   - For "black pepper": use "pepper black" or "spices pepper" (helps find spice category)
   - For "onion": use "onions raw" (plural + form narrows results)
   - For "vegetable oil": use "vegetable oil" (keep as phrase)
   - Goal: Terms that return the actual ingredient, not items containing the word

2. is_phrase: true if multi-word is a compound name (oils, spices). false for single words.

3. preferred_form: Standard form (dairy->"whole", produce->"raw"). Empty if no preference.

4. avoid: Words indicating WRONG matches. Key distinctions:
   - For "onion": Avoid "green", "scallion", "shallot" (different varieties) BUT allow "yellow", "red", "white" (valid color types)
   - For "black pepper": Avoid "beans", "bell pepper" (different items)
   - For animal products: Avoid plant-based alternatives
   - Avoid processed forms when raw expected
   - Avoid compound foods containing ingredient
   - CRITICAL: Color/type words AFTER ingredient are VALID (e.g., "yellow" in "Onions, yellow")
   - Color/type words BEFORE ingredient are NOT OK (e.g., "green" in "Green onion")

5. expected_pattern: Expected USDA description format:
   - "black pepper" -> "Spices, pepper, black" or "Pepper, black"
   - "onion" -> "Onions, raw" or "Onions, yellow"
   - "vegetable oil" -> "Oil, vegetable"

Return ONLY valid JSON."#
    )
}

/// LLM-backed producer of search intents. Resilient to format failures: one
/// retry without the structured-output hint, then `None` (the caller falls
/// back to the plain ingredient).
pub struct IntentGenerator {
    provider: Option<Provider>,
    pub llm_calls: u64,
}

impl IntentGenerator {
    pub fn new(provider: Option<Provider>) -> Self {
        Self {
            provider,
            llm_calls: 0,
        }
    }

    pub async fn generate(&mut self, ingredient: &str) -> Option<SearchIntent> {
        let provider = self.provider.clone()?;
        let prompt = intent_prompt(ingredient);

        let structured = build_request(&provider, &prompt, true);
        self.llm_calls += 1;
        let content = match provider.chat_text(structured).await {
            Ok(content) => content,
            Err(e) => {
                // A gateway that rejects response_format gets one retry without it.
                println!("  LLM intent error ({}), retrying without format hint...", e);
                let plain = build_request(&provider, &prompt, false);
                self.llm_calls += 1;
                match provider.chat_text(plain).await {
                    Ok(content) => content,
                    Err(e) => {
                        println!("  LLM error: {}", e);
                        return None;
                    }
                }
            }
        };

        match parse_intent(&content) {
            Ok(intent) => non_empty(intent),
            Err(e) => {
                let plain = build_request(&provider, &prompt, false);
                self.llm_calls += 1;
                match provider.chat_text(plain).await {
                    Ok(retry_content) => match parse_intent(&retry_content) {
                        Ok(intent) => non_empty(intent),
                        Err(retry_err) => {
                            println!("  Failed to parse LLM intent: {} / {}", e, retry_err);
                            None
                        }
                    },
                    Err(api_err) => {
                        println!("  LLM error: {}", api_err);
                        None
                    }
                }
            }
        }
    }
}

fn build_request(provider: &Provider, prompt: &str, structured: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: provider.model().to_string(),
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: "You are a helpful assistant that returns only valid JSON.".to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            },
        ],
        response_format: structured.then(|| ResponseFormat {
            format_type: "json_object".to_string(),
            json_schema: None,
        }),
        temperature: Some(0.0),
        max_tokens: Some(512),
    }
}

/// An intent whose query trimmed away to nothing is no plan at all.
fn non_empty(intent: SearchIntent) -> Option<SearchIntent> {
    if intent.search_query.is_empty() {
        None
    } else {
        Some(intent)
    }
}

/// Strict deserialization: a `search_query` that is not a string (e.g. an
/// array) is malformed, not silently coerced to its first element.
fn parse_intent(content: &str) -> Result<SearchIntent, ApiConnectionError> {
    let mut intent: SearchIntent = serde_json::from_str(content)?;
    intent.search_query = intent
        .search_query
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string();
    Ok(intent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fallback_intent_single_word() {
        let intent = SearchIntent::fallback("tzatziki");
        assert_eq!(intent.search_query, "tzatziki");
        assert!(!intent.is_phrase);
        assert!(intent.avoid.is_empty());
    }

    #[test]
    fn test_fallback_intent_multi_word() {
        let intent = SearchIntent::fallback("jasmine rice");
        assert_eq!(intent.search_query, "jasmine rice");
        assert!(intent.is_phrase);
    }

    #[test]
    fn test_parse_intent_strips_quotes() {
        let intent = parse_intent(r#"{"search_query": "\"pepper black\"", "is_phrase": false}"#)
            .unwrap();
        assert_eq!(intent.search_query, "pepper black");
        assert_eq!(intent.preferred_form, "");
    }

    #[test]
    fn test_parse_intent_rejects_array_query() {
        let result = parse_intent(r#"{"search_query": ["pepper black", "spices"]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_cache_round_trip() -> Result<()> {
        let file = NamedTempFile::new()?;
        let mut cache = IntentCache::load(file.path());
        assert!(cache.get("black pepper").is_none());
        assert_eq!(cache.misses, 1);

        let intent = SearchIntent {
            search_query: "pepper black".to_string(),
            is_phrase: false,
            preferred_form: String::new(),
            avoid: vec!["beans".to_string()],
            expected_pattern: "Spices, pepper, black".to_string(),
            retry_reason: None,
        };
        cache.insert("Black Pepper", intent)?;

        // Keys are normalized, so lookup is case-insensitive.
        let mut reloaded = IntentCache::load(file.path());
        let cached = reloaded.get("BLACK PEPPER").expect("intent should persist");
        assert_eq!(cached.search_query, "pepper black");
        assert_eq!(cached.avoid, vec!["beans".to_string()]);
        assert_eq!(reloaded.hits, 1);
        Ok(())
    }

    #[test]
    fn test_cache_tolerates_corrupt_file() -> Result<()> {
        let file = NamedTempFile::new()?;
        std::fs::write(file.path(), "not json at all")?;
        let cache = IntentCache::load(file.path());
        assert!(cache.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_generator_without_provider_returns_none() {
        let mut generator = IntentGenerator::new(None);
        assert!(generator.generate("smoked paprika").await.is_none());
        assert_eq!(generator.llm_calls, 0);
    }
}
