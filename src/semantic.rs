use serde::Deserialize;
use std::collections::HashMap;

use crate::api_connection::endpoints::{ChatCompletionRequest, ChatMessage, Provider};
use crate::catalog::types::Candidate;

/// Scores at or above this stay eligible for re-admission from the cache even
/// when the current LLM response omits them.
const CACHE_READMIT_FLOOR: f32 = 40.0;

const MAX_ANALYZED_CANDIDATES: usize = 80;

/// LLM-backed gate that scores candidates against the ingredient's meaning.
///
/// Scores are cached per (lowercased ingredient, fdc_id) so retries and
/// follow-up stages see stable values within one process.
pub struct SemanticVerifier {
    provider: Option<Provider>,
    score_cache: HashMap<(String, i64), f32>,
    pub llm_calls: u64,
}

#[derive(Debug, Deserialize)]
struct SemanticVerdict {
    #[serde(deserialize_with = "crate::semantic::lenient_i64")]
    fdc_id: i64,
    #[serde(default)]
    semantic_match_score: f32,
    #[serde(default)]
    reasoning: String,
}

impl SemanticVerifier {
    pub fn new(provider: Option<Provider>) -> Self {
        Self {
            provider,
            score_cache: HashMap::new(),
            llm_calls: 0,
        }
    }

    pub fn cached_score(&self, ingredient: &str, fdc_id: i64) -> Option<f32> {
        self.score_cache
            .get(&(ingredient.to_lowercase(), fdc_id))
            .copied()
    }

    fn cache_score(&mut self, ingredient: &str, fdc_id: i64, score: f32) {
        self.score_cache
            .insert((ingredient.to_lowercase(), fdc_id), score);
    }

    /// Verify up to 80 candidates, returning the best `top_n` annotated with
    /// `semantic_score` and `semantic_reasoning`, sorted descending. Without
    /// an LLM the top `top_n` pass through unscored.
    pub async fn verify(
        &mut self,
        ingredient: &str,
        candidates: &[Candidate],
        top_n: usize,
    ) -> Vec<Candidate> {
        let candidates = &candidates[..candidates.len().min(MAX_ANALYZED_CANDIDATES)];
        let Some(provider) = self.provider.clone() else {
            return candidates.iter().take(top_n).cloned().collect();
        };

        let prompt = self.build_prompt(ingredient, candidates, top_n);
        let request = ChatCompletionRequest {
            model: provider.model().to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You are a helpful assistant that returns only valid JSON arrays."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            response_format: None,
            temperature: Some(0.0),
            max_tokens: None,
        };

        self.llm_calls += 1;
        let content = match provider.chat_text(request).await {
            Ok(content) => content,
            Err(e) => {
                println!("  LLM semantic verification error: {}", e);
                return candidates.iter().take(top_n).cloned().collect();
            }
        };

        let verdicts = match parse_verdicts(&content) {
            Ok(verdicts) => verdicts,
            Err(e) => {
                println!("  Failed to parse semantic verification response: {}", e);
                return candidates.iter().take(top_n).cloned().collect();
            }
        };

        let mut verified: Vec<Candidate> = Vec::new();
        for verdict in &verdicts {
            if let Some(original) = candidates.iter().find(|c| c.fdc_id == verdict.fdc_id) {
                let mut annotated = original.clone();
                annotated.semantic_score = Some(verdict.semantic_match_score);
                annotated.semantic_reasoning = Some(verdict.reasoning.clone());
                self.cache_score(ingredient, verdict.fdc_id, verdict.semantic_match_score);
                verified.push(annotated);
            }
        }

        // Re-admit candidates the LLM dropped this round but scored
        // acceptably before.
        for candidate in candidates {
            if verified.iter().any(|c| c.fdc_id == candidate.fdc_id) {
                continue;
            }
            if let Some(cached) = self.cached_score(ingredient, candidate.fdc_id) {
                if cached >= CACHE_READMIT_FLOOR {
                    let mut annotated = candidate.clone();
                    annotated.semantic_score = Some(cached);
                    annotated.semantic_reasoning =
                        Some("Cached score from previous attempt".to_string());
                    verified.push(annotated);
                }
            }
        }

        verified.sort_by(|a, b| {
            b.semantic_score
                .unwrap_or(0.0)
                .partial_cmp(&a.semantic_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        verified.truncate(top_n);
        verified
    }

    fn build_prompt(&self, ingredient: &str, candidates: &[Candidate], top_n: usize) -> String {
        let mut results_text = String::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let line = match self.cached_score(ingredient, candidate.fdc_id) {
                Some(cached) => format!(
                    "{}. FDC ID {}: {} [CACHED: {:.1}%]\n",
                    i + 1,
                    candidate.fdc_id,
                    candidate.description,
                    cached
                ),
                None => format!(
                    "{}. FDC ID {}: {}\n",
                    i + 1,
                    candidate.fdc_id,
                    candidate.description
                ),
            };
            results_text.push_str(&line);
        }

        format!(
            r#"You are a nutrition database expert. Analyze if the USDA food descriptions semantically match the ingredient.

INGREDIENT: "{ingredient}"

USDA SEARCH RESULTS:
{results}
CRITICAL RULES:
1. Check SEMANTIC MEANING, not just word similarity
   - "jasmine rice" should match "Rice, jasmine" or "Rice, white, jasmine" but NOT "Rice, black"
   - "green lentils" should match "Lentils, green" but NOT "Green onion" or "Green beans"
   - "vanilla bean" should match vanilla-related items, NOT "Beans, cannellini"

2. **FORM VARIATIONS ARE ACCEPTABLE** - Same ingredient in different forms should score HIGH:
   - "cinnamon sticks" vs "Spices, cinnamon, ground" -> Score 85-95% (same ingredient, different form)
   - "kosher salt" vs "Salt, table" -> Score 80-90% (same ingredient, different form)
   - "smoked paprika" vs "Spices, paprika" -> Score 80-90% (same ingredient, flavor variation)
   - "whole cloves" vs "Spices, cloves, ground" -> Score 85-95% (same ingredient, different form)
   - "tzatziki" vs "Tzatziki dip" -> Score 90-100% (same item, different naming - Survey (FNDDS) data type)
   - "guacamole" vs "Guacamole, NFS" -> Score 90-100% (same item, NFS = Not Further Specified - Survey (FNDDS))

3. **SURVEY (FNDDS) DATA TYPE**: Many prepared foods, dips, sauces are in Survey (FNDDS) data type.
   - These are valid generic foods (not branded products)
   - Items like "Tzatziki dip", "Guacamole, NFS", "Chutney" are in Survey (FNDDS)
   - DO NOT penalize Survey (FNDDS) items - they are legitimate matches

4. Consider ingredient context:
   - Spices: "black pepper" = spice, not bell pepper
   - Varieties: "basmati rice" = specific rice variety, not just any rice
   - Forms: "cocoa powder" = processed cocoa, not raw cacao beans
   - Compound foods: "chickpea pasta" should match pasta made from chickpeas, not just "Chickpea flour"

5. Reject clearly wrong matches:
   - Different food categories (e.g., "green lentils" vs "green onion")
   - Different varieties (e.g., "jasmine rice" vs "black rice")
   - Different base ingredients (e.g., "vanilla bean" vs "cannellini beans")

6. **SCORING GUIDELINES:**
   - 90-100%: Exact match or same item with minor naming/form differences
   - 80-89%: Same ingredient, different form (ground vs whole, kosher vs table salt)
   - 65-79%: Related ingredient, acceptable match (e.g., "smoked paprika" vs "paprika")
   - 50-64%: Related but different (e.g., "fresh oregano" vs "dried oregano")
   - <50%: Different ingredient, reject

Return JSON array with top {top_n} matches, each with:
{{
    "rank": 1-{top_n},
    "fdc_id": <FDC ID>,
    "description": "<USDA description>",
    "semantic_match_score": 0-100 (100 = perfect semantic match, 0 = completely wrong),
    "reasoning": "<brief explanation of why this matches or doesn't match semantically>"
}}

**IMPORTANT:** Include results where semantic_match_score >= 40. Be lenient with form variations. If the ingredient exists in the results (even with a different form), include it with an appropriate score."#,
            ingredient = ingredient,
            results = results_text,
            top_n = top_n,
        )
    }
}

fn parse_verdicts(content: &str) -> Result<Vec<SemanticVerdict>, serde_json::Error> {
    // A single-object response is treated as a one-element array.
    match serde_json::from_str::<Vec<SemanticVerdict>>(content) {
        Ok(verdicts) => Ok(verdicts),
        Err(e) => match serde_json::from_str::<SemanticVerdict>(content) {
            Ok(verdict) => Ok(vec![verdict]),
            Err(_) => Err(e),
        },
    }
}

/// The LLM sometimes returns FDC IDs as strings. Accept both.
pub(crate) fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdField {
        Number(i64),
        Text(String),
    }

    match IdField::deserialize(deserializer)? {
        IdField::Number(n) => Ok(n),
        IdField::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid FDC ID: {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(fdc_id: i64, description: &str) -> Candidate {
        Candidate {
            fdc_id,
            description: description.to_string(),
            data_type: "SR Legacy".to_string(),
            food_category: String::new(),
            search_tier: 1,
            relevance_score: 0.0,
            semantic_score: None,
            semantic_reasoning: None,
            nutritional_score: None,
            nutritional_reasoning: None,
            key_differences: Vec::new(),
        }
    }

    #[test]
    fn test_parse_verdicts_array() {
        let content = r#"[{"rank": 1, "fdc_id": 168880, "description": "Rice, white, jasmine", "semantic_match_score": 92, "reasoning": "same variety"}]"#;
        let verdicts = parse_verdicts(content).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].fdc_id, 168880);
        assert_eq!(verdicts[0].semantic_match_score, 92.0);
    }

    #[test]
    fn test_parse_verdicts_single_object_wrapped() {
        let content = r#"{"rank": 1, "fdc_id": "168880", "semantic_match_score": 88.5, "reasoning": ""}"#;
        let verdicts = parse_verdicts(content).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].fdc_id, 168880);
    }

    #[test]
    fn test_parse_verdicts_rejects_garbage() {
        assert!(parse_verdicts("the best match is #3").is_err());
    }

    #[test]
    fn test_score_cache_is_idempotent() {
        let mut verifier = SemanticVerifier::new(None);
        verifier.cache_score("Jasmine Rice", 168880, 92.0);
        verifier.cache_score("jasmine rice", 168880, 92.0);
        assert_eq!(verifier.cached_score("JASMINE RICE", 168880), Some(92.0));
        assert_eq!(verifier.score_cache.len(), 1);
    }

    #[tokio::test]
    async fn test_no_provider_passes_top_n_through() {
        let mut verifier = SemanticVerifier::new(None);
        let candidates = vec![
            candidate(1, "Rice, white, jasmine"),
            candidate(2, "Rice, brown"),
            candidate(3, "Rice, black"),
            candidate(4, "Rice flour"),
        ];
        let verified = verifier.verify("jasmine rice", &candidates, 3).await;
        assert_eq!(verified.len(), 3);
        assert_eq!(verified[0].fdc_id, 1);
        assert!(verified[0].semantic_score.is_none());
        assert_eq!(verifier.llm_calls, 0);
    }

    #[test]
    fn test_prompt_marks_cached_candidates() {
        let mut verifier = SemanticVerifier::new(None);
        verifier.cache_score("tzatziki", 2705448, 95.0);
        let candidates = vec![candidate(2705448, "Tzatziki dip"), candidate(9, "Yogurt, Greek")];
        let prompt = verifier.build_prompt("tzatziki", &candidates, 3);
        assert!(prompt.contains("1. FDC ID 2705448: Tzatziki dip [CACHED: 95.0%]"));
        assert!(prompt.contains("2. FDC ID 9: Yogurt, Greek\n"));
    }
}
