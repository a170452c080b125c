use serde::Deserialize;
use std::collections::BTreeMap;

use crate::api_connection::endpoints::{ChatCompletionRequest, ChatMessage, Provider};
use crate::catalog::client::FdcClient;
use crate::catalog::types::Candidate;
use crate::nutrients::{NutrientNormalizer, NutritionData};

/// Priority weights for the heuristic similarity score. Treated as
/// configuration, not a contract.
const NUTRIENT_WEIGHTS: &[(&str, f64)] = &[
    ("calories", 0.15),
    ("calories_from_fat", 0.05),
    ("total_fat_g", 0.10),
    ("saturated_fat_g", 0.08),
    ("trans_fat_g", 0.05),
    ("polyunsaturated_fat_g", 0.05),
    ("monounsaturated_fat_g", 0.05),
    ("cholesterol_mg", 0.05),
    ("sodium_mg", 0.08),
    ("total_carbs_g", 0.10),
    ("dietary_fiber_g", 0.08),
    ("total_sugars_g", 0.05),
    ("protein_g", 0.12),
    ("vitamin_a_mcg", 0.03),
    ("vitamin_c_mg", 0.03),
    ("vitamin_d_mcg", 0.02),
    ("calcium_mg", 0.05),
    ("iron_mg", 0.05),
    ("potassium_mg", 0.05),
];

/// Canonical nutrient IDs backing the basic vector, in weight-table key order.
const BASIC_VECTOR_IDS: &[(&str, &str)] = &[
    ("calories", "nutrient-calories-energy"),
    ("protein_g", "nutrient-protein"),
    ("total_fat_g", "nutrient-total-fat"),
    ("saturated_fat_g", "nutrient-saturated-fat"),
    ("trans_fat_g", "nutrient-trans-fat"),
    ("polyunsaturated_fat_g", "nutrient-polyunsaturated-fat"),
    ("monounsaturated_fat_g", "nutrient-monounsaturated-fat"),
    ("cholesterol_mg", "nutrient-cholesterol"),
    ("sodium_mg", "nutrient-sodium"),
    ("total_carbs_g", "nutrient-total-carbohydrates"),
    ("dietary_fiber_g", "nutrient-dietary-fiber"),
    ("total_sugars_g", "nutrient-total-sugars"),
    ("vitamin_a_mcg", "nutrient-vitamin-a-rae"),
    ("vitamin_c_mg", "nutrient-vitamin-c-ascorbic-acid"),
    ("vitamin_d_mcg", "nutrient-vitamin-d"),
    ("calcium_mg", "nutrient-calcium"),
    ("iron_mg", "nutrient-iron"),
    ("potassium_mg", "nutrient-potassium"),
];

/// Score assigned when neither the LLM nor an expected vector is available.
const NEUTRAL_FALLBACK_SCORE: f32 = 70.0;

pub type NutrientVector = BTreeMap<String, f64>;

/// Derive the basic nutrient vector from a canonical row. Kilojoule energy is
/// already converted by the normalizer.
pub fn extract_basic_nutrients(data: &NutritionData) -> NutrientVector {
    let mut nutrients = NutrientVector::new();
    for (key, nutrient_id) in BASIC_VECTOR_IDS {
        if let Some(Some(value)) = data.standardized_nutrients.get(*nutrient_id) {
            nutrients.insert(key.to_string(), value.amount);
        }
    }
    if let Some(fat) = nutrients.get("total_fat_g").copied() {
        nutrients.insert("calories_from_fat".to_string(), fat * 9.0);
    }
    nutrients
}

/// Weighted per-nutrient relative-difference similarity in [0,100].
/// Both zero is a perfect match for that nutrient; one-sided zero scores 0.2;
/// a value missing on one side contributes 0.3 of its weight.
pub fn weighted_similarity(expected: &NutrientVector, actual: &NutrientVector) -> (f32, String) {
    if expected.is_empty() || actual.is_empty() {
        return (0.0, "Missing nutritional data for comparison".to_string());
    }

    let mut total_weight = 0.0;
    let mut weighted_score = 0.0;
    let mut differences: Vec<String> = Vec::new();

    for (nutrient, weight) in NUTRIENT_WEIGHTS {
        let expected_value = expected.get(*nutrient).copied();
        let actual_value = actual.get(*nutrient).copied();

        let (expected_value, actual_value) = match (expected_value, actual_value) {
            (None, None) => continue,
            (Some(_), None) | (None, Some(_)) => {
                weighted_score += weight * 0.3;
                total_weight += weight;
                differences.push(format!("{}: missing in one", nutrient));
                continue;
            }
            (Some(e), Some(a)) => (e, a),
        };

        let similarity = if expected_value == 0.0 && actual_value == 0.0 {
            1.0
        } else if expected_value == 0.0 || actual_value == 0.0 {
            0.2
        } else {
            let diff = (expected_value - actual_value).abs();
            let avg = (expected_value + actual_value) / 2.0;
            let relative_diff = diff / avg;
            if relative_diff > 0.3 {
                differences.push(format!("{}: {:.1}% diff", nutrient, relative_diff * 100.0));
            }
            (1.0 - relative_diff.min(2.0)).max(0.0)
        };

        weighted_score += weight * similarity;
        total_weight += weight;
    }

    if total_weight == 0.0 {
        return (0.0, "No comparable nutrients found".to_string());
    }

    let final_score = ((weighted_score / total_weight) * 100.0) as f32;
    let mut reasoning = format!("Similarity: {:.1}%", final_score);
    if !differences.is_empty() {
        reasoning.push_str(&format!(
            ". Notable differences: {}",
            differences
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    (final_score, reasoning)
}

#[derive(Debug, Deserialize)]
struct SimilarityVerdict {
    #[serde(deserialize_with = "crate::semantic::lenient_i64")]
    fdc_id: i64,
    #[serde(default)]
    nutritional_similarity_score: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    key_differences: Vec<String>,
}

/// Gate comparing expected macro/micronutrient ranges for the ingredient
/// against each candidate's realized profile. The LLM does the heavy
/// reasoning; the weighted heuristic covers LLM outages.
pub struct NutritionalGate {
    provider: Option<Provider>,
    pub llm_calls: u64,
}

impl NutritionalGate {
    pub fn new(provider: Option<Provider>) -> Self {
        Self {
            provider,
            llm_calls: 0,
        }
    }

    /// Score up to `top_n` semantically accepted candidates. Returns
    /// annotated candidates sorted by nutritional score descending; detail
    /// fetch failures simply drop the candidate from the comparison.
    pub async fn score(
        &mut self,
        ingredient: &str,
        candidates: &[Candidate],
        client: &FdcClient,
        normalizer: &NutrientNormalizer,
        top_n: usize,
    ) -> Vec<Candidate> {
        let mut with_nutrients: Vec<(Candidate, NutrientVector)> = Vec::new();
        for candidate in candidates.iter().take(top_n) {
            let Some(details) = client.get_details(candidate.fdc_id).await else {
                continue;
            };
            let data = normalizer.normalize(&details);
            with_nutrients.push((candidate.clone(), extract_basic_nutrients(&data)));
        }

        if with_nutrients.is_empty() {
            return Vec::new();
        }

        let expected = self.expected_nutrition(ingredient).await;

        let scored = match self.provider.clone() {
            Some(provider) => {
                match self
                    .llm_similarity(&provider, ingredient, &with_nutrients, expected.as_ref(), top_n)
                    .await
                {
                    Some(scored) => scored,
                    None => heuristic_similarity(with_nutrients, expected.as_ref()),
                }
            }
            None => heuristic_similarity(with_nutrients, expected.as_ref()),
        };

        let mut scored = scored;
        scored.sort_by(|a, b| {
            b.nutritional_score
                .unwrap_or(0.0)
                .partial_cmp(&a.nutritional_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored
    }

    /// Typical per-100g values for the ingredient, from the LLM's world
    /// knowledge. `None` when the LLM is unavailable or answers garbage.
    async fn expected_nutrition(&mut self, ingredient: &str) -> Option<NutrientVector> {
        let provider = self.provider.clone()?;
        let prompt = format!(
            r#"You are a nutrition expert. Research and provide typical nutritional values for "{ingredient}" per 100g.

Consider:
- Common form (raw, cooked, etc.)
- Typical variety/type
- Standard preparation

Return JSON with nutritional values (use null if not applicable):
{{
    "calories": <kcal>,
    "protein_g": <g>,
    "total_fat_g": <g>,
    "saturated_fat_g": <g>,
    "total_carbs_g": <g>,
    "dietary_fiber_g": <g>,
    "total_sugars_g": <g>,
    "sodium_mg": <mg>,
    "calcium_mg": <mg>,
    "iron_mg": <mg>,
    "vitamin_a_mcg": <mcg>,
    "vitamin_c_mg": <mg>,
    "vitamin_d_mcg": <mcg>,
    "potassium_mg": <mg>
}}

Use typical published values. Return only valid JSON."#
        );

        let request = ChatCompletionRequest {
            model: provider.model().to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You are a helpful assistant that returns only valid JSON."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            response_format: None,
            temperature: Some(0.2),
            max_tokens: None,
        };

        self.llm_calls += 1;
        let content = match provider.chat_text(request).await {
            Ok(content) => content,
            Err(e) => {
                println!("  Error getting expected nutrition: {}", e);
                return None;
            }
        };

        parse_nutrient_vector(&content)
    }

    async fn llm_similarity(
        &mut self,
        provider: &Provider,
        ingredient: &str,
        candidates: &[(Candidate, NutrientVector)],
        expected: Option<&NutrientVector>,
        top_n: usize,
    ) -> Option<Vec<Candidate>> {
        let expected_text = expected
            .map(|e| {
                let pairs: Vec<String> =
                    e.iter().map(|(k, v)| format!("{}: {:.2}", k, v)).collect();
                format!(
                    "\nEXPECTED VALUES for '{}' (per 100g): {}\n",
                    ingredient,
                    pairs.join(", ")
                )
            })
            .unwrap_or_default();

        let mut nutrients_text = String::new();
        for (i, (candidate, nutrients)) in candidates.iter().enumerate() {
            let pairs: Vec<String> = nutrients
                .iter()
                .map(|(k, v)| format!("{}: {:.2}", k, v))
                .collect();
            nutrients_text.push_str(&format!(
                "{}. {} (FDC {}): {}\n",
                i + 1,
                candidate.description,
                candidate.fdc_id,
                pairs.join(", ")
            ));
        }

        let prompt = format!(
            r#"You are a nutrition expert. Analyze nutritional similarity between an ingredient and USDA food results.

INGREDIENT: "{ingredient}"
{expected_text}
USDA FOOD RESULTS WITH NUTRITIONAL VALUES (per 100g):
{nutrients_text}
TASK:
1. Compare each USDA result's nutritional profile with expected values for "{ingredient}"
2. Calculate similarity scores (0-100) based on:
   - Core macronutrients (calories, protein, carbs, fat) - HIGH WEIGHT (40%)
   - Key vitamins/minerals (vitamin A, C, D, calcium, iron, potassium) - MEDIUM WEIGHT (30%)
   - Other nutrients - LOWER WEIGHT (30%)
3. Consider acceptable variations (e.g., raw vs cooked, different varieties)
4. Analyze each nutrient difference and its significance

Return JSON array with:
{{
    "rank": 1-{top_n},
    "fdc_id": <FDC ID>,
    "nutritional_similarity_score": 0-100,
    "reasoning": "<explanation of the nutritional comparison covering each significant nutrient difference>",
    "key_differences": ["<nutrient1>: <difference>", "<nutrient2>: <difference>"]
}}

Only include results where nutritional_similarity_score >= 50."#
        );

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
            temperature: Some(0.2),
            max_tokens: None,
        };

        self.llm_calls += 1;
        let content = match provider.chat_text(request).await {
            Ok(content) => content,
            Err(e) => {
                println!("  LLM nutritional similarity error: {}", e);
                return None;
            }
        };

        let verdicts: Vec<SimilarityVerdict> =
            match serde_json::from_str::<Vec<SimilarityVerdict>>(&content) {
                Ok(verdicts) => verdicts,
                Err(e) => match serde_json::from_str::<SimilarityVerdict>(&content) {
                    Ok(verdict) => vec![verdict],
                    Err(_) => {
                        println!("  Failed to parse nutritional similarity response: {}", e);
                        return None;
                    }
                },
            };

        let mut scored = Vec::new();
        for verdict in verdicts {
            if let Some((candidate, _)) = candidates
                .iter()
                .find(|(c, _)| c.fdc_id == verdict.fdc_id)
            {
                let mut annotated = candidate.clone();
                annotated.nutritional_score = Some(verdict.nutritional_similarity_score);
                annotated.nutritional_reasoning = Some(verdict.reasoning);
                annotated.key_differences = verdict.key_differences;
                scored.push(annotated);
            }
        }
        Some(scored)
    }
}

/// LLM-free scoring: the weighted relative-difference heuristic when an
/// expected vector exists, a neutral score otherwise.
fn heuristic_similarity(
    candidates: Vec<(Candidate, NutrientVector)>,
    expected: Option<&NutrientVector>,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .map(|(mut candidate, nutrients)| {
            match expected {
                Some(expected) => {
                    let (score, reasoning) = weighted_similarity(expected, &nutrients);
                    candidate.nutritional_score = Some(score);
                    candidate.nutritional_reasoning = Some(reasoning);
                }
                None => {
                    candidate.nutritional_score = Some(NEUTRAL_FALLBACK_SCORE);
                    candidate.nutritional_reasoning =
                        Some("Basic similarity calculation (LLM unavailable)".to_string());
                }
            }
            candidate
        })
        .collect()
}

fn parse_nutrient_vector(content: &str) -> Option<NutrientVector> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let object = value.as_object()?;
    let mut vector = NutrientVector::new();
    for (key, value) in object {
        if let Some(number) = value.as_f64() {
            vector.insert(key.clone(), number);
        }
    }
    if vector.is_empty() {
        None
    } else {
        Some(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::FoodDetails;
    use crate::nutrients::NutrientNormalizer;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn vector(pairs: &[(&str, f64)]) -> NutrientVector {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_identical_vectors_score_100() {
        let v = vector(&[("calories", 61.0), ("protein_g", 3.3), ("total_fat_g", 3.2)]);
        let (score, _) = weighted_similarity(&v, &v.clone());
        assert_eq!(score, 100.0);
    }

    #[test]
    fn test_empty_vectors_score_0() {
        let v = vector(&[("calories", 61.0)]);
        let (score, reasoning) = weighted_similarity(&v, &NutrientVector::new());
        assert_eq!(score, 0.0);
        assert!(reasoning.contains("Missing nutritional data"));
    }

    #[test]
    fn test_both_zero_is_perfect_one_zero_is_poor() {
        let expected = vector(&[("sodium_mg", 0.0), ("calories", 50.0)]);
        let both_zero = vector(&[("sodium_mg", 0.0), ("calories", 50.0)]);
        let one_zero = vector(&[("sodium_mg", 400.0), ("calories", 50.0)]);
        let (perfect, _) = weighted_similarity(&expected, &both_zero);
        let (poor, _) = weighted_similarity(&expected, &one_zero);
        assert_eq!(perfect, 100.0);
        assert!(poor < perfect);
    }

    #[test]
    fn test_missing_nutrient_contributes_partial_weight() {
        let expected = vector(&[("calories", 61.0), ("protein_g", 3.3)]);
        let actual = vector(&[("calories", 61.0)]);
        let (score, reasoning) = weighted_similarity(&expected, &actual);
        assert!(score < 100.0 && score > 0.0);
        assert!(reasoning.contains("protein_g: missing in one"));
    }

    #[test]
    fn test_large_difference_reported() {
        let expected = vector(&[("calories", 61.0)]);
        let actual = vector(&[("calories", 400.0)]);
        let (score, reasoning) = weighted_similarity(&expected, &actual);
        assert!(score < 50.0);
        assert!(reasoning.contains("calories"));
    }

    #[test]
    fn test_extract_basic_nutrients_with_derived_fat_calories() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "id,nutrient_name,category,subcategory,unit_name,unit_abbreviation")?;
        writeln!(file, "nutrient-calories-energy,Calories,Macronutrients,Energy,kilocalorie,kcal")?;
        writeln!(file, "nutrient-total-fat,Total Fat,Macronutrients,Fats,gram,g")?;
        writeln!(file, "nutrient-protein,Protein,Macronutrients,Protein,gram,g")?;
        file.flush()?;
        let normalizer = NutrientNormalizer::load(file.path())?;

        let details: FoodDetails = serde_json::from_value(serde_json::json!({
            "fdcId": 746782,
            "description": "Milk, whole",
            "dataType": "Foundation",
            "foodNutrients": [
                {"nutrient": {"name": "Energy", "unitName": "kcal"}, "amount": 61.0},
                {"nutrient": {"name": "Total lipid (fat)", "unitName": "g"}, "amount": 3.2}
            ]
        }))?;

        let nutrients = extract_basic_nutrients(&normalizer.normalize(&details));
        assert_eq!(nutrients.get("calories"), Some(&61.0));
        assert_eq!(nutrients.get("total_fat_g"), Some(&3.2));
        assert!((nutrients.get("calories_from_fat").unwrap() - 28.8).abs() < 1e-9);
        assert!(!nutrients.contains_key("protein_g"));
        Ok(())
    }

    #[test]
    fn test_parse_nutrient_vector_skips_nulls_and_strings() {
        let content = r#"{"calories": 52, "protein_g": null, "notes": "typical raw apple", "total_carbs_g": 13.8}"#;
        let vector = parse_nutrient_vector(content).unwrap();
        assert_eq!(vector.get("calories"), Some(&52.0));
        assert_eq!(vector.get("total_carbs_g"), Some(&13.8));
        assert!(!vector.contains_key("protein_g"));
        assert!(!vector.contains_key("notes"));
    }

    #[test]
    fn test_heuristic_without_expected_is_neutral() {
        let candidate = Candidate {
            fdc_id: 1,
            description: "Spices, cinnamon, ground".to_string(),
            data_type: "SR Legacy".to_string(),
            food_category: String::new(),
            search_tier: 1,
            relevance_score: 0.0,
            semantic_score: Some(85.0),
            semantic_reasoning: None,
            nutritional_score: None,
            nutritional_reasoning: None,
            key_differences: Vec::new(),
        };
        let scored = heuristic_similarity(vec![(candidate, NutrientVector::new())], None);
        assert_eq!(scored[0].nutritional_score, Some(70.0));
        // Semantic annotation is preserved through the gate.
        assert_eq!(scored[0].semantic_score, Some(85.0));
    }
}
