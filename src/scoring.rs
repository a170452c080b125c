use std::collections::HashSet;

use crate::catalog::types::Candidate;
use crate::intent::SearchIntent;

/// Descriptions starting with (or containing) one of these usually name a
/// prepared food made WITH the ingredient rather than the ingredient itself.
const COMPOUND_INDICATORS: &[&str] = &[
    "cheese", "crackers", "bread", "cookies", "cake", "soup", "sauce", "dressing", "cereal",
    "bar", "drink", "juice", "spread", "butter", "yogurt",
];

/// Preservation/process forms penalized unless the query asked for one.
const PROCESSED_FORMS: &[&str] = &[
    "dry",
    "powdered",
    "powder",
    "dehydrated",
    "canned",
    "frozen",
    "concentrated",
    "evaporated",
    "condensed",
];

/// Ceiling used to invert the relevance score into a penalty.
const MAX_RELEVANCE_SCORE: f32 = 2000.0;

/// Deterministic relevance score, higher is better (typically 200-2000).
/// A pure function of the candidate, the query, and the candidate's position
/// in its originating tier's results.
pub fn score_relevance(candidate: &Candidate, query: &str, position: usize) -> f32 {
    let description = candidate.description.to_lowercase();
    let query_lower = query.to_lowercase();
    let query_words: HashSet<&str> = query_lower.split_whitespace().collect();

    let mut score = 1000.0_f32;

    // The API orders by its own relevance, so earlier is better.
    score -= position as f32 * 10.0;

    if description == query_lower {
        score += 500.0;
    } else if description.starts_with(&query_lower) {
        score += 300.0;
    }

    // For multi-word queries the last word is usually the main ingredient:
    // "Milk, whole" is a good hit for "whole milk".
    let main_ingredient = query_lower.split_whitespace().last().unwrap_or("");
    if !main_ingredient.is_empty() && description.starts_with(main_ingredient) {
        score += 250.0;
        if description.contains(&query_lower) {
            score += 100.0;
        }
    } else if description.contains(&query_lower) {
        score += 200.0;
    }

    let desc_words: HashSet<&str> = description
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect();
    let matching_count = query_words.intersection(&desc_words).count();
    if matching_count > 0 {
        if matching_count == query_words.len() {
            score += 150.0;
        } else {
            score += matching_count as f32 * 30.0;
        }
    }

    let query_word_count = query_words.len();
    let desc_word_list: Vec<&str> = description
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect();

    if query_word_count <= 2 {
        let first_word = desc_word_list.first().copied().unwrap_or("");
        if COMPOUND_INDICATORS.contains(&first_word) {
            score -= 800.0;
        } else if COMPOUND_INDICATORS
            .iter()
            .any(|ind| description.contains(ind))
        {
            score -= 500.0;
        }

        if !PROCESSED_FORMS.iter().any(|form| query_lower.contains(form))
            && PROCESSED_FORMS.iter().any(|form| description.contains(form))
        {
            score -= 300.0;
        }

        if desc_word_list.len() > query_word_count + 1 {
            score -= 150.0;
        }
    }

    score += match candidate.data_type.as_str() {
        "Foundation" => 100.0,
        "SR Legacy" => 50.0,
        "Survey (FNDDS)" => 25.0,
        "Branded" => -50.0,
        _ => 0.0,
    };

    let food_category = candidate.food_category.to_lowercase();
    if query_lower.contains("milk") && food_category.contains("dairy") {
        score += 50.0;
    }
    if query_lower.contains("fruit") && food_category.contains("fruit") {
        score += 50.0;
    }

    score
}

/// Inverted, lower-is-better form of the relevance score, with the search
/// intent's avoid words applied as heavy penalties. Data-type rank
/// (Foundation 0, SR Legacy 1, others 2) is returned for tie breaking.
pub fn score_match_penalty(
    candidate: &Candidate,
    ingredient: &str,
    position: usize,
    intent: Option<&SearchIntent>,
) -> (i32, i32) {
    let relevance = score_relevance(candidate, ingredient, position);
    let mut penalty = (MAX_RELEVANCE_SCORE - relevance) as i32;

    if let Some(intent) = intent {
        penalty += avoid_word_penalty(&candidate.description, ingredient, &intent.avoid);
    }

    let type_rank = match candidate.data_type.as_str() {
        "Foundation" => 0,
        "SR Legacy" => 1,
        _ => 2,
    };

    (penalty, type_rank)
}

/// +200 per avoid word that appears in the first three description tokens
/// without an ingredient word ahead of it. An avoid word preceded by an
/// ingredient word is a modifier ("Onions, yellow") and stays unpenalized.
fn avoid_word_penalty(description: &str, ingredient: &str, avoid: &[String]) -> i32 {
    let description_lower = description.to_lowercase();
    let ingredient_lower = ingredient.to_lowercase();
    let ingredient_words: Vec<&str> = ingredient_lower.split_whitespace().collect();

    let first_3_words: Vec<String> = description_lower
        .split_whitespace()
        .take(3)
        .map(|w| w.trim_end_matches(',').to_string())
        .collect();

    let mut penalty = 0;
    for avoid_word in avoid {
        if avoid_word.len() < 3 {
            continue;
        }
        let avoid_lower = avoid_word.to_lowercase();
        if !description_lower.contains(&avoid_lower) {
            continue;
        }
        let Some(avoid_pos) = first_3_words.iter().position(|w| *w == avoid_lower) else {
            continue;
        };

        let ingredient_in_first_3 = first_3_words
            .iter()
            .any(|w| ingredient_words.contains(&w.as_str()));
        let first_ingredient_pos = first_3_words
            .iter()
            .position(|w| ingredient_words.iter().any(|ing| w.contains(ing)));

        let ingredient_before_avoid = first_ingredient_pos.is_some_and(|pos| pos < avoid_pos);
        if !ingredient_before_avoid && !ingredient_in_first_3 {
            penalty += 200;
        }
    }

    penalty
}

/// Score and filter candidates against the ingredient, keeping only those
/// below the acceptability threshold, sorted best first.
pub fn filter_search_results<'a>(
    candidates: &'a [Candidate],
    ingredient: &str,
    max_score: i32,
    intent: Option<&SearchIntent>,
) -> Vec<(i32, &'a Candidate)> {
    let mut scored: Vec<(i32, i32, &Candidate)> = Vec::new();
    // Penalties live on an inverted scale, so the acceptability knob has to be
    // converted: good matches land around 0-500, poor ones 1500-2000.
    let threshold = (MAX_RELEVANCE_SCORE as i32 - max_score * 20).max(1500);

    for (idx, candidate) in candidates.iter().enumerate() {
        let (penalty, type_rank) = score_match_penalty(candidate, ingredient, idx, intent);
        if penalty < threshold {
            scored.push((penalty, type_rank, candidate));
        }
    }

    scored.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    scored.into_iter().map(|(p, _, c)| (p, c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(description: &str, data_type: &str, category: &str) -> Candidate {
        Candidate {
            fdc_id: 1,
            description: description.to_string(),
            data_type: data_type.to_string(),
            food_category: category.to_string(),
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
    fn test_exact_match_beats_compound_food() {
        let exact = candidate("milk", "Foundation", "Dairy and Egg Products");
        let compound = candidate("Cheese, cheddar", "Foundation", "Dairy and Egg Products");
        let exact_score = score_relevance(&exact, "milk", 0);
        let compound_score = score_relevance(&compound, "milk", 0);
        assert!(exact_score > compound_score);
        // Leading compound indicator costs 800 on a one-word query.
        assert!(compound_score < 1000.0);
    }

    #[test]
    fn test_head_word_bonus_for_reordered_query() {
        let reordered = candidate("Milk, whole", "Foundation", "Dairy and Egg Products");
        let unrelated = candidate("Bread, whole wheat", "Foundation", "Baked Products");
        assert!(
            score_relevance(&reordered, "whole milk", 0) > score_relevance(&unrelated, "whole milk", 0)
        );
    }

    #[test]
    fn test_processed_form_penalized_unless_requested() {
        let fresh = candidate("Milk, whole", "SR Legacy", "");
        let powdered = candidate("Milk, dry, powdered", "SR Legacy", "");
        assert!(score_relevance(&fresh, "milk", 0) > score_relevance(&powdered, "milk", 0));
        // When the query asks for the processed form there is no penalty.
        assert!(
            score_relevance(&powdered, "powdered milk", 0) > score_relevance(&powdered, "milk", 0)
        );
    }

    #[test]
    fn test_position_penalty() {
        let c = candidate("Rice, white, jasmine", "SR Legacy", "");
        let at_front = score_relevance(&c, "jasmine rice", 0);
        let at_back = score_relevance(&c, "jasmine rice", 10);
        assert_eq!(at_front - at_back, 100.0);
    }

    #[test]
    fn test_data_type_bias_ordering() {
        let desc = "Rice, white, jasmine";
        let foundation = score_relevance(&candidate(desc, "Foundation", ""), "jasmine rice", 0);
        let legacy = score_relevance(&candidate(desc, "SR Legacy", ""), "jasmine rice", 0);
        let survey = score_relevance(&candidate(desc, "Survey (FNDDS)", ""), "jasmine rice", 0);
        let branded = score_relevance(&candidate(desc, "Branded", ""), "jasmine rice", 0);
        assert!(foundation > legacy && legacy > survey && survey > branded);
    }

    #[test]
    fn test_score_is_pure() {
        let c = candidate("Spices, paprika", "SR Legacy", "Spices and Herbs");
        let first = score_relevance(&c, "smoked paprika", 2);
        let second = score_relevance(&c, "smoked paprika", 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_avoid_word_penalty_applied() {
        let wrong = candidate("Beans, cannellini", "SR Legacy", "Legumes and Legume Products");
        let intent = SearchIntent {
            search_query: "vanilla bean".to_string(),
            is_phrase: true,
            preferred_form: "whole".to_string(),
            avoid: vec!["beans".to_string()],
            expected_pattern: "Vanilla extract".to_string(),
            retry_reason: None,
        };
        let (with_intent, _) = score_match_penalty(&wrong, "vanilla bean", 0, Some(&intent));
        let (without_intent, _) = score_match_penalty(&wrong, "vanilla bean", 0, None);
        assert_eq!(with_intent - without_intent, 200);
    }

    #[test]
    fn test_avoid_word_after_ingredient_is_modifier() {
        // "Onions, yellow" with avoid ["yellow"] stays unpenalized because
        // the ingredient word comes first.
        let valid = candidate("Onions, yellow", "SR Legacy", "Vegetables");
        let intent = SearchIntent {
            search_query: "onions raw".to_string(),
            is_phrase: false,
            preferred_form: "raw".to_string(),
            avoid: vec!["yellow".to_string()],
            expected_pattern: String::new(),
            retry_reason: None,
        };
        let (with_intent, _) = score_match_penalty(&valid, "onions", 0, Some(&intent));
        let (without_intent, _) = score_match_penalty(&valid, "onions", 0, None);
        assert_eq!(with_intent, without_intent);
    }

    #[test]
    fn test_filter_drops_poor_matches() {
        let candidates = vec![
            candidate("Milk, whole", "Foundation", "Dairy and Egg Products"),
            candidate("Crackers, cheese, sandwich-type", "Branded", "Snacks"),
        ];
        let kept = filter_search_results(&candidates, "milk", 50, None);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].1.description, "Milk, whole");
    }

    #[test]
    fn test_filter_sorts_best_first() {
        let candidates = vec![
            candidate("Milk, reduced fat, fluid, 2% milkfat", "SR Legacy", "Dairy and Egg Products"),
            candidate("Milk, whole", "Foundation", "Dairy and Egg Products"),
        ];
        let kept = filter_search_results(&candidates, "milk", 50, None);
        assert!(kept.len() >= 2);
        assert_eq!(kept[0].1.description, "Milk, whole");
    }
}
