use crate::intent::SearchIntent;

/// Query variants for items the catalog names differently than cooks do.
const QUERY_VARIANTS: &[(&str, &[&str])] = &[
    ("tzatziki", &["tzatziki", "tzatziki dip", "tzatziki sauce"]),
    ("guacamole", &["guacamole", "guacamole nfs", "avocado guacamole"]),
    ("chutney", &["chutney", "chutney nfs", "mango chutney"]),
    ("brandy", &["brandy", "brandy distilled", "alcoholic beverage brandy"]),
    ("sorbet", &["sorbet", "sorbet frozen", "fruit sorbet"]),
    ("gelato", &["gelato", "gelato ice cream", "italian gelato"]),
];

const RETRY_MODIFIERS: &[&str] = &["raw", "fresh", "dried", "whole"];

/// Category prefixes for the optional third attempt.
const CATEGORY_MAP: &[(&str, &str)] = &[
    ("rice", "grain"),
    ("lentil", "legume"),
    ("pepper", "spice"),
    ("cheese", "dairy"),
    ("oil", "fat"),
    ("vinegar", "condiment"),
    ("herb", "spice"),
    ("spice", "spice"),
];

/// Produce an alternative query plan for a retry attempt. Deterministic:
/// attempt 2 mutates the query (variant dictionary, word-order reversal or
/// plural toggle, modifier, head noun); attempt 3 injects a category prefix.
/// A query already used is replaced by the ingredient's last word.
pub fn generate_retry_strategy(
    ingredient: &str,
    attempt: u32,
    previous_queries: &[String],
    base_intent: Option<SearchIntent>,
) -> SearchIntent {
    let mut intent = base_intent.unwrap_or_else(|| SearchIntent::fallback(ingredient));
    let ingredient_lower = ingredient.to_lowercase();
    let words: Vec<&str> = ingredient_lower.split_whitespace().collect();

    match attempt {
        2 => {
            if let Some((query, reason)) =
                variant_query(&ingredient_lower, previous_queries)
            {
                intent.search_query = query;
                intent.retry_reason = Some(reason);
            } else if words.len() > 1 {
                let reversed: Vec<&str> = words.iter().rev().copied().collect();
                intent.search_query = reversed.join(" ");
                intent.retry_reason =
                    Some(format!("Attempt {}: Reversing word order", attempt));
            } else if let Some(word) = words.first() {
                intent.search_query = toggle_plural(word);
                intent.retry_reason = Some(format!(
                    "Attempt {}: Trying singular/plural variation",
                    attempt
                ));
            }

            if intent.retry_reason.is_none() || previous_queries.contains(&intent.search_query) {
                if let Some((query, reason)) =
                    modifier_query(&intent.search_query, attempt, previous_queries)
                {
                    intent.search_query = query;
                    intent.retry_reason = Some(reason);
                } else {
                    intent.search_query = words.first().unwrap_or(&ingredient).to_string();
                    intent.retry_reason =
                        Some(format!("Attempt {}: Simplifying query", attempt));
                }
            }
        }
        3 => {
            let category_hit = words.iter().find_map(|word| {
                CATEGORY_MAP
                    .iter()
                    .find(|(key, _)| word.contains(key))
                    .map(|(_, category)| (word, category))
            });
            match category_hit {
                Some((word, category)) => {
                    intent.search_query = format!("{} {}", category, word);
                    intent.retry_reason = Some(format!(
                        "Attempt {}: Category-based search ({})",
                        attempt, category
                    ));
                }
                None => {
                    intent.search_query = words.first().unwrap_or(&ingredient).to_string();
                    intent.retry_reason =
                        Some(format!("Attempt {}: Minimal query (last resort)", attempt));
                }
            }
        }
        _ => {}
    }

    if previous_queries.contains(&intent.search_query) {
        intent.search_query = words
            .last()
            .map(|w| w.to_string())
            .unwrap_or_else(|| ingredient.to_string());
        if previous_queries.contains(&intent.search_query) {
            intent.search_query = ingredient.to_string();
        }
    }

    intent
}

fn variant_query(ingredient_lower: &str, previous_queries: &[String]) -> Option<(String, String)> {
    for (key, variants) in QUERY_VARIANTS {
        if !ingredient_lower.contains(key) {
            continue;
        }
        for variant in *variants {
            if !previous_queries.iter().any(|q| q == variant) {
                return Some((
                    variant.to_string(),
                    format!("Attempt 2: Trying variation '{}'", variant),
                ));
            }
        }
    }
    None
}

fn modifier_query(
    base_query: &str,
    attempt: u32,
    previous_queries: &[String],
) -> Option<(String, String)> {
    let base_lower = base_query.to_lowercase();
    for modifier in RETRY_MODIFIERS {
        if base_lower.contains(modifier) {
            continue;
        }
        let query = format!("{} {}", base_query, modifier);
        if !previous_queries.contains(&query) {
            return Some((
                query,
                format!("Attempt {}: Adding modifier '{}'", attempt, modifier),
            ));
        }
    }
    None
}

fn toggle_plural(word: &str) -> String {
    match word.strip_suffix('s') {
        Some(stem) => stem.to_string(),
        None => format!("{}s", word),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tzatziki_retries_with_dip_variant() {
        let previous = vec!["tzatziki".to_string()];
        let intent = generate_retry_strategy("tzatziki", 2, &previous, None);
        assert_eq!(intent.search_query, "tzatziki dip");
        assert!(intent.retry_reason.as_deref().unwrap().contains("variation"));
    }

    #[test]
    fn test_variant_skips_already_used_queries() {
        let previous = vec!["tzatziki".to_string(), "tzatziki dip".to_string()];
        let intent = generate_retry_strategy("tzatziki", 2, &previous, None);
        assert_eq!(intent.search_query, "tzatziki sauce");
    }

    #[test]
    fn test_multi_word_reverses_order() {
        let previous = vec!["jasmine rice".to_string()];
        let intent = generate_retry_strategy("jasmine rice", 2, &previous, None);
        assert_eq!(intent.search_query, "rice jasmine");
        assert!(intent
            .retry_reason
            .as_deref()
            .unwrap()
            .contains("Reversing word order"));
    }

    #[test]
    fn test_single_word_toggles_plural() {
        let previous = vec!["shallot".to_string()];
        let intent = generate_retry_strategy("shallot", 2, &previous, None);
        assert_eq!(intent.search_query, "shallots");

        let previous = vec!["radishes".to_string()];
        let intent = generate_retry_strategy("radishes", 2, &previous, None);
        assert_eq!(intent.search_query, "radishe");
    }

    #[test]
    fn test_repeated_query_replaced_by_last_word() {
        // Reversal of a palindrome-ordered query collides with the previous
        // one, so the strategy falls through to a modifier.
        let previous = vec!["rice jasmine".to_string(), "jasmine rice".to_string()];
        let intent = generate_retry_strategy("jasmine rice", 2, &previous, None);
        assert_ne!(intent.search_query, "rice jasmine");
        assert_ne!(intent.search_query, "jasmine rice");
    }

    #[test]
    fn test_attempt_3_injects_category() {
        let intent = generate_retry_strategy("black pepper", 3, &[], None);
        assert_eq!(intent.search_query, "spice pepper");
        assert!(intent
            .retry_reason
            .as_deref()
            .unwrap()
            .contains("Category-based"));
    }

    #[test]
    fn test_attempt_3_without_category_uses_first_word() {
        let intent = generate_retry_strategy("dragon fruit puree", 3, &[], None);
        assert_eq!(intent.search_query, "dragon");
    }

    #[test]
    fn test_retry_reason_always_recorded() {
        for attempt in [2, 3] {
            let intent = generate_retry_strategy("smoked paprika", attempt, &[], None);
            assert!(intent.retry_reason.is_some(), "attempt {}", attempt);
        }
    }

    #[test]
    fn test_base_intent_fields_survive_mutation() {
        let base = SearchIntent {
            search_query: "paprika smoked".to_string(),
            is_phrase: true,
            preferred_form: "ground".to_string(),
            avoid: vec!["bell".to_string()],
            expected_pattern: "Spices, paprika".to_string(),
            retry_reason: None,
        };
        let intent = generate_retry_strategy("smoked paprika", 2, &[], Some(base));
        assert_eq!(intent.preferred_form, "ground");
        assert_eq!(intent.avoid, vec!["bell".to_string()]);
        assert_eq!(intent.search_query, "paprika smoked");
    }
}
