use std::collections::HashSet;

use super::client::FdcClient;
use super::types::{Candidate, SearchFood};
use crate::scoring::score_relevance;

/// Per-tier data-type filters and page sizes. Every tier is always searched
/// so Survey items ("Tzatziki dip", "Guacamole, NFS") and Branded products
/// for rare ingredients are never missed.
const TIERS: &[(u8, Option<&str>, u32)] = &[
    (1, Some("Foundation,SR Legacy"), 30),
    (2, Some("Survey (FNDDS)"), 20),
    (3, Some("Branded"), 20),
    (4, None, 10),
];

const MAX_FUSED_RESULTS: usize = 80;

/// Comprehensive 4-tier search: Foundation/SR Legacy (30) + Survey (20) +
/// Branded (20) + unfiltered (10), merged and deduplicated by FDC ID in tier
/// order. When the original ingredient is supplied the fused set is re-ranked
/// by relevance; otherwise it keeps (tier, fdc_id) order. At most 80 results.
///
/// The four searches run concurrently; the client's shared rate limiter keeps
/// them within the inter-request delay, and the merge (not arrival order)
/// establishes the ordering guarantees.
pub async fn search_multi_tier_comprehensive(
    client: &FdcClient,
    query: &str,
    ingredient: Option<&str>,
) -> Vec<Candidate> {
    let (tier1, tier2, tier3, tier4) = tokio::join!(
        client.search(query, TIERS[0].2, TIERS[0].1),
        client.search(query, TIERS[1].2, TIERS[1].1),
        client.search(query, TIERS[2].2, TIERS[2].1),
        client.search(query, TIERS[3].2, TIERS[3].1),
    );

    let merged = merge_tier_results(vec![(1, tier1), (2, tier2), (3, tier3), (4, tier4)]);
    rank_candidates(merged, ingredient)
}

/// Merge tier result lists in tier order, keeping the first occurrence of
/// each FDC ID and tagging each candidate with its discovering tier.
pub fn merge_tier_results(tiers: Vec<(u8, Vec<SearchFood>)>) -> Vec<Candidate> {
    let mut seen_fdc_ids = HashSet::new();
    let mut merged = Vec::new();

    for (tier, foods) in tiers {
        for food in foods {
            if seen_fdc_ids.insert(food.fdc_id) {
                merged.push(Candidate::from_search(food, tier));
            }
        }
    }

    merged
}

/// Rank the fused set: by relevance (descending) when the ingredient is
/// known, by (tier, fdc_id) otherwise. Truncates to the fused-result cap.
pub fn rank_candidates(mut candidates: Vec<Candidate>, ingredient: Option<&str>) -> Vec<Candidate> {
    match ingredient {
        Some(ingredient) => {
            for (position, candidate) in candidates.iter_mut().enumerate() {
                candidate.relevance_score = score_relevance(candidate, ingredient, position);
            }
            candidates.sort_by(|a, b| {
                b.relevance_score
                    .partial_cmp(&a.relevance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        None => {
            candidates.sort_by_key(|c| (c.search_tier, c.fdc_id));
        }
    }

    candidates.truncate(MAX_FUSED_RESULTS);
    candidates
}
