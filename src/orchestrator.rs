use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::catalog::client::FdcClient;
use crate::catalog::multi_tier::search_multi_tier_comprehensive;
use crate::catalog::types::Candidate;
use crate::cli::OutputFormat;
use crate::config::Config;
use crate::data_saver::save_results;
use crate::intent::{IntentCache, IntentGenerator, SearchIntent};
use crate::mapping_store::MappingStore;
use crate::nutrients::{NutrientNormalizer, NutrientValue, NutritionData};
use crate::nutritional::NutritionalGate;
use crate::retry::generate_retry_strategy;
use crate::semantic::SemanticVerifier;

/// Attempts after a curated-mapping miss.
const MAX_RETRIES: u32 = 2;
const SEMANTIC_TOP_N: usize = 3;
const PROGRESS_SNAPSHOT_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConfidenceFlag {
    #[serde(rename = "HIGH_CONFIDENCE")]
    High,
    #[serde(rename = "MID_CONFIDENCE")]
    Mid,
    #[serde(rename = "LOW_CONFIDENCE")]
    Low,
    #[serde(rename = "NO_MAPPING_FOUND")]
    NoMappingFound,
}

impl ConfidenceFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceFlag::High => "HIGH_CONFIDENCE",
            ConfidenceFlag::Mid => "MID_CONFIDENCE",
            ConfidenceFlag::Low => "LOW_CONFIDENCE",
            ConfidenceFlag::NoMappingFound => "NO_MAPPING_FOUND",
        }
    }

    /// Only HIGH and MID count as an accepted mapping.
    pub fn is_successful(&self) -> bool {
        matches!(self, ConfidenceFlag::High | ConfidenceFlag::Mid)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub curated_mapping_time_seconds: Option<f64>,
    pub search_time_seconds: Option<f64>,
    pub semantic_verification_time_seconds: Option<f64>,
    pub nutritional_scoring_time_seconds: Option<f64>,
    pub extraction_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierDistribution {
    pub tier_1_count: usize,
    pub tier_2_count: usize,
    pub tier_3_count: usize,
    pub tier_4_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopCandidate {
    pub fdc_id: i64,
    pub description: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchMetrics {
    pub total_search_results: usize,
    pub semantic_verified_count: usize,
    pub top_semantic_results: Vec<TopCandidate>,
    pub top_nutritional_results: Vec<TopCandidate>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiMetrics {
    pub api_calls_count: u64,
    pub llm_calls_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptDetail {
    pub attempt: u32,
    pub query: String,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugMetadata {
    pub timing: StageTimings,
    pub tier_distribution: TierDistribution,
    pub search_metrics: SearchMetrics,
    pub api_metrics: ApiMetrics,
    pub attempt_details: Vec<AttemptDetail>,
}

/// The orchestrator's per-ingredient output. Every input yields exactly one
/// record; the canonical nutrient row is always complete, all-null when no
/// mapping was accepted.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub ingredient: String,
    pub fdc_id: Option<i64>,
    pub description: Option<String>,
    pub data_type: Option<String>,
    pub brand_owner: Option<String>,
    pub source: Option<String>,
    pub flag: ConfidenceFlag,
    pub mapping_status: String,
    pub semantic_match_score: Option<f32>,
    pub nutritional_similarity_score: Option<f32>,
    pub reasoning: String,
    pub retry_attempts: u32,
    pub search_queries_used: Vec<String>,
    pub timestamp: String,
    pub processing_time_seconds: f64,
    pub standardized_nutrients: BTreeMap<String, Option<NutrientValue>>,
    pub debug: DebugMetadata,
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub from_mappings: usize,
    pub from_search: usize,
    pub no_mapping_found: usize,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub stats: Stats,
    pub results: Vec<ResultRecord>,
    pub failed_ingredients: Vec<String>,
    pub output_file: PathBuf,
    pub log_file: PathBuf,
}

/// What the semantic score alone decides.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SemanticDecision {
    /// >= 90: accept directly, skip the nutritional gate.
    DirectHigh,
    /// 65..90: nutritional gate with the given acceptance threshold.
    Nutritional { threshold: f32 },
    /// < 65: no gate, retry or give up.
    Reject,
}

fn semantic_decision(score: f32) -> SemanticDecision {
    if score >= 90.0 {
        SemanticDecision::DirectHigh
    } else if score >= 80.0 {
        SemanticDecision::Nutritional { threshold: 80.0 }
    } else if score >= 65.0 {
        SemanticDecision::Nutritional { threshold: 90.0 }
    } else {
        SemanticDecision::Reject
    }
}

/// Confidence for a candidate that passed its nutritional threshold.
fn classify_confidence(semantic: f32, nutritional: f32) -> (ConfidenceFlag, &'static str) {
    if nutritional >= 90.0 {
        if semantic >= 80.0 {
            (ConfidenceFlag::High, "search_verified_high")
        } else {
            (ConfidenceFlag::Mid, "search_verified_mid_semantic_low")
        }
    } else if nutritional >= 80.0 {
        (ConfidenceFlag::Mid, "search_verified_mid")
    } else {
        (ConfidenceFlag::Low, "search_low_confidence")
    }
}

/// Working state for one ingredient, folded into the final record.
struct RecordContext {
    ingredient: String,
    timestamp: String,
    flag: ConfidenceFlag,
    mapping_status: String,
    semantic_match_score: Option<f32>,
    nutritional_similarity_score: Option<f32>,
    reasoning: String,
    retry_attempts: u32,
    search_queries_used: Vec<String>,
    debug: DebugMetadata,
}

impl RecordContext {
    fn new(ingredient: &str) -> Self {
        Self {
            ingredient: ingredient.to_string(),
            timestamp: Local::now().to_rfc3339(),
            flag: ConfidenceFlag::NoMappingFound,
            mapping_status: String::new(),
            semantic_match_score: None,
            nutritional_similarity_score: None,
            reasoning: String::new(),
            retry_attempts: 0,
            search_queries_used: Vec::new(),
            debug: DebugMetadata::default(),
        }
    }
}

/// Sequences curated lookup -> intent -> multi-tier search -> semantic gate
/// -> (nutritional gate) -> extraction, owning every shared service so tests
/// can construct it against fake endpoints. Never lets an error cross the
/// per-ingredient boundary.
pub struct Orchestrator {
    client: FdcClient,
    normalizer: NutrientNormalizer,
    mapping_store: MappingStore,
    intent_cache: IntentCache,
    intent_generator: IntentGenerator,
    semantic_verifier: SemanticVerifier,
    nutritional_gate: NutritionalGate,
    pub stats: Stats,
    log_file: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(config: &Config) -> Result<Self> {
        let normalizer =
            NutrientNormalizer::load(Path::new(&config.nutrient_definitions_file))?;
        let provider = config.llm_provider();
        if provider.is_none() {
            println!("Note: No LLM configured. Intent, semantic and nutritional stages will use deterministic fallbacks.");
        }

        Ok(Self {
            client: FdcClient::new(config),
            normalizer,
            mapping_store: MappingStore::load(Path::new(&config.curated_mapping_file)),
            intent_cache: IntentCache::load(Path::new(&config.cache_file)),
            intent_generator: IntentGenerator::new(provider.clone()),
            semantic_verifier: SemanticVerifier::new(provider.clone()),
            nutritional_gate: NutritionalGate::new(provider),
            stats: Stats::default(),
            log_file: None,
        })
    }

    fn log(&self, message: &str) {
        println!("{}", message);
        if let Some(path) = &self.log_file {
            use std::io::Write;
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                let _ = writeln!(file, "{}", message);
            }
        }
    }

    /// Resolve one ingredient to a result record. Infallible by contract:
    /// internal errors become `NO_MAPPING_FOUND` with `mapping_status =
    /// "exception"`.
    pub async fn fetch_nutrition_for_ingredient(&mut self, ingredient: &str) -> ResultRecord {
        let start = Instant::now();
        self.log(&format!("\n{}", "=".repeat(80)));
        self.log(&format!("Processing: {}", ingredient));
        self.log(&format!("{}", "=".repeat(80)));

        let mut ctx = RecordContext::new(ingredient);
        match self.resolve(ingredient, &mut ctx, start).await {
            Ok(record) => record,
            Err(e) => {
                self.log(&format!("[ERROR] Exception processing '{}': {}", ingredient, e));
                ctx.flag = ConfidenceFlag::NoMappingFound;
                ctx.mapping_status = "exception".to_string();
                ctx.reasoning = format!("Unexpected error: {}", e);
                self.stats.no_mapping_found += 1;
                self.failed_record(&mut ctx, start)
            }
        }
    }

    async fn resolve(
        &mut self,
        ingredient: &str,
        ctx: &mut RecordContext,
        start: Instant,
    ) -> Result<ResultRecord> {
        // Step 1: curated mappings (fast path).
        self.log("\n[Step 1] Checking curated mappings...");
        let mapping_start = Instant::now();
        let mapping = self.mapping_store.lookup(ingredient).cloned();
        ctx.debug.timing.curated_mapping_time_seconds =
            Some(round3(mapping_start.elapsed().as_secs_f64()));

        if let Some(entry) = mapping {
            self.log(&format!("[OK] Found in mappings! FDC ID: {}", entry.fdc_id));
            self.log("\n[Step 5] Extracting nutrition data...");
            let extraction_start = Instant::now();
            ctx.debug.api_metrics.api_calls_count += 1;
            if let Some(details) = self.client.get_details(entry.fdc_id).await {
                if !details.food_nutrients.is_empty() {
                    let data = self.normalizer.normalize(&details);
                    ctx.debug.timing.extraction_time_seconds =
                        Some(round3(extraction_start.elapsed().as_secs_f64()));
                    ctx.flag = ConfidenceFlag::High;
                    ctx.mapping_status = "curated_mapping".to_string();
                    ctx.semantic_match_score = Some(100.0);
                    ctx.nutritional_similarity_score = Some(100.0);
                    ctx.reasoning = "Found in curated mappings (verified)".to_string();
                    ctx.retry_attempts = 0;
                    self.stats.from_mappings += 1;
                    let elapsed = start.elapsed().as_secs_f64();
                    self.log(&format!(
                        "[SUCCESS] Extracted nutrition data for '{}'",
                        ingredient
                    ));
                    self.log(&format!(
                        "[TIME] Processing time: {:.2} seconds (fast path - curated mapping)",
                        elapsed
                    ));
                    return Ok(self.success_record(ctx, data, "curated_mapping", elapsed));
                }
            }
            // A curated entry whose detail record is gone falls through to
            // the search path.
            self.log("[WARNING] Curated mapping detail fetch failed, falling back to search...");
        }

        // Steps 2-5 with bounded retries.
        let mut previous_queries: Vec<String> = Vec::new();

        for attempt in 1..=MAX_RETRIES {
            ctx.retry_attempts = attempt;
            let mut attempt_detail = AttemptDetail {
                attempt,
                query: String::new(),
                success: false,
            };

            self.log(&format!("\n[Attempt {}/{}]", attempt, MAX_RETRIES));

            // Step 2: query plan.
            self.log("[Step 2] Generating search strategy...");
            let llm_before = self.intent_generator.llm_calls;
            let intent = self.plan_query(ingredient, attempt, &previous_queries).await;
            ctx.debug.api_metrics.llm_calls_count += self.intent_generator.llm_calls - llm_before;
            let search_query = intent.search_query.clone();
            ctx.search_queries_used.push(search_query.clone());
            attempt_detail.query = search_query.clone();
            self.log(&format!("[OK] Search query: {}", search_query));
            if attempt > 1 {
                self.log(&format!(
                    "  Retry reason: {}",
                    intent.retry_reason.as_deref().unwrap_or("Alternative strategy")
                ));
            }

            // Step 3: comprehensive 4-tier search.
            self.log("\n[Step 3] Searching USDA API (comprehensive 4-tier search)...");
            let search_start = Instant::now();
            let candidates =
                search_multi_tier_comprehensive(&self.client, &search_query, Some(ingredient))
                    .await;
            ctx.debug.timing.search_time_seconds =
                Some(round3(search_start.elapsed().as_secs_f64()));
            ctx.debug.api_metrics.api_calls_count += 4;

            if candidates.is_empty() {
                self.log("[WARNING] No search results found");
                ctx.debug.attempt_details.push(attempt_detail);
                if attempt < MAX_RETRIES {
                    previous_queries.push(search_query);
                    continue;
                }
                ctx.mapping_status = "no_search_results".to_string();
                ctx.reasoning = format!(
                    "No search results found after {} attempts with different queries",
                    MAX_RETRIES
                );
                self.stats.no_mapping_found += 1;
                return Ok(self.failed_record_logged(ctx, start, "no search results"));
            }

            self.record_tier_distribution(ctx, &candidates);

            // Step 3.5: semantic verification.
            self.log("\n[Step 3.5] Semantic verification (LLM)...");
            let semantic_start = Instant::now();
            let llm_before = self.semantic_verifier.llm_calls;
            let verified = self
                .semantic_verifier
                .verify(ingredient, &candidates, SEMANTIC_TOP_N)
                .await;
            ctx.debug.timing.semantic_verification_time_seconds =
                Some(round3(semantic_start.elapsed().as_secs_f64()));
            ctx.debug.api_metrics.llm_calls_count += self.semantic_verifier.llm_calls - llm_before;

            if verified.is_empty() {
                self.log("[WARNING] No semantically verified matches");
                ctx.debug.attempt_details.push(attempt_detail);
                if attempt < MAX_RETRIES {
                    previous_queries.push(search_query);
                    continue;
                }
                ctx.mapping_status = "semantic_mismatch".to_string();
                ctx.reasoning = format!(
                    "No semantically valid matches found after {} attempts",
                    MAX_RETRIES
                );
                self.stats.no_mapping_found += 1;
                return Ok(self.failed_record_logged(ctx, start, "no semantic matches"));
            }

            self.log(&format!("[OK] {} semantically verified results", verified.len()));
            ctx.debug.search_metrics.semantic_verified_count = verified.len();
            ctx.debug.search_metrics.top_semantic_results = verified
                .iter()
                .take(3)
                .map(|c| TopCandidate {
                    fdc_id: c.fdc_id,
                    description: c.description.clone(),
                    score: c.semantic_score.unwrap_or(0.0),
                })
                .collect();

            for (i, candidate) in verified.iter().enumerate() {
                self.log(&format!(
                    "  {}. {} (semantic score: {:.1}%)",
                    i + 1,
                    candidate.description,
                    candidate.semantic_score.unwrap_or(0.0)
                ));
            }

            let best_semantic_score = verified[0].semantic_score.unwrap_or(0.0);
            ctx.semantic_match_score = Some(best_semantic_score);

            match semantic_decision(best_semantic_score) {
                SemanticDecision::DirectHigh => {
                    self.log(&format!(
                        "\n[INFO] Semantic score ({:.1}%) >= 90% - Direct mapping, skipping nutritional gate",
                        best_semantic_score
                    ));
                    match self.extract_first_available(ctx, &verified).await {
                        Some(data) => {
                            ctx.flag = ConfidenceFlag::High;
                            ctx.mapping_status = "search_verified_semantic_high".to_string();
                            ctx.semantic_match_score = Some(best_semantic_score);
                            ctx.nutritional_similarity_score = None;
                            ctx.reasoning = format!(
                                "Direct mapping based on high semantic match score ({:.1}%). Nutritional verification was skipped.",
                                best_semantic_score
                            );
                            attempt_detail.success = true;
                            ctx.debug.attempt_details.push(attempt_detail);
                            self.stats.from_search += 1;
                            let elapsed = start.elapsed().as_secs_f64();
                            self.log(&format!(
                                "[SUCCESS] Extracted nutrition data for '{}' (HIGH_CONFIDENCE) - Direct mapping based on semantic score",
                                ingredient
                            ));
                            self.log(&format!(
                                "[TIME] Processing time: {:.2} seconds (skipped nutritional verification)",
                                elapsed
                            ));
                            return Ok(self.success_record(ctx, data, "search", elapsed));
                        }
                        None => {
                            ctx.debug.attempt_details.push(attempt_detail);
                            if attempt < MAX_RETRIES {
                                self.log("[WARNING] Could not fetch food data for any semantic match, retrying with a different search...");
                                previous_queries.push(search_query);
                                continue;
                            }
                            ctx.mapping_status = "food_data_not_found".to_string();
                            ctx.reasoning = format!(
                                "Semantic score ({:.1}%) was high but no detail record could be fetched for any semantic match",
                                best_semantic_score
                            );
                            self.stats.no_mapping_found += 1;
                            return Ok(self.failed_record_logged(ctx, start, "food data not found"));
                        }
                    }
                }
                SemanticDecision::Nutritional { threshold } => {
                    self.log(&format!(
                        "\n[INFO] Semantic score ({:.1}%) - Proceeding to nutritional verification (threshold: >= {:.0}%)",
                        best_semantic_score, threshold
                    ));

                    // Step 4: nutritional similarity scoring.
                    self.log("\n[Step 4] Nutritional similarity scoring (LLM)...");
                    let nutritional_start = Instant::now();
                    let llm_before = self.nutritional_gate.llm_calls;
                    let scored = self
                        .nutritional_gate
                        .score(
                            ingredient,
                            &verified,
                            &self.client,
                            &self.normalizer,
                            SEMANTIC_TOP_N,
                        )
                        .await;
                    ctx.debug.timing.nutritional_scoring_time_seconds =
                        Some(round3(nutritional_start.elapsed().as_secs_f64()));
                    ctx.debug.api_metrics.llm_calls_count +=
                        self.nutritional_gate.llm_calls - llm_before;
                    ctx.debug.api_metrics.api_calls_count +=
                        verified.len().min(SEMANTIC_TOP_N) as u64;

                    if scored.is_empty() {
                        self.log("[WARNING] No nutritionally similar matches");
                        ctx.debug.attempt_details.push(attempt_detail);
                        if attempt < MAX_RETRIES {
                            previous_queries.push(search_query);
                            continue;
                        }
                        ctx.mapping_status = "nutritional_mismatch".to_string();
                        ctx.reasoning = format!(
                            "No nutritionally similar matches found after {} attempts. Semantic score: {:.1}%",
                            MAX_RETRIES, best_semantic_score
                        );
                        self.stats.no_mapping_found += 1;
                        return Ok(self.failed_record_logged(ctx, start, "nutritional mismatch"));
                    }

                    ctx.debug.search_metrics.top_nutritional_results = scored
                        .iter()
                        .take(3)
                        .map(|c| TopCandidate {
                            fdc_id: c.fdc_id,
                            description: c.description.clone(),
                            score: c.nutritional_score.unwrap_or(0.0),
                        })
                        .collect();

                    let best_nutrition_score = scored[0].nutritional_score.unwrap_or(0.0);
                    ctx.nutritional_similarity_score = Some(best_nutrition_score);
                    self.log(&format!(
                        "[OK] Best nutritional match: {} (nutritional similarity: {:.1}%)",
                        scored[0].description, best_nutrition_score
                    ));

                    if best_nutrition_score < threshold {
                        self.log(&format!(
                            "[WARNING] Nutritional score ({:.1}%) below threshold ({:.0}%)",
                            best_nutrition_score, threshold
                        ));
                        ctx.debug.attempt_details.push(attempt_detail);
                        if attempt < MAX_RETRIES {
                            previous_queries.push(search_query);
                            continue;
                        }
                        ctx.mapping_status = "nutritional_mismatch".to_string();
                        ctx.reasoning = format!(
                            "Nutritional similarity ({:.1}%) below the {:.0}% threshold for semantic score {:.1}%",
                            best_nutrition_score, threshold, best_semantic_score
                        );
                        self.stats.no_mapping_found += 1;
                        return Ok(self.failed_record_logged(ctx, start, "nutritional mismatch"));
                    }

                    let passing: Vec<&Candidate> = scored
                        .iter()
                        .filter(|c| c.nutritional_score.unwrap_or(0.0) >= threshold)
                        .collect();

                    // Step 5: extraction, walking the passing candidates.
                    self.log("\n[Step 5] Extracting nutrition data...");
                    for candidate in passing {
                        let nutrition_score = candidate.nutritional_score.unwrap_or(0.0);
                        let extraction_start = Instant::now();
                        ctx.debug.api_metrics.api_calls_count += 1;
                        let Some(details) = self.client.get_details(candidate.fdc_id).await else {
                            self.log(&format!(
                                "[WARNING] Could not fetch food data for FDC ID {}, trying next candidate...",
                                candidate.fdc_id
                            ));
                            continue;
                        };
                        if details.food_nutrients.is_empty() {
                            self.log(&format!(
                                "[WARNING] foodNutrients empty for FDC ID {}, trying next candidate...",
                                candidate.fdc_id
                            ));
                            continue;
                        }
                        let data = self.normalizer.normalize(&details);
                        ctx.debug.timing.extraction_time_seconds =
                            Some(round3(extraction_start.elapsed().as_secs_f64()));

                        let (flag, mapping_status) =
                            classify_confidence(best_semantic_score, nutrition_score);
                        ctx.flag = flag;
                        ctx.mapping_status = mapping_status.to_string();
                        ctx.nutritional_similarity_score = Some(nutrition_score);
                        ctx.reasoning = candidate
                            .nutritional_reasoning
                            .clone()
                            .unwrap_or_default();
                        attempt_detail.success = true;
                        ctx.debug.attempt_details.push(attempt_detail);
                        self.log(&format!(
                            "[OK] Combined verification passed - Semantic: {:.1}%, Nutritional: {:.1}% (threshold: {:.0}%), Flag: {}",
                            best_semantic_score, nutrition_score, threshold, flag.as_str()
                        ));
                        self.stats.from_search += 1;
                        let elapsed = start.elapsed().as_secs_f64();
                        self.log(&format!(
                            "[SUCCESS] Extracted nutrition data for '{}' ({})",
                            ingredient,
                            flag.as_str()
                        ));
                        self.log(&format!("[TIME] Processing time: {:.2} seconds", elapsed));
                        return Ok(self.success_record(ctx, data, "search", elapsed));
                    }

                    ctx.debug.attempt_details.push(attempt_detail);
                    if attempt < MAX_RETRIES {
                        self.log("[WARNING] Extraction failed for all passing candidates, retrying...");
                        previous_queries.push(search_query);
                        continue;
                    }
                    ctx.mapping_status = "food_data_not_found".to_string();
                    ctx.reasoning = format!(
                        "Verification passed (semantic {:.1}%, nutritional {:.1}%) but no detail record could be fetched",
                        best_semantic_score, best_nutrition_score
                    );
                    self.stats.no_mapping_found += 1;
                    return Ok(self.failed_record_logged(ctx, start, "food data not found"));
                }
                SemanticDecision::Reject => {
                    self.log(&format!(
                        "\n[INFO] Semantic score ({:.1}%) < 65% - Skipping nutritional gate, will NOT map",
                        best_semantic_score
                    ));
                    ctx.debug.attempt_details.push(attempt_detail);
                    if attempt < MAX_RETRIES {
                        self.log("[WARNING] Semantic score too low (<65%), retrying...");
                        previous_queries.push(search_query);
                        continue;
                    }
                    ctx.mapping_status = "semantic_score_too_low".to_string();
                    ctx.reasoning = format!(
                        "Semantic score ({:.1}%) below 65% threshold. Skipping nutritional verification.",
                        best_semantic_score
                    );
                    self.stats.no_mapping_found += 1;
                    return Ok(self.failed_record_logged(ctx, start, "semantic score too low"));
                }
            }
        }

        // Unreachable in practice (every final attempt returns above), kept
        // as the documented catch-all.
        ctx.mapping_status = "all_retries_exhausted".to_string();
        ctx.reasoning = format!(
            "Could not find suitable match after {} attempts with different search strategies",
            MAX_RETRIES
        );
        self.stats.no_mapping_found += 1;
        Ok(self.failed_record_logged(ctx, start, "all retries exhausted"))
    }

    /// First attempt uses the cached or freshly generated intent; retries use
    /// the deterministic mutation strategy seeded with the cached plan.
    async fn plan_query(
        &mut self,
        ingredient: &str,
        attempt: u32,
        previous_queries: &[String],
    ) -> SearchIntent {
        if attempt == 1 {
            if let Some(intent) = self.intent_cache.get(ingredient) {
                return intent;
            }
            if let Some(intent) = self.intent_generator.generate(ingredient).await {
                if let Err(e) = self.intent_cache.insert(ingredient, intent.clone()) {
                    eprintln!("Warning: Could not persist intent cache: {}", e);
                }
                return intent;
            }
            SearchIntent::fallback(ingredient)
        } else {
            let base = self.intent_cache.get(ingredient);
            generate_retry_strategy(ingredient, attempt, previous_queries, base)
        }
    }

    /// Walk the semantically ranked candidates until one yields a usable
    /// detail record.
    async fn extract_first_available(
        &mut self,
        ctx: &mut RecordContext,
        verified: &[Candidate],
    ) -> Option<NutritionData> {
        self.log("\n[Step 5] Extracting nutrition data (nutritional gate skipped)...");
        for (i, candidate) in verified.iter().enumerate() {
            let extraction_start = Instant::now();
            ctx.debug.api_metrics.api_calls_count += 1;
            if i > 0 {
                self.log(&format!("  Trying FDC ID {}...", candidate.fdc_id));
            }
            let Some(details) = self.client.get_details(candidate.fdc_id).await else {
                self.log(&format!(
                    "[WARNING] Could not fetch food data for FDC ID {}, trying other semantic matches...",
                    candidate.fdc_id
                ));
                continue;
            };
            if details.food_nutrients.is_empty() {
                self.log(&format!(
                    "[WARNING] foodNutrients empty for FDC ID {}, trying other semantic matches...",
                    candidate.fdc_id
                ));
                continue;
            }
            ctx.debug.timing.extraction_time_seconds =
                Some(round3(extraction_start.elapsed().as_secs_f64()));
            return Some(self.normalizer.normalize(&details));
        }
        None
    }

    fn record_tier_distribution(&self, ctx: &mut RecordContext, candidates: &[Candidate]) {
        let mut distribution = TierDistribution::default();
        for candidate in candidates {
            match candidate.search_tier {
                1 => distribution.tier_1_count += 1,
                2 => distribution.tier_2_count += 1,
                3 => distribution.tier_3_count += 1,
                _ => distribution.tier_4_count += 1,
            }
        }
        self.log(&format!(
            "[OK] Found {} search results (Tier 1 (Foundation,SR Legacy): {}, Tier 2 (Survey (FNDDS)): {}, Tier 3 (Branded): {}, Tier 4 (All types): {})",
            candidates.len(),
            distribution.tier_1_count,
            distribution.tier_2_count,
            distribution.tier_3_count,
            distribution.tier_4_count
        ));
        ctx.debug.search_metrics.total_search_results = candidates.len();
        ctx.debug.tier_distribution = distribution;
    }

    fn success_record(
        &mut self,
        ctx: &mut RecordContext,
        data: NutritionData,
        source: &str,
        elapsed: f64,
    ) -> ResultRecord {
        ctx.debug.api_metrics.cache_hits = self.intent_cache.hits;
        ctx.debug.api_metrics.cache_misses = self.intent_cache.misses;
        ResultRecord {
            ingredient: ctx.ingredient.clone(),
            fdc_id: Some(data.fdc_id),
            description: Some(data.description),
            data_type: Some(data.data_type),
            brand_owner: data.brand_owner,
            source: Some(source.to_string()),
            flag: ctx.flag,
            mapping_status: ctx.mapping_status.clone(),
            semantic_match_score: ctx.semantic_match_score,
            nutritional_similarity_score: ctx.nutritional_similarity_score,
            reasoning: ctx.reasoning.clone(),
            retry_attempts: ctx.retry_attempts,
            search_queries_used: ctx.search_queries_used.clone(),
            timestamp: ctx.timestamp.clone(),
            processing_time_seconds: round2(elapsed),
            standardized_nutrients: data.standardized_nutrients,
            debug: std::mem::take(&mut ctx.debug),
        }
    }

    fn failed_record_logged(
        &mut self,
        ctx: &mut RecordContext,
        start: Instant,
        reason: &str,
    ) -> ResultRecord {
        let elapsed = start.elapsed().as_secs_f64();
        self.log(&format!(
            "[TIME] Processing time: {:.2} seconds ({})",
            elapsed, reason
        ));
        self.failed_record(ctx, start)
    }

    fn failed_record(&mut self, ctx: &mut RecordContext, start: Instant) -> ResultRecord {
        ctx.debug.api_metrics.cache_hits = self.intent_cache.hits;
        ctx.debug.api_metrics.cache_misses = self.intent_cache.misses;
        ResultRecord {
            ingredient: ctx.ingredient.clone(),
            fdc_id: None,
            description: None,
            data_type: None,
            brand_owner: None,
            source: None,
            flag: ConfidenceFlag::NoMappingFound,
            mapping_status: std::mem::take(&mut ctx.mapping_status),
            semantic_match_score: ctx.semantic_match_score,
            nutritional_similarity_score: ctx.nutritional_similarity_score,
            reasoning: std::mem::take(&mut ctx.reasoning),
            retry_attempts: ctx.retry_attempts,
            search_queries_used: std::mem::take(&mut ctx.search_queries_used),
            timestamp: ctx.timestamp.clone(),
            processing_time_seconds: round2(start.elapsed().as_secs_f64()),
            standardized_nutrients: self.normalizer.empty_row(),
            debug: std::mem::take(&mut ctx.debug),
        }
    }

    /// Process a batch: apply start/limit, resolve each ingredient, snapshot
    /// progress every few items, and write the final outputs plus the
    /// companion failed list.
    pub async fn process_ingredients(
        &mut self,
        ingredients: Vec<String>,
        output_file: &str,
        format: OutputFormat,
        limit: Option<usize>,
        start_from: usize,
    ) -> Result<BatchOutcome> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let output_path = Path::new(output_file);
        let stem = output_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "nutrition_data".to_string());
        let ext = output_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let parent = output_path.parent().unwrap_or_else(|| Path::new(""));
        let timestamped_output = parent.join(format!("{}_{}{}", stem, timestamp, ext));
        let log_file = parent.join(format!("{}_{}.log", stem, timestamp));
        self.log_file = Some(log_file.clone());

        let mut ingredients = ingredients;
        if start_from > 0 {
            ingredients = ingredients.split_off(start_from.min(ingredients.len()));
            self.log(&format!("Starting from index {}", start_from));
        }
        if let Some(limit) = limit {
            ingredients.truncate(limit);
            self.log(&format!("Processing {} ingredients (limited)", ingredients.len()));
        }

        self.stats.total = ingredients.len();

        let mut results: Vec<ResultRecord> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut processing_times: Vec<f64> = Vec::new();
        let batch_start = Instant::now();

        self.log(&format!("\n{}", "=".repeat(80)));
        self.log(&format!("PROCESSING {} INGREDIENTS", ingredients.len()));
        self.log(&format!("Output file: {}", timestamped_output.display()));
        self.log(&format!("Log file: {}", log_file.display()));
        self.log(&format!(
            "Start time: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        self.log(&format!("{}\n", "=".repeat(80)));

        for (i, ingredient) in ingredients.iter().enumerate() {
            self.log(&format!("\n[{}/{}]", i + 1, ingredients.len()));

            let record = self.fetch_nutrition_for_ingredient(ingredient).await;
            processing_times.push(record.processing_time_seconds);

            if record.flag.is_successful() {
                self.stats.successful += 1;
            } else {
                failed.push(ingredient.clone());
                self.stats.failed += 1;
            }
            results.push(record);

            if (i + 1) % PROGRESS_SNAPSHOT_EVERY == 0 {
                let snapshot = snapshot_path(&timestamped_output);
                if let Err(e) = save_results(&results, &snapshot, format) {
                    eprintln!("Warning: Could not save progress snapshot: {}", e);
                } else {
                    self.log(&format!(
                        "\n[PROGRESS] Saved: {} results, {} failed",
                        results.len(),
                        failed.len()
                    ));
                }
            }
        }

        if !results.is_empty() {
            save_results(&results, &timestamped_output, format)?;
            self.log(&format!(
                "\n[SUCCESS] Saved {} results to {}",
                results.len(),
                timestamped_output.display()
            ));
        }

        if !failed.is_empty() {
            let failed_file = failed_list_path(&timestamped_output);
            std::fs::write(&failed_file, failed.join("\n"))?;
            self.log(&format!(
                "[INFO] Saved {} failed ingredients to {}",
                failed.len(),
                failed_file.display()
            ));
        }

        let total_time = batch_start.elapsed().as_secs_f64();
        self.log(&format!(
            "\nEnd time: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        self.print_summary(total_time, &processing_times);

        Ok(BatchOutcome {
            stats: self.stats.clone(),
            results,
            failed_ingredients: failed,
            output_file: timestamped_output,
            log_file,
        })
    }

    fn print_summary(&self, total_time: f64, processing_times: &[f64]) {
        self.log(&format!("\n{}", "=".repeat(80)));
        self.log("PROCESSING SUMMARY");
        self.log(&format!("{}", "=".repeat(80)));
        self.log(&format!("Total processed: {}", self.stats.total));
        if self.stats.total > 0 {
            self.log(&format!(
                "Successful: {} ({:.1}%)",
                self.stats.successful,
                self.stats.successful as f64 / self.stats.total as f64 * 100.0
            ));
            self.log(&format!(
                "Failed/No Mapping: {} ({:.1}%)",
                self.stats.failed,
                self.stats.failed as f64 / self.stats.total as f64 * 100.0
            ));
        }
        self.log(&format!("From mappings (fast path): {}", self.stats.from_mappings));
        self.log(&format!("From search: {}", self.stats.from_search));
        self.log(&format!("No mapping found: {}", self.stats.no_mapping_found));
        self.log(&format!("\n{}", "=".repeat(80)));
        self.log("TIMING INFORMATION");
        self.log(&format!("{}", "=".repeat(80)));
        if !processing_times.is_empty() {
            let avg = processing_times.iter().sum::<f64>() / processing_times.len() as f64;
            let min = processing_times.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = processing_times.iter().cloned().fold(0.0_f64, f64::max);
            self.log(&format!(
                "Total time: {:.2} seconds ({:.2} minutes)",
                total_time,
                total_time / 60.0
            ));
            self.log(&format!("Average time per ingredient: {:.2} seconds", avg));
            self.log(&format!("Fastest ingredient: {:.2} seconds", min));
            self.log(&format!("Slowest ingredient: {:.2} seconds", max));
            if total_time > 0.0 {
                self.log(&format!(
                    "Throughput: {:.2} ingredients/minute",
                    self.stats.total as f64 / total_time * 60.0
                ));
            }
        }
        self.log(&format!("{}", "=".repeat(80)));
    }
}

fn snapshot_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = output
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    output.with_file_name(format!("{}_temp{}", stem, ext))
}

fn failed_list_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    output.with_file_name(format!("{}_failed.txt", stem))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
