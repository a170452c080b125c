use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;

use crate::cli::OutputFormat;
use crate::nutrients::NutrientValue;
use crate::orchestrator::ResultRecord;

/// Save results in the requested shape. `csv` is an alias for the standard
/// CSV layout, `json` for the full debug JSON.
pub fn save_results(results: &[ResultRecord], path: &Path, format: OutputFormat) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {:?}", parent))?;
        }
    }

    match format {
        OutputFormat::Csv | OutputFormat::CsvStandard => save_csv_standard(results, path),
        OutputFormat::CsvDebug => save_csv_debug(results, path),
        OutputFormat::Json | OutputFormat::JsonDebug => save_json_debug(results, path),
        OutputFormat::JsonClean => save_json_clean(results, path),
        OutputFormat::JsonBatch => save_json_batch(results, path),
    }
}

const METADATA_FIELDS: &[&str] = &[
    "ingredient",
    "fdc_id",
    "description",
    "data_type",
    "brand_owner",
    "source",
    "flag",
    "mapping_status",
    "semantic_match_score",
    "nutritional_similarity_score",
    "reasoning",
    "retry_attempts",
    "search_queries_used",
    "timestamp",
    "processing_time_seconds",
];

const DEBUG_FIELDS: &[&str] = &[
    "curated_mapping_time_seconds",
    "search_time_seconds",
    "semantic_verification_time_seconds",
    "nutritional_scoring_time_seconds",
    "extraction_time_seconds",
    "tier_1_count",
    "tier_2_count",
    "tier_3_count",
    "tier_4_count",
    "total_search_results",
    "semantic_verified_count",
    "top_semantic_score_1",
    "top_semantic_desc_1",
    "top_semantic_score_2",
    "top_semantic_desc_2",
    "top_semantic_score_3",
    "top_semantic_desc_3",
    "top_nutritional_score_1",
    "top_nutritional_desc_1",
    "top_nutritional_score_2",
    "top_nutritional_desc_2",
    "top_nutritional_score_3",
    "top_nutritional_desc_3",
    "api_calls_count",
    "llm_calls_count",
    "cache_hits",
    "cache_misses",
    "attempt_1_query",
    "attempt_1_success",
    "attempt_2_query",
    "attempt_2_success",
];

/// Union of nutrient IDs across the batch, sorted. Records always carry the
/// full canonical row, so in practice this is the canonical ID list.
fn collect_nutrient_ids(results: &[ResultRecord]) -> Vec<String> {
    let mut ids = BTreeSet::new();
    for result in results {
        for id in result.standardized_nutrients.keys() {
            ids.insert(id.clone());
        }
    }
    ids.into_iter().collect()
}

fn format_nutrient_cell(value: &Option<NutrientValue>) -> String {
    match value {
        Some(v) => format!("{} {}", v.amount, v.unit).trim().to_string(),
        None => String::new(),
    }
}

fn format_optional<T: std::fmt::Display>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// Double quotes in free text are downgraded to single quotes so the rows
/// stay friendly to downstream spreadsheet tooling.
fn sanitize_text(text: &str) -> String {
    text.replace('"', "'")
}

fn metadata_cells(result: &ResultRecord) -> Vec<String> {
    vec![
        result.ingredient.clone(),
        format_optional(&result.fdc_id),
        result.description.clone().unwrap_or_default(),
        result.data_type.clone().unwrap_or_default(),
        result.brand_owner.clone().unwrap_or_default(),
        result.source.clone().unwrap_or_default(),
        result.flag.as_str().to_string(),
        result.mapping_status.clone(),
        format_optional(&result.semantic_match_score),
        format_optional(&result.nutritional_similarity_score),
        sanitize_text(&result.reasoning),
        result.retry_attempts.to_string(),
        sanitize_text(&result.search_queries_used.join(", ")),
        result.timestamp.clone(),
        result.processing_time_seconds.to_string(),
    ]
}

fn save_csv_standard(results: &[ResultRecord], path: &Path) -> Result<()> {
    let nutrient_ids = collect_nutrient_ids(results);
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV output at {:?}", path))?;

    let mut header: Vec<String> = METADATA_FIELDS.iter().map(|f| f.to_string()).collect();
    header.extend(nutrient_ids.iter().cloned());
    writer.write_record(&header)?;

    for result in results {
        let mut row = metadata_cells(result);
        for id in &nutrient_ids {
            row.push(format_nutrient_cell(
                result.standardized_nutrients.get(id).unwrap_or(&None),
            ));
        }
        writer.write_record(&row)?;
    }

    writer.flush()?;
    println!("[OK] Saved {} results to {}", results.len(), path.display());
    Ok(())
}

fn save_csv_debug(results: &[ResultRecord], path: &Path) -> Result<()> {
    let nutrient_ids = collect_nutrient_ids(results);
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV output at {:?}", path))?;

    let mut header: Vec<String> = METADATA_FIELDS.iter().map(|f| f.to_string()).collect();
    header.extend(DEBUG_FIELDS.iter().map(|f| f.to_string()));
    header.extend(nutrient_ids.iter().cloned());
    writer.write_record(&header)?;

    for result in results {
        let debug = &result.debug;
        let timing = &debug.timing;
        let tiers = &debug.tier_distribution;
        let metrics = &debug.search_metrics;
        let api = &debug.api_metrics;

        let mut row = metadata_cells(result);
        row.extend([
            format_optional(&timing.curated_mapping_time_seconds),
            format_optional(&timing.search_time_seconds),
            format_optional(&timing.semantic_verification_time_seconds),
            format_optional(&timing.nutritional_scoring_time_seconds),
            format_optional(&timing.extraction_time_seconds),
            tiers.tier_1_count.to_string(),
            tiers.tier_2_count.to_string(),
            tiers.tier_3_count.to_string(),
            tiers.tier_4_count.to_string(),
            metrics.total_search_results.to_string(),
            metrics.semantic_verified_count.to_string(),
        ]);
        for i in 0..3 {
            match metrics.top_semantic_results.get(i) {
                Some(top) => {
                    row.push(top.score.to_string());
                    row.push(top.description.clone());
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        for i in 0..3 {
            match metrics.top_nutritional_results.get(i) {
                Some(top) => {
                    row.push(top.score.to_string());
                    row.push(top.description.clone());
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        row.extend([
            api.api_calls_count.to_string(),
            api.llm_calls_count.to_string(),
            api.cache_hits.to_string(),
            api.cache_misses.to_string(),
        ]);
        for i in 0..2 {
            match debug.attempt_details.get(i) {
                Some(attempt) => {
                    row.push(attempt.query.clone());
                    row.push(attempt.success.to_string());
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        for id in &nutrient_ids {
            row.push(format_nutrient_cell(
                result.standardized_nutrients.get(id).unwrap_or(&None),
            ));
        }
        writer.write_record(&row)?;
    }

    writer.flush()?;
    println!(
        "[OK] Saved {} results to {} (debug mode)",
        results.len(),
        path.display()
    );
    Ok(())
}

fn save_json_debug(results: &[ResultRecord], path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write JSON output to {:?}", path))?;
    println!(
        "[OK] Saved {} results to {} (debug mode)",
        results.len(),
        path.display()
    );
    Ok(())
}

fn clean_value(result: &ResultRecord) -> serde_json::Value {
    let nutrients: serde_json::Map<String, serde_json::Value> = result
        .standardized_nutrients
        .iter()
        .filter_map(|(id, value)| {
            value.as_ref().map(|v| {
                (
                    id.clone(),
                    serde_json::json!({"amount": v.amount, "unit": v.unit}),
                )
            })
        })
        .collect();

    serde_json::json!({
        "ingredient": result.ingredient,
        "fdc_id": result.fdc_id,
        "description": result.description.clone().unwrap_or_default(),
        "data_type": result.data_type.clone().unwrap_or_default(),
        "flag": result.flag.as_str(),
        "mapping_status": result.mapping_status,
        "nutrients": nutrients,
        "timestamp": result.timestamp,
    })
}

fn save_json_clean(results: &[ResultRecord], path: &Path) -> Result<()> {
    let clean: Vec<serde_json::Value> = results.iter().map(clean_value).collect();
    let json = serde_json::to_string_pretty(&clean)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write JSON output to {:?}", path))?;
    println!(
        "[OK] Saved {} results to {} (clean mode)",
        results.len(),
        path.display()
    );
    Ok(())
}

fn save_json_batch(results: &[ResultRecord], path: &Path) -> Result<()> {
    let successful = results.iter().filter(|r| r.flag.is_successful()).count();
    let failed = results.len() - successful;
    let total_time: f64 = results.iter().map(|r| r.processing_time_seconds).sum();

    let clean: Vec<serde_json::Value> = results.iter().map(clean_value).collect();
    let failed_ingredients: Vec<&str> = results
        .iter()
        .filter(|r| !r.flag.is_successful())
        .map(|r| r.ingredient.as_str())
        .collect();

    let batch = serde_json::json!({
        "summary": {
            "total": results.len(),
            "successful": successful,
            "failed": failed,
            "processing_time_seconds": (total_time * 100.0).round() / 100.0,
        },
        "results": clean,
        "failed_ingredients": failed_ingredients,
        "timestamp": results.first().map(|r| r.timestamp.clone()).unwrap_or_default(),
    });

    let json = serde_json::to_string_pretty(&batch)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write JSON output to {:?}", path))?;
    println!(
        "[OK] Saved {} results to {} (batch mode)",
        results.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{ConfidenceFlag, DebugMetadata, ResultRecord};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn nutrient_row(with_values: bool) -> BTreeMap<String, Option<NutrientValue>> {
        let mut row = BTreeMap::new();
        row.insert(
            "nutrient-calories-energy".to_string(),
            with_values.then(|| NutrientValue {
                amount: 61.0,
                unit: "kcal".to_string(),
            }),
        );
        row.insert(
            "nutrient-protein".to_string(),
            with_values.then(|| NutrientValue {
                amount: 3.28,
                unit: "g".to_string(),
            }),
        );
        row.insert("nutrient-sodium".to_string(), None);
        row
    }

    fn record(ingredient: &str, success: bool) -> ResultRecord {
        ResultRecord {
            ingredient: ingredient.to_string(),
            fdc_id: success.then_some(746782),
            description: success.then(|| "Milk, whole".to_string()),
            data_type: success.then(|| "Foundation".to_string()),
            brand_owner: None,
            source: success.then(|| "search".to_string()),
            flag: if success {
                ConfidenceFlag::High
            } else {
                ConfidenceFlag::NoMappingFound
            },
            mapping_status: if success {
                "search_verified_semantic_high".to_string()
            } else {
                "semantic_score_too_low".to_string()
            },
            semantic_match_score: success.then_some(92.0),
            nutritional_similarity_score: None,
            reasoning: "a \"quoted\" reason".to_string(),
            retry_attempts: 1,
            search_queries_used: vec!["milk".to_string()],
            timestamp: "2025-08-01T12:00:00+00:00".to_string(),
            processing_time_seconds: 4.2,
            standardized_nutrients: nutrient_row(success),
            debug: DebugMetadata::default(),
        }
    }

    #[test]
    fn test_csv_standard_has_nutrient_columns() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv");
        save_results(&[record("milk", true)], &path, OutputFormat::CsvStandard)?;

        let content = std::fs::read_to_string(&path)?;
        let mut lines = content.lines();
        let header = lines.next().unwrap();
        assert!(header.contains("\"ingredient\""));
        assert!(header.contains("\"nutrient-calories-energy\""));
        let row = lines.next().unwrap();
        assert!(row.contains("\"61 kcal\""));
        assert!(row.contains("\"3.28 g\""));
        // The null sodium slot is an empty cell, not a literal "null".
        assert!(!row.contains("null"));
        Ok(())
    }

    #[test]
    fn test_csv_sanitizes_double_quotes_in_reasoning() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv");
        save_results(&[record("milk", true)], &path, OutputFormat::Csv)?;
        let content = std::fs::read_to_string(&path)?;
        assert!(content.contains("a 'quoted' reason"));
        Ok(())
    }

    #[test]
    fn test_csv_debug_has_debug_columns() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out_debug.csv");
        save_results(&[record("milk", true)], &path, OutputFormat::CsvDebug)?;
        let content = std::fs::read_to_string(&path)?;
        let header = content.lines().next().unwrap();
        assert!(header.contains("\"tier_1_count\""));
        assert!(header.contains("\"top_semantic_desc_3\""));
        assert!(header.contains("\"attempt_2_success\""));
        assert!(header.contains("\"nutrient-protein\""));
        Ok(())
    }

    #[test]
    fn test_json_clean_drops_null_nutrients() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.json");
        save_results(&[record("milk", true)], &path, OutputFormat::JsonClean)?;

        let content = std::fs::read_to_string(&path)?;
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&content)?;
        assert_eq!(parsed.len(), 1);
        let nutrients = parsed[0]["nutrients"].as_object().unwrap();
        assert!(nutrients.contains_key("nutrient-calories-energy"));
        assert!(!nutrients.contains_key("nutrient-sodium"));
        assert!(parsed[0].get("debug").is_none());
        Ok(())
    }

    #[test]
    fn test_json_batch_summary_counts() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("batch.json");
        let records = vec![record("milk", true), record("unobtainium shake", false)];
        save_results(&records, &path, OutputFormat::JsonBatch)?;

        let content = std::fs::read_to_string(&path)?;
        let parsed: serde_json::Value = serde_json::from_str(&content)?;
        assert_eq!(parsed["summary"]["total"], 2);
        assert_eq!(parsed["summary"]["successful"], 1);
        assert_eq!(parsed["summary"]["failed"], 1);
        assert_eq!(
            parsed["failed_ingredients"],
            serde_json::json!(["unobtainium shake"])
        );
        Ok(())
    }

    #[test]
    fn test_json_debug_round_trips_full_records() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("debug.json");
        save_results(&[record("milk", true)], &path, OutputFormat::Json)?;

        let content = std::fs::read_to_string(&path)?;
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&content)?;
        assert_eq!(parsed[0]["flag"], "HIGH_CONFIDENCE");
        assert!(parsed[0]["debug"]["api_metrics"].is_object());
        // Null slots are preserved in the debug shape.
        assert!(parsed[0]["standardized_nutrients"]["nutrient-sodium"].is_null());
        Ok(())
    }
}
