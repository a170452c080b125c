use anyhow::{Context, Result};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::catalog::types::FoodDetails;

const KJ_PER_KCAL: f64 = 4.184;

/// Catalog nutrient names mapped to the canonical nutrient IDs of the
/// definitions table.
const CATALOG_NUTRIENT_MAPPINGS: &[(&str, &str)] = &[
    // Core energy & macros
    ("Energy", "nutrient-calories-energy"),
    ("Energy (Atwater General Factors)", "nutrient-calories-energy"),
    ("Energy (Atwater Specific Factors)", "nutrient-calories-energy"),
    ("Protein", "nutrient-protein"),
    ("Total lipid (fat)", "nutrient-total-fat"),
    ("Carbohydrate, by difference", "nutrient-total-carbohydrates"),
    ("Fiber, total dietary", "nutrient-dietary-fiber"),
    ("Sugars, total including NLEA", "nutrient-total-sugars"),
    ("Sugars, added", "nutrient-added-sugars"),
    ("Water", "nutrient-water"),
    // Fat breakdown
    ("Fatty acids, total saturated", "nutrient-saturated-fat"),
    ("Fatty acids, total trans", "nutrient-trans-fat"),
    ("Fatty acids, total monounsaturated", "nutrient-monounsaturated-fat"),
    ("Fatty acids, total polyunsaturated", "nutrient-polyunsaturated-fat"),
    ("Cholesterol", "nutrient-cholesterol"),
    // Other components
    ("Alcohol, ethyl", "nutrient-alcohol"),
    ("Caffeine", "nutrient-caffeine"),
    ("Theobromine", "nutrient-theobromine"),
    ("Ash", "nutrient-ash"),
    // Vitamins - fat-soluble
    ("Vitamin A, RAE", "nutrient-vitamin-a-rae"),
    ("Retinol", "nutrient-retinol"),
    ("Vitamin D (D2 + D3)", "nutrient-vitamin-d"),
    ("Vitamin E (alpha-tocopherol)", "nutrient-vitamin-e-alpha-tocopherol"),
    ("Vitamin K (phylloquinone)", "nutrient-vitamin-k-phylloquinone"),
    // Vitamins - B-complex
    ("Thiamin", "nutrient-thiamin-b1"),
    ("Riboflavin", "nutrient-riboflavin-b2"),
    ("Niacin", "nutrient-niacin-b3"),
    ("Pantothenic acid", "nutrient-vitamin-b5-pantothenic-acid"),
    ("Vitamin B-6", "nutrient-vitamin-b6"),
    ("Folate, total", "nutrient-folate-folic-acid"),
    ("Folic acid", "nutrient-folate-folic-acid"),
    ("Vitamin B-12", "nutrient-vitamin-b12"),
    ("Choline, total", "nutrient-choline"),
    // Vitamin C
    ("Vitamin C, total ascorbic acid", "nutrient-vitamin-c-ascorbic-acid"),
    // Minerals - major
    ("Calcium, Ca", "nutrient-calcium"),
    ("Magnesium, Mg", "nutrient-magnesium"),
    ("Phosphorus, P", "nutrient-phosphorus"),
    ("Potassium, K", "nutrient-potassium"),
    ("Sodium, Na", "nutrient-sodium"),
    // Minerals - trace
    ("Iron, Fe", "nutrient-iron"),
    ("Zinc, Zn", "nutrient-zinc"),
    ("Copper, Cu", "nutrient-copper"),
    ("Selenium, Se", "nutrient-selenium"),
    ("Manganese, Mn", "nutrient-manganese"),
    ("Fluoride, F", "nutrient-fluoride"),
    // Carotenoids
    ("Beta-carotene", "nutrient-beta-carotene"),
    ("Carotene, beta", "nutrient-beta-carotene"),
    ("Alpha-carotene", "nutrient-alpha-carotene"),
    ("Carotene, alpha", "nutrient-alpha-carotene"),
    ("Cryptoxanthin, beta", "nutrient-cryptoxanthin"),
    ("Lycopene", "nutrient-lycopene"),
    ("Lutein + zeaxanthin", "nutrient-lutein-zeaxanthin"),
    // Fatty acids - saturated, by chain length
    ("4:0", "nutrient-sfa-4-0-butyric"),
    ("6:0", "nutrient-sfa-6-0-caproic"),
    ("8:0", "nutrient-sfa-8-0-caprylic"),
    ("10:0", "nutrient-sfa-10-0-capric"),
    ("12:0", "nutrient-sfa-12-0-lauric"),
    ("14:0", "nutrient-sfa-14-0-myristic"),
    ("16:0", "nutrient-sfa-16-0-palmitic"),
    ("18:0", "nutrient-sfa-18-0-stearic"),
    // Fatty acids - monounsaturated
    ("16:1", "nutrient-mufa-16-1-palmitoleic"),
    ("18:1", "nutrient-mufa-18-1-oleic"),
    ("20:1", "nutrient-mufa-20-1"),
    ("22:1", "nutrient-mufa-22-1"),
    // Fatty acids - polyunsaturated
    ("18:2 n-6 c,c", "nutrient-pufa-18-2-linoleic"),
    ("18:3 n-3 c,c,c (ALA)", "nutrient-pufa-18-3-alpha-linolenic"),
    ("18:4", "nutrient-pufa-18-4"),
    ("20:4 n-6", "nutrient-pufa-20-4-arachidonic"),
    ("20:5 n-3 (EPA)", "nutrient-pufa-20-5-epa"),
    ("22:5 n-3 (DPA)", "nutrient-pufa-22-5-dpa"),
    ("22:6 n-3 (DHA)", "nutrient-pufa-22-6-dha"),
    // Amino acids - essential
    ("Tryptophan", "nutrient-tryptophan"),
    ("Threonine", "nutrient-threonine"),
    ("Isoleucine", "nutrient-isoleucine"),
    ("Leucine", "nutrient-leucine"),
    ("Lysine", "nutrient-lysine"),
    ("Methionine", "nutrient-methionine"),
    ("Phenylalanine", "nutrient-phenylalanine"),
    ("Valine", "nutrient-valine"),
    // Amino acids - conditionally essential
    ("Arginine", "nutrient-arginine"),
    ("Histidine", "nutrient-histidine"),
    ("Cystine", "nutrient-cystine"),
    ("Tyrosine", "nutrient-tyrosine"),
    // Amino acids - non-essential
    ("Alanine", "nutrient-alanine"),
    ("Aspartic acid", "nutrient-aspartic-acid"),
    ("Glutamic acid", "nutrient-glutamic-acid"),
    ("Glycine", "nutrient-glycine"),
    ("Proline", "nutrient-proline"),
    ("Serine", "nutrient-serine"),
];

/// An emitted nutrient value, per 100 g.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NutrientValue {
    pub amount: f64,
    pub unit: String,
}

/// One row of the definitions table.
#[derive(Debug, Clone)]
pub struct NutrientDefinition {
    pub id: String,
    pub nutrient_name: String,
    pub category: String,
    pub unit_abbreviation: String,
}

/// A detail record reduced to the canonical nutrient row plus identifying
/// metadata. Values are per 100 g per catalog convention.
#[derive(Debug, Clone, Serialize)]
pub struct NutritionData {
    pub fdc_id: i64,
    pub description: String,
    pub data_type: String,
    pub brand_owner: Option<String>,
    pub standardized_nutrients: BTreeMap<String, Option<NutrientValue>>,
}

/// Maps heterogeneous catalog nutrient names onto the fixed canonical ID set.
/// The definitions table is read once at startup; the ID list and units are
/// immutable afterwards.
#[derive(Debug)]
pub struct NutrientNormalizer {
    ids: Vec<String>,
    name_map: HashMap<String, String>,
    lower_name_map: HashMap<String, String>,
}

impl NutrientNormalizer {
    pub fn load(definitions_path: &Path) -> Result<Self> {
        let definitions = load_nutrient_definitions(definitions_path)?;
        let mut ids: Vec<String> = definitions.iter().map(|d| d.id.clone()).collect();
        ids.sort();
        ids.dedup();

        let mut name_map = HashMap::new();
        let mut lower_name_map = HashMap::new();
        for (catalog_name, nutrient_id) in CATALOG_NUTRIENT_MAPPINGS {
            name_map.insert(catalog_name.to_string(), nutrient_id.to_string());
            lower_name_map.insert(catalog_name.to_lowercase(), nutrient_id.to_string());
        }

        Ok(Self {
            ids,
            name_map,
            lower_name_map,
        })
    }

    pub fn nutrient_ids(&self) -> &[String] {
        &self.ids
    }

    /// The all-null canonical row. Every Result Record carries this shape,
    /// including records with no accepted mapping.
    pub fn empty_row(&self) -> BTreeMap<String, Option<NutrientValue>> {
        self.ids.iter().map(|id| (id.clone(), None)).collect()
    }

    /// Resolve a catalog nutrient name: exact, then case-insensitive, then a
    /// conservative substring fallback for the most common nutrients.
    pub fn map_catalog_name(&self, catalog_name: &str) -> Option<&str> {
        if let Some(id) = self.name_map.get(catalog_name) {
            return Some(id);
        }
        let lower = catalog_name.to_lowercase();
        if let Some(id) = self.lower_name_map.get(&lower) {
            return Some(id);
        }

        if lower.contains("energy") || lower.contains("calorie") {
            return Some("nutrient-calories-energy");
        }
        if lower.contains("protein") {
            return Some("nutrient-protein");
        }
        if lower.contains("fat") && lower.contains("total") {
            return Some("nutrient-total-fat");
        }
        if lower.contains("carbohydrate") {
            return Some("nutrient-total-carbohydrates");
        }
        if lower.contains("fiber") || lower.contains("fibre") {
            return Some("nutrient-dietary-fiber");
        }
        if lower.contains("sugar") {
            return Some("nutrient-total-sugars");
        }
        if lower.contains("sodium") {
            return Some("nutrient-sodium");
        }
        if lower.contains("calcium") {
            return Some("nutrient-calcium");
        }
        if lower.contains("iron") {
            return Some("nutrient-iron");
        }
        if lower.contains("vitamin c") || lower.contains("ascorbic") {
            return Some("nutrient-vitamin-c-ascorbic-acid");
        }

        None
    }

    /// Normalize a detail record into the canonical row. Unmappable names are
    /// dropped (the fixed output shape has no slot for them); zero amounts are
    /// kept; kilojoule energy is converted to kilocalories.
    pub fn normalize(&self, details: &FoodDetails) -> NutritionData {
        let mut standardized = self.empty_row();
        let mut energy_was_converted = false;

        for entry in &details.food_nutrients {
            let Some(name) = entry.nutrient_name() else {
                continue;
            };
            let Some(amount) = entry.amount else {
                continue;
            };
            let Some(nutrient_id) = self.map_catalog_name(name) else {
                continue;
            };
            let Some(slot) = standardized.get_mut(nutrient_id) else {
                continue;
            };

            let unit = entry.unit();
            let is_kilojoule = unit.to_lowercase().contains("kj");
            let value = if nutrient_id == "nutrient-calories-energy" && is_kilojoule {
                NutrientValue {
                    amount: amount / KJ_PER_KCAL,
                    unit: "kcal".to_string(),
                }
            } else {
                NutrientValue {
                    amount,
                    unit: unit.to_string(),
                }
            };

            let is_energy = nutrient_id == "nutrient-calories-energy";
            match slot {
                // A native-kcal energy entry supersedes a converted one;
                // otherwise the first occurrence wins.
                Some(existing) if is_energy && energy_was_converted && !is_kilojoule => {
                    *existing = value;
                    energy_was_converted = false;
                }
                Some(_) => {}
                None => {
                    *slot = Some(value);
                    if is_energy && is_kilojoule {
                        energy_was_converted = true;
                    }
                }
            }
        }

        NutritionData {
            fdc_id: details.fdc_id,
            description: details.description.clone(),
            data_type: details.data_type.clone(),
            brand_owner: details.brand_owner.clone(),
            standardized_nutrients: standardized,
        }
    }
}

fn load_nutrient_definitions(path: &Path) -> Result<Vec<NutrientDefinition>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open nutrient definitions at {:?}", path))?;
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers = rdr.headers()?.clone();
    let id_idx = column_index(&headers, "id")?;
    let name_idx = column_index(&headers, "nutrient_name")?;
    let category_idx = column_index(&headers, "category")?;
    let unit_abbr_idx = column_index(&headers, "unit_abbreviation")?;

    let mut definitions = Vec::new();
    for (row_index, result) in rdr.records().enumerate() {
        let record = result
            .with_context(|| format!("Failed to read definitions row at index {}", row_index))?;
        let id = record.get(id_idx).unwrap_or("").trim().to_string();
        if id.is_empty() {
            continue;
        }
        definitions.push(NutrientDefinition {
            id,
            nutrient_name: record.get(name_idx).unwrap_or("").trim().to_string(),
            category: record.get(category_idx).unwrap_or("").trim().to_string(),
            unit_abbreviation: record.get(unit_abbr_idx).unwrap_or("").trim().to_string(),
        });
    }

    if definitions.is_empty() {
        anyhow::bail!("No nutrient definitions loaded from {:?}", path);
    }

    Ok(definitions)
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| anyhow::anyhow!("Column '{}' not found in nutrient definitions", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn definitions_file() -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "id,nutrient_name,category,subcategory,unit_name,unit_abbreviation")?;
        writeln!(file, "nutrient-calories-energy,Calories,Macronutrients,Energy,kilocalorie,kcal")?;
        writeln!(file, "nutrient-protein,Protein,Macronutrients,Protein,gram,g")?;
        writeln!(file, "nutrient-total-fat,Total Fat,Macronutrients,Fats,gram,g")?;
        writeln!(file, "nutrient-sodium,Sodium,Minerals,Major,milligram,mg")?;
        writeln!(file, "nutrient-calcium,Calcium,Minerals,Major,milligram,mg")?;
        file.flush()?;
        Ok(file)
    }

    fn details_json(nutrients: serde_json::Value) -> FoodDetails {
        serde_json::from_value(serde_json::json!({
            "fdcId": 746782,
            "description": "Milk, whole",
            "dataType": "Foundation",
            "foodNutrients": nutrients,
        }))
        .unwrap()
    }

    #[test]
    fn test_every_id_present_even_when_null() -> Result<()> {
        let file = definitions_file()?;
        let normalizer = NutrientNormalizer::load(file.path())?;
        let details = details_json(serde_json::json!([
            {"nutrient": {"name": "Protein", "unitName": "g"}, "amount": 3.28}
        ]));
        let data = normalizer.normalize(&details);
        assert_eq!(data.standardized_nutrients.len(), 5);
        assert!(data.standardized_nutrients["nutrient-calories-energy"].is_none());
        assert_eq!(
            data.standardized_nutrients["nutrient-protein"],
            Some(NutrientValue {
                amount: 3.28,
                unit: "g".to_string()
            })
        );
        Ok(())
    }

    #[test]
    fn test_zero_amounts_are_kept() -> Result<()> {
        let file = definitions_file()?;
        let normalizer = NutrientNormalizer::load(file.path())?;
        let details = details_json(serde_json::json!([
            {"nutrient": {"name": "Sodium, Na", "unitName": "mg"}, "amount": 0.0}
        ]));
        let data = normalizer.normalize(&details);
        assert_eq!(
            data.standardized_nutrients["nutrient-sodium"],
            Some(NutrientValue {
                amount: 0.0,
                unit: "mg".to_string()
            })
        );
        Ok(())
    }

    #[test]
    fn test_kilojoules_converted_to_kilocalories() -> Result<()> {
        let file = definitions_file()?;
        let normalizer = NutrientNormalizer::load(file.path())?;
        let details = details_json(serde_json::json!([
            {"nutrient": {"name": "Energy", "unitName": "kJ"}, "amount": 255.2}
        ]));
        let data = normalizer.normalize(&details);
        let energy = data.standardized_nutrients["nutrient-calories-energy"]
            .as_ref()
            .unwrap();
        assert!((energy.amount - 61.0).abs() < 0.01);
        assert_eq!(energy.unit, "kcal");
        Ok(())
    }

    #[test]
    fn test_native_kcal_supersedes_converted_kj() -> Result<()> {
        let file = definitions_file()?;
        let normalizer = NutrientNormalizer::load(file.path())?;
        let details = details_json(serde_json::json!([
            {"nutrient": {"name": "Energy", "unitName": "kJ"}, "amount": 255.2},
            {"nutrient": {"name": "Energy (Atwater General Factors)", "unitName": "kcal"}, "amount": 61.3}
        ]));
        let data = normalizer.normalize(&details);
        let energy = data.standardized_nutrients["nutrient-calories-energy"]
            .as_ref()
            .unwrap();
        assert_eq!(energy.amount, 61.3);
        Ok(())
    }

    #[test]
    fn test_case_insensitive_and_substring_fallback() -> Result<()> {
        let file = definitions_file()?;
        let normalizer = NutrientNormalizer::load(file.path())?;
        assert_eq!(
            normalizer.map_catalog_name("CALCIUM, CA"),
            Some("nutrient-calcium")
        );
        assert_eq!(
            normalizer.map_catalog_name("Energy, gross"),
            Some("nutrient-calories-energy")
        );
        assert_eq!(normalizer.map_catalog_name("Xanthophyll, other"), None);
        Ok(())
    }

    #[test]
    fn test_unmappable_names_silently_dropped() -> Result<()> {
        let file = definitions_file()?;
        let normalizer = NutrientNormalizer::load(file.path())?;
        let details = details_json(serde_json::json!([
            {"nutrient": {"name": "Phytoene", "unitName": "mg"}, "amount": 1.5}
        ]));
        let data = normalizer.normalize(&details);
        assert!(data.standardized_nutrients.values().all(|v| v.is_none()));
        Ok(())
    }

    #[test]
    fn test_missing_definitions_file_is_fatal() {
        let result = NutrientNormalizer::load(Path::new("no_such_definitions.csv"));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_column_is_fatal() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "identifier,nutrient_name,category,subcategory,unit_name,unit_abbreviation")?;
        writeln!(file, "nutrient-protein,Protein,Macronutrients,Protein,gram,g")?;
        file.flush()?;
        let result = NutrientNormalizer::load(file.path());
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Column 'id' not found"));
        Ok(())
    }
}
