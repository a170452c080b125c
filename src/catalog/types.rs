use serde::{Deserialize, Deserializer, Serialize};

/// One row of a `/foods/search` response.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SearchFood {
    pub fdc_id: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default, deserialize_with = "deserialize_food_category")]
    pub food_category: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub foods: Vec<SearchFood>,
}

/// A fused search candidate flowing through the pipeline. Created by the
/// multi-tier searcher; the later stages only add score annotations.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub fdc_id: i64,
    pub description: String,
    pub data_type: String,
    pub food_category: String,
    pub search_tier: u8,
    pub relevance_score: f32,
    pub semantic_score: Option<f32>,
    pub semantic_reasoning: Option<String>,
    pub nutritional_score: Option<f32>,
    pub nutritional_reasoning: Option<String>,
    pub key_differences: Vec<String>,
}

impl Candidate {
    pub fn from_search(food: SearchFood, tier: u8) -> Self {
        Self {
            fdc_id: food.fdc_id,
            description: food.description,
            data_type: food.data_type,
            food_category: food.food_category,
            search_tier: tier,
            relevance_score: 0.0,
            semantic_score: None,
            semantic_reasoning: None,
            nutritional_score: None,
            nutritional_reasoning: None,
            key_differences: Vec::new(),
        }
    }
}

/// A `/food/{fdc_id}` detail record. Only the fields the pipeline consumes.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FoodDetails {
    pub fdc_id: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub brand_owner: Option<String>,
    #[serde(default)]
    pub food_nutrients: Vec<FoodNutrientEntry>,
}

/// Detail-record nutrient entries come in two shapes: the usual nested
/// `{nutrient: {name, unitName}, amount}` and an occasional flattened
/// `{name, unitName, amount}`.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FoodNutrientEntry {
    #[serde(default)]
    pub nutrient: Option<NutrientInfo>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit_name: Option<String>,
}

impl FoodNutrientEntry {
    pub fn nutrient_name(&self) -> Option<&str> {
        self.nutrient
            .as_ref()
            .map(|n| n.name.as_str())
            .or(self.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    pub fn unit(&self) -> &str {
        self.nutrient
            .as_ref()
            .map(|n| n.unit_name.as_str())
            .or(self.unit_name.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NutrientInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unit_name: String,
}

/// `foodCategory` is a plain string on most search rows but an object with a
/// `description` on others. Accept both.
fn deserialize_food_category<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CategoryField {
        Plain(String),
        Object { description: Option<String> },
    }

    Ok(match Option::<CategoryField>::deserialize(deserializer)? {
        Some(CategoryField::Plain(s)) => s,
        Some(CategoryField::Object { description }) => description.unwrap_or_default(),
        None => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_food_with_string_category() {
        let json = r#"{"fdcId": 746782, "description": "Milk, whole", "dataType": "Foundation", "foodCategory": "Dairy and Egg Products"}"#;
        let food: SearchFood = serde_json::from_str(json).unwrap();
        assert_eq!(food.fdc_id, 746782);
        assert_eq!(food.food_category, "Dairy and Egg Products");
    }

    #[test]
    fn test_search_food_with_object_category() {
        let json = r#"{"fdcId": 2705448, "description": "Tzatziki dip", "dataType": "Survey (FNDDS)", "foodCategory": {"description": "Dips"}}"#;
        let food: SearchFood = serde_json::from_str(json).unwrap();
        assert_eq!(food.food_category, "Dips");
    }

    #[test]
    fn test_search_food_without_category() {
        let json = r#"{"fdcId": 12345, "description": "Salt, table"}"#;
        let food: SearchFood = serde_json::from_str(json).unwrap();
        assert_eq!(food.food_category, "");
        assert_eq!(food.data_type, "");
    }

    #[test]
    fn test_nutrient_entry_nested_shape() {
        let json = r#"{"nutrient": {"name": "Protein", "unitName": "g"}, "amount": 3.28}"#;
        let entry: FoodNutrientEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.nutrient_name(), Some("Protein"));
        assert_eq!(entry.unit(), "g");
        assert_eq!(entry.amount, Some(3.28));
    }

    #[test]
    fn test_nutrient_entry_flat_shape() {
        let json = r#"{"name": "Energy", "unitName": "kcal", "amount": 61.0}"#;
        let entry: FoodNutrientEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.nutrient_name(), Some("Energy"));
        assert_eq!(entry.unit(), "kcal");
    }

    #[test]
    fn test_details_with_missing_nutrients() {
        let json = r#"{"fdcId": 746782, "description": "Milk, whole", "dataType": "Foundation"}"#;
        let details: FoodDetails = serde_json::from_str(json).unwrap();
        assert!(details.food_nutrients.is_empty());
        assert!(details.brand_owner.is_none());
    }
}
