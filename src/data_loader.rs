use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::cli::InputFormat;

const INGREDIENT_COLUMNS: &[&str] = &["ingredient", "name", "food", "item", "ingredients"];

/// Universal ingredient loader for CSV, TXT and JSON inputs, with format
/// auto-detection by extension and then content.
pub fn load_ingredients(path: &Path, format: InputFormat) -> Result<Vec<String>> {
    if !path.exists() {
        bail!("Could not find input file: {:?}", path);
    }

    let format = match format {
        InputFormat::Auto => detect_format(path)?,
        other => other,
    };

    match format {
        InputFormat::Csv => parse_csv(path),
        InputFormat::Txt => parse_txt(path),
        InputFormat::Json => parse_json(path),
        InputFormat::Auto => unreachable!("auto resolved above"),
    }
}

fn detect_format(path: &Path) -> Result<InputFormat> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("csv") => return Ok(InputFormat::Csv),
        Some("txt") | Some("text") => return Ok(InputFormat::Txt),
        Some("json") => return Ok(InputFormat::Json),
        _ => {}
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file {:?}", path))?;
    let first_line = content.lines().next().unwrap_or("").trim();

    if (first_line.starts_with('[') || first_line.starts_with('{'))
        && serde_json::from_str::<serde_json::Value>(&content).is_ok()
    {
        return Ok(InputFormat::Json);
    }
    if first_line.contains(',') {
        return Ok(InputFormat::Csv);
    }
    Ok(InputFormat::Txt)
}

/// Parse a CSV file, looking for an ingredient-like column (falling back to
/// the first column).
fn parse_csv(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open CSV input at {:?}", path))?;
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers = rdr.headers()?.clone();
    let column_idx = INGREDIENT_COLUMNS
        .iter()
        .find_map(|col| headers.iter().position(|h| h.to_lowercase() == *col))
        .or(if headers.is_empty() { None } else { Some(0) });

    let Some(column_idx) = column_idx else {
        bail!("Could not find ingredient column in CSV file");
    };

    let mut ingredients = Vec::new();
    for result in rdr.records() {
        let record = result?;
        if let Some(value) = record.get(column_idx) {
            let value = value.trim();
            if !value.is_empty() {
                ingredients.push(value.to_string());
            }
        }
    }
    Ok(ingredients)
}

/// One ingredient per line; `#` and `//` comments (full-line and inline) are
/// stripped, as is an optional single-word header.
fn parse_txt(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read text input at {:?}", path))?;
    let mut lines = content.lines().peekable();

    if let Some(first) = lines.peek() {
        if INGREDIENT_COLUMNS.contains(&first.trim().to_lowercase().as_str()) {
            lines.next();
        }
    }

    let mut ingredients = Vec::new();
    for line in lines {
        let mut line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = line[..idx].trim();
        }
        if let Some(idx) = line.find("//") {
            line = line[..idx].trim();
        }
        if !line.is_empty() {
            ingredients.push(line.to_string());
        }
    }
    Ok(ingredients)
}

/// Accepts a plain string array, an array of objects, or an object wrapping
/// one of those under a known key.
fn parse_json(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON input at {:?}", path))?;
    let data: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON input at {:?}", path))?;

    let items = match &data {
        serde_json::Value::Array(items) => Some(items),
        serde_json::Value::Object(map) => ["ingredients", "data", "items", "foods", "names", "list"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_array())),
        _ => None,
    };

    let Some(items) = items else {
        return Ok(Vec::new());
    };

    let mut ingredients = Vec::new();
    for item in items {
        match item {
            serde_json::Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    ingredients.push(s.to_string());
                }
            }
            serde_json::Value::Object(obj) => {
                if let Some(name) = extract_ingredient_from_object(obj) {
                    ingredients.push(name);
                }
            }
            _ => {}
        }
    }
    Ok(ingredients)
}

fn extract_ingredient_from_object(obj: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    for field in INGREDIENT_COLUMNS {
        for (key, value) in obj {
            if key.to_lowercase() == *field {
                if let Some(s) = value.as_str() {
                    let s = s.trim();
                    if !s.is_empty() {
                        return Some(s.to_string());
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn temp_file(suffix: &str, content: &str) -> Result<tempfile::NamedTempFile> {
        let mut file = Builder::new().suffix(suffix).tempfile()?;
        write!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn test_csv_with_ingredient_column() -> Result<()> {
        let file = temp_file(".csv", "id,ingredient,notes\n1,milk,dairy\n2,jasmine rice,\n3,,\n")?;
        let ingredients = load_ingredients(file.path(), InputFormat::Auto)?;
        assert_eq!(ingredients, vec!["milk", "jasmine rice"]);
        Ok(())
    }

    #[test]
    fn test_csv_falls_back_to_first_column() -> Result<()> {
        let file = temp_file(".csv", "thing,amount\nsalt,1\npepper,2\n")?;
        let ingredients = load_ingredients(file.path(), InputFormat::Csv)?;
        assert_eq!(ingredients, vec!["salt", "pepper"]);
        Ok(())
    }

    #[test]
    fn test_txt_strips_comments_and_header() -> Result<()> {
        let file = temp_file(
            ".txt",
            "ingredient\nmilk\n# a comment\ntzatziki  // greek dip\n\nsmoked paprika # nice\n",
        )?;
        let ingredients = load_ingredients(file.path(), InputFormat::Auto)?;
        assert_eq!(ingredients, vec!["milk", "tzatziki", "smoked paprika"]);
        Ok(())
    }

    #[test]
    fn test_json_string_array() -> Result<()> {
        let file = temp_file(".json", r#"["milk", "  cinnamon sticks ", ""]"#)?;
        let ingredients = load_ingredients(file.path(), InputFormat::Auto)?;
        assert_eq!(ingredients, vec!["milk", "cinnamon sticks"]);
        Ok(())
    }

    #[test]
    fn test_json_object_array_and_wrapper_keys() -> Result<()> {
        let file = temp_file(
            ".json",
            r#"{"ingredients": [{"name": "milk"}, {"ingredient": "tzatziki"}, {"amount": 3}]}"#,
        )?;
        let ingredients = load_ingredients(file.path(), InputFormat::Json)?;
        assert_eq!(ingredients, vec!["milk", "tzatziki"]);
        Ok(())
    }

    #[test]
    fn test_content_detection_without_extension() -> Result<()> {
        let json = temp_file("", r#"["milk"]"#)?;
        assert_eq!(load_ingredients(json.path(), InputFormat::Auto)?, vec!["milk"]);

        let txt = temp_file("", "milk\neggs\n")?;
        assert_eq!(
            load_ingredients(txt.path(), InputFormat::Auto)?,
            vec!["milk", "eggs"]
        );
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = load_ingredients(Path::new("no_such_input.csv"), InputFormat::Auto);
        assert!(result.is_err());
    }
}
