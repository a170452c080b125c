use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about = "USDA nutrition fetcher with semantic verification and nutritional similarity scoring", long_about = None)]
pub struct Cli {
    /// Input file with ingredients (CSV, TXT, or JSON)
    #[arg(short, long)]
    pub input: String,

    /// Input file format (auto-detect if not specified)
    #[arg(long, value_enum, default_value_t = InputFormat::Auto)]
    pub input_format: InputFormat,

    /// Output file path (a timestamp is appended to the stem)
    #[arg(short, long, default_value = "nutrition_data.csv")]
    pub output: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
    pub format: OutputFormat,

    /// Limit the number of ingredients to process
    #[arg(long)]
    pub limit: Option<usize>,

    /// Start from this ingredient index
    #[arg(long, default_value_t = 0)]
    pub start_from: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Auto,
    Csv,
    Txt,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Alias for csv-standard
    Csv,
    CsvStandard,
    CsvDebug,
    /// Alias for json-debug
    Json,
    JsonClean,
    JsonDebug,
    JsonBatch,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["nutrition_mapper", "--input", "ingredients.csv"]);
        assert_eq!(cli.input, "ingredients.csv");
        assert_eq!(cli.input_format, InputFormat::Auto);
        assert_eq!(cli.format, OutputFormat::Csv);
        assert_eq!(cli.output, "nutrition_data.csv");
        assert_eq!(cli.start_from, 0);
        assert!(cli.limit.is_none());
    }

    #[test]
    fn test_kebab_case_format_values() {
        let cli = Cli::parse_from([
            "nutrition_mapper",
            "--input",
            "in.txt",
            "--input-format",
            "txt",
            "--format",
            "json-batch",
            "--limit",
            "25",
            "--start-from",
            "10",
        ]);
        assert_eq!(cli.input_format, InputFormat::Txt);
        assert_eq!(cli.format, OutputFormat::JsonBatch);
        assert_eq!(cli.limit, Some(25));
        assert_eq!(cli.start_from, 10);
    }
}
