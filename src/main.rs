use anyhow::{Context, Result};
use std::path::Path;

use nutrition_mapper::cli::parse_args;
use nutrition_mapper::config::Config;
use nutrition_mapper::data_loader::load_ingredients;
use nutrition_mapper::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok(); // Load .env file for API keys

    let cli_args = parse_args();

    // Configuration problems are the only non-zero exits; processing
    // failures still complete with a summary.
    let config = Config::load()?;

    println!("Loading ingredients from {}...", cli_args.input);
    let ingredients = load_ingredients(Path::new(&cli_args.input), cli_args.input_format)
        .with_context(|| format!("Failed to load ingredients from '{}'", cli_args.input))?;
    println!("Loaded {} ingredients", ingredients.len());

    let mut orchestrator = Orchestrator::new(&config)
        .with_context(|| "Failed to initialize the mapping pipeline")?;

    let outcome = orchestrator
        .process_ingredients(
            ingredients,
            &cli_args.output,
            cli_args.format,
            cli_args.limit,
            cli_args.start_from,
        )
        .await?;

    println!("\n[COMPLETE] Processing finished!");
    println!("Output: {}", outcome.output_file.display());
    println!("Log: {}", outcome.log_file.display());

    Ok(())
}
