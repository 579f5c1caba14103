//! `recast bundle import`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use recast::import::load_definitions;

use super::super::BundleCommands;
use super::client::Client;

pub async fn cmd_bundle(project_dir: &Path, verbose: bool, command: BundleCommands) -> Result<()> {
    match command {
        BundleCommands::Import { path } => {
            // Parse before connecting so a bad file fails fast.
            let (name, definitions) = load_definitions(&path)
                .with_context(|| format!("Failed to load bundle from {}", path.display()))?;
            let steps: usize = definitions.iter().map(|d| d.steps.len()).sum();

            let client = Client::signed_in(project_dir, verbose).await?;

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner.set_message(format!("Importing bundle '{}'...", name));

            let result = client
                .facades
                .bundles
                .save_processes_as_bundle(&name, &definitions)
                .await;
            spinner.finish_and_clear();

            let bundle = result.with_context(|| format!("Failed to import bundle '{}'", name))?;
            println!(
                "{} bundle '{}' (#{}): {} processes, {} steps",
                console::style("Imported").green(),
                bundle.name,
                bundle.id.unwrap_or_default(),
                definitions.len(),
                steps
            );
        }
    }
    Ok(())
}
