//! Configuration view and validation commands: `recast config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use recast::config::{CONFIG_FILE, RecastConfig, RecastToml, get_recast_dir};

    let recast_dir = get_recast_dir(project_dir);
    let config_path = recast_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Recast Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();

                let toml = RecastToml::load(&config_path)?;
                print_toml(&toml);

                // Effective values (including env overrides)
                println!("Effective values (with env/CLI overrides):");
                let config = RecastConfig::new(project_dir.to_path_buf())?;
                println!("  url = \"{}\"", config.url().unwrap_or_default());
                println!("  anon_key = \"{}\"", mask(config.anon_key().as_deref()));
                println!("  log_filter = \"{}\"", config.log_filter());
                println!();
            } else {
                println!("No recast.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                print_toml(&RecastToml::default());
                println!("Run 'recast config init' to create a recast.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No recast.toml found. Checking defaults and environment.");
            }
            let warnings = RecastConfig::new(project_dir.to_path_buf())?.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("recast.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !recast_dir.exists() {
                std::fs::create_dir_all(&recast_dir)?;
            }

            let toml = RecastToml::default();
            toml.save(&config_path)?;

            println!("Created recast.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [backend] url, anon_key, schema");
            println!("  - [auth] provider, redirect_url, logout_url");
            println!("  - [logging] level, json, file");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &recast::config::RecastToml) {
    println!("[backend]");
    println!("  url = \"{}\"", toml.backend.url.as_deref().unwrap_or_default());
    println!("  anon_key = \"{}\"", mask(toml.backend.anon_key.as_deref()));
    println!("  schema = \"{}\"", toml.backend.schema);
    println!();

    println!("[auth]");
    println!("  provider = \"{}\"", toml.auth.provider);
    println!("  redirect_url = \"{}\"", toml.auth.redirect_url);
    if let Some(url) = &toml.auth.logout_url {
        println!("  logout_url = \"{}\"", url);
    }
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  json = {}", toml.logging.json);
    println!("  file = {}", toml.logging.file);
    println!();
}

/// Show only the first characters of a key.
fn mask(key: Option<&str>) -> String {
    match key {
        None | Some("") => String::new(),
        Some(key) if key.chars().count() <= 8 => "****".to_string(),
        Some(key) => format!("{}****", key.chars().take(6).collect::<String>()),
    }
}
