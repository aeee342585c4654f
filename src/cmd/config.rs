//! Configuration view and validation commands — `shopfloor config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use shopfloor::config::{CONFIG_DIR, CONFIG_FILE, ShopfloorConfig, ShopfloorToml};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Shopfloor Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ShopfloorToml::load(&config_path)?
            } else {
                println!("No shopfloor.toml found at {}", config_path.display());
                println!("Using default configuration:");
                ShopfloorToml::default()
            };
            println!();

            println!("[session]");
            println!("  machine_id = \"{}\"", toml.session.machine_id);
            println!("  operator_id = \"{}\"", toml.session.operator_id);
            println!("  tick_interval_ms = {}", toml.session.tick_interval_ms);
            println!();
            println!("[remote]");
            println!("  timeout_ms = {}", toml.remote.timeout_ms);
            println!("  max_write_attempts = {}", toml.remote.max_write_attempts);
            println!();
            println!("[[shifts]]");
            for shift in &toml.shifts {
                println!(
                    "  {} = {:02}:00-{:02}:00",
                    shift.label, shift.start_hour, shift.end_hour
                );
            }
            println!();

            // Effective values include environment overrides
            let config = ShopfloorConfig::new(project_dir.to_path_buf())?;
            println!("Effective values (with env overrides):");
            println!("  machine_id = \"{}\"", config.toml.session.machine_id);
            println!("  operator_id = \"{}\"", config.toml.session.operator_id);
            println!("  timeout_ms = {}", config.toml.remote.timeout_ms);
            println!("  cache_dir = {}", config.cache_dir().display());
            println!();
            if !config_path.exists() {
                println!("Run 'shopfloor config init' to create a shopfloor.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No shopfloor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ShopfloorToml::load(&config_path)?;
            let warnings = toml.validate();

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
                println!("shopfloor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)?;
            }

            let toml = ShopfloorToml::default();
            toml.save(&config_path)?;

            println!("Created shopfloor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [session] machine_id, operator_id, tick_interval_ms");
            println!("  - [remote] timeout_ms, max_write_attempts");
            println!("  - [[shifts]] label, start_hour, end_hour");
            println!();
        }
    }

    Ok(())
}
