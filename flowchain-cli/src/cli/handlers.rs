//! Configuration and logging for the CLI

use anyhow::{Context, Result};
use flowchain_core::models::{Configuration, LogLevel, MAX_DETACH_BATCH_SIZE};
use flowchain_core::services::init_logging;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Expand a leading `~/`, or fall back to the XDG default when no path is given
pub fn resolve_config_path(config_file: Option<&str>) -> Result<PathBuf> {
    match config_file {
        Some(path) if path.starts_with("~/") => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(&path[2..]))
        }
        Some(path) => Ok(PathBuf::from(path)),
        None => Configuration::default_config_path(),
    }
}

pub fn load_configuration(config_file: Option<&str>) -> Result<Configuration> {
    let path = resolve_config_path(config_file)?;
    let config = Configuration::load_from_file(&path)?;
    if let Err(errors) = config.validate() {
        anyhow::bail!(
            "Invalid configuration in {}:\n  {}",
            path.display(),
            errors.join("\n  ")
        );
    }
    Ok(config)
}

pub fn init_cli_logging(config: &Configuration) -> Result<()> {
    init_logging(config.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

fn read_user_input_sync() -> Result<String> {
    let mut input = String::new();
    io::stdin()
        .lock()
        .read_line(&mut input)
        .context("Failed to read from stdin")?;
    Ok(input)
}

/// Ask one question; an empty answer keeps `current`
fn prompt(question: &str, current: &str) -> Result<Option<String>> {
    print!("{} [{}]: ", question, current);
    io::stdout().flush()?;
    let answer = read_user_input_sync()?;
    let answer = answer.trim();
    Ok((!answer.is_empty()).then(|| answer.to_string()))
}

fn parse_log_level(value: &str) -> Option<LogLevel> {
    match value.to_ascii_lowercase().as_str() {
        "error" => Some(LogLevel::Error),
        "warn" => Some(LogLevel::Warn),
        "info" => Some(LogLevel::Info),
        "debug" => Some(LogLevel::Debug),
        "trace" => Some(LogLevel::Trace),
        _ => None,
    }
}

fn log_level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

fn ask_settings(config: &mut Configuration) -> Result<()> {
    println!("\nPlease answer the following questions (press Enter to keep the value):\n");

    if let Some(level) = prompt("Log level (error, warn, info, debug, trace)", log_level_name(config.log_level))? {
        match parse_log_level(&level) {
            Some(level) => config.log_level = level,
            None => println!("Invalid log level, keeping {}", log_level_name(config.log_level)),
        }
    }

    let store = config.resolved_store_path()?;
    if let Some(path) = prompt("State store file", &store.display().to_string())? {
        config.store_path = Some(PathBuf::from(path));
    }

    if let Some(size) = prompt(
        &format!("Detach batch size (1-{})", MAX_DETACH_BATCH_SIZE),
        &config.detach_batch_size.to_string(),
    )? {
        match size.parse::<usize>() {
            Ok(size) if (1..=MAX_DETACH_BATCH_SIZE).contains(&size) => config.detach_batch_size = size,
            _ => println!("Invalid batch size, keeping {}", config.detach_batch_size),
        }
    }

    if let Some(interval) = prompt(
        "Termination poll interval in milliseconds",
        &config.termination_poll_interval_ms.to_string(),
    )? {
        match interval.parse::<u64>() {
            Ok(interval) if interval > 0 => config.termination_poll_interval_ms = interval,
            _ => println!("Invalid interval, keeping {}", config.termination_poll_interval_ms),
        }
    }

    if let Some(attempts) = prompt(
        "Termination poll attempts",
        &config.termination_max_attempts.to_string(),
    )? {
        match attempts.parse::<u32>() {
            Ok(attempts) if attempts > 0 => config.termination_max_attempts = attempts,
            _ => println!("Invalid attempt count, keeping {}", config.termination_max_attempts),
        }
    }

    if let Some(resume) = prompt(
        "Resume unfinished chains on start (yes/no)",
        if config.chain_resume_on_start { "yes" } else { "no" },
    )? {
        config.chain_resume_on_start = matches!(resume.to_ascii_lowercase().as_str(), "y" | "yes" | "true");
    }

    Ok(())
}

/// Handle `config --init`
pub fn handle_config_init(config_file: Option<String>, defaults: bool) -> Result<()> {
    println!("Initializing flowchain configuration");
    println!("====================================");

    let config_path = resolve_config_path(config_file.as_deref())?;
    println!("Config file: {}", config_path.display());

    let mut config = if config_path.exists() {
        println!("Configuration file already exists. Loading existing values...");
        Configuration::load_from_file(&config_path)?
    } else {
        println!("Creating new configuration with defaults...");
        Configuration::default()
    };

    if !defaults {
        ask_settings(&mut config)?;
    }

    if let Err(errors) = config.validate() {
        anyhow::bail!("Configuration is invalid:\n  {}", errors.join("\n  "));
    }

    config.save_to_file(&config_path)?;
    println!("\nConfiguration saved to {}", config_path.display());
    Ok(())
}
