//! `sagaflow config`: print the effective engine configuration.

use anyhow::Result;
use console::style;

use crate::state::AppState;

pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&state.config)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Config:").bold(),
        style(state.config_path.display()).dim()
    );
    println!();
    println!("{}", toml::to_string_pretty(&state.config)?);
    Ok(())
}
