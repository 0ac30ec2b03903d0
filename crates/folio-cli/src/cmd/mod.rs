pub mod auth;
pub mod cache;
pub mod import;
pub mod read;

use std::sync::Arc;

use anyhow::Result;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use folio_client::{HttpApi, SessionFile, SessionManager};
use folio_core::ProgressContext;

use crate::config::Config;

/// Everything a command needs: configuration, the session and the terminal.
pub struct Ctx {
    pub config: Config,
    pub manager: SessionManager,
    pub progress: Arc<ProgressContext>,
}

impl Ctx {
    pub async fn new(config: Config, progress: Arc<ProgressContext>) -> Result<Self> {
        let api = HttpApi::new(&config.api.base_url)?;
        let manager = SessionManager::new(
            Arc::new(api),
            config.session_config(),
            Some(SessionFile::new(&config.session.file)),
        );
        if let Err(e) = manager.restore().await {
            log::warn!("Ignoring saved session: {e}");
        }
        Ok(Self {
            config,
            manager,
            progress,
        })
    }
}

/// Table with the house style and a cyan header row.
pub fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

pub fn show_config(config: &Config) {
    let mut table = table(&["Setting", "Value"]);

    table.add_row(vec!["API base URL", &config.api.base_url]);
    table.add_row(vec![
        "Token lifetime",
        &format!(
            "{}s (refresh {}s early)",
            config.session.lifetime_secs, config.session.lead_secs
        ),
    ]);
    table.add_row(vec![
        "Session file",
        &config.session.file.display().to_string(),
    ]);
    table.add_row(vec!["Cache directory", &config.cache.dir.display().to_string()]);
    table.add_row(vec!["Prefetch window", &config.cache.window.to_string()]);
    table.add_row(vec![
        "Status throttle",
        &format!("{}ms", config.import.status_throttle_ms),
    ]);

    eprintln!("\n{table}");
}
