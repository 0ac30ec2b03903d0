use anyhow::Result;
use clap::{Args, Subcommand};

use super::read::open_cache;
use super::{Ctx, table};

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// List cached chapters of a novel
    List { novel_id: String },
    /// Remove every cached chapter of a novel
    Clear { novel_id: String },
}

pub async fn run(args: CacheArgs, ctx: &Ctx) -> Result<()> {
    // Never fetches, so no session is needed
    let cache = open_cache(ctx, false).await;

    match args.action {
        CacheAction::List { novel_id } => {
            let mut entries = cache.get_window(&novel_id).await;
            if entries.is_empty() {
                ctx.progress
                    .println(format!("No cached chapters for {novel_id}"));
                return Ok(());
            }
            entries.sort_by_key(|e| e.sequence);

            let mut table = table(&["Key", "Chapter", "Title", "Size"]);
            for entry in &entries {
                table.add_row(vec![
                    entry.cache_key.clone(),
                    entry.sequence.to_string(),
                    entry.payload.title.clone(),
                    format!("{} B", entry.payload.body.len()),
                ]);
            }
            eprintln!("\n{table}");
        }
        CacheAction::Clear { novel_id } => {
            let removed = cache.clear(&novel_id).await;
            ctx.progress
                .println(format!("Removed {removed} cached chapters of {novel_id}"));
        }
    }
    Ok(())
}
