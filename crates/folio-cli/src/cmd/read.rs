use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use folio_client::{Chapter, HttpContentSource};
use folio_store::{CacheEntry, ChapterWindowCache, derived_progress};

use super::{Ctx, table};

#[derive(Args)]
pub struct ReadArgs {
    /// Novel identifier on the server
    pub novel_id: String,

    /// Chapter number to read
    pub chapter: u32,

    /// Chapters to keep cached ahead of this one (default: from config)
    #[arg(long)]
    pub window: Option<u32>,

    /// Print the chapter body to stdout
    #[arg(long)]
    pub print: bool,
}

/// Cache over the configured directory.
pub(crate) async fn open_cache(ctx: &Ctx, authorized: bool) -> ChapterWindowCache<Chapter> {
    let source = Arc::new(HttpContentSource::new(ctx.manager.clone(), authorized));
    ChapterWindowCache::open(&ctx.config.cache.dir, source).await
}

pub async fn run(args: ReadArgs, ctx: &Ctx) -> Result<()> {
    let window = args.window.unwrap_or(ctx.config.cache.window);
    // Chapters are public; send credentials only when a session exists
    let authorized = ctx.manager.ensure_session().await;
    let cache = open_cache(ctx, authorized).await;

    let spinner = ctx.progress.spinner("prefetch");
    spinner.set_message(format!(
        "{} chapters {}..={}",
        args.novel_id,
        args.chapter,
        args.chapter.saturating_add(window)
    ));
    let report = cache.prefetch(&args.novel_id, args.chapter, window).await;
    spinner.finish_and_clear();

    let Some(current) = cache.get(&args.novel_id, args.chapter).await else {
        bail!(
            "Chapter {} of {} is not available ({} fetch failures)",
            args.chapter,
            args.novel_id,
            report.failed
        );
    };

    print_window(&cache.cached_entries(), args.chapter, window);
    if report.failed > 0 {
        log::warn!(
            "{} chapters in the window could not be fetched",
            report.failed
        );
    }

    if args.print {
        println!("{}\n", current.payload.title);
        println!("{}", current.payload.body);
    }
    Ok(())
}

fn print_window(entries: &[CacheEntry<Chapter>], current: u32, window: u32) {
    let mut table = table(&["Chapter", "Title", "Size", ""]);
    for entry in entries {
        let marker = if entry.sequence == current { "<" } else { "" };
        table.add_row(vec![
            entry.sequence.to_string(),
            entry.payload.title.clone(),
            format!("{} B", entry.payload.body.len()),
            marker.to_string(),
        ]);
    }
    let cached = entries
        .iter()
        .filter(|e| e.sequence >= current && e.sequence <= current.saturating_add(window))
        .count();
    let coverage = derived_progress(Some(cached as f64), Some(f64::from(window) + 1.0));
    eprintln!("\n{table}");
    eprintln!("Window coverage: {coverage}%");
}
