use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use folio_client::{ImportOutcome, Importer, import_progress, is_terminal_status};
use folio_core::{StatusAggregator, StatusMap};
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;

use super::{Ctx, table};

#[derive(Args)]
pub struct ImportArgs {
    /// Novel identifier on the server
    pub novel_id: String,
}

pub async fn run(args: ImportArgs, ctx: &Ctx) -> Result<()> {
    let aggregator = Arc::new(StatusAggregator::new(ctx.config.status_throttle()));
    let importer = Importer::new(ctx.manager.clone(), Arc::clone(&aggregator));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping import");
            on_signal.cancel();
        }
    });

    let bar = ctx.progress.import_bar(&args.novel_id);
    let mut updates = aggregator.subscribe();
    let bar_task = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let snapshot = updates.borrow_and_update().clone();
                update_bar(&bar, &snapshot);
            }
        })
    };

    let start = Instant::now();
    let result = importer.import(&args.novel_id, cancel).await;
    bar_task.abort();
    signal_task.abort();
    bar.finish_and_clear();

    let outcome = result.with_context(|| format!("Import of {} failed", args.novel_id))?;
    let snapshot = aggregator.snapshot();
    match outcome {
        ImportOutcome::Finished { message } => {
            ctx.progress.println(format!(
                "{message} ({:.1}s)",
                start.elapsed().as_secs_f64()
            ));
            print_summary(&snapshot);
        }
        ImportOutcome::AlreadyRunning => {
            ctx.progress.println("An import is already running");
        }
        ImportOutcome::Cancelled => {
            ctx.progress.println(format!(
                "Import of {} cancelled at {:.1}%",
                args.novel_id,
                import_progress(&snapshot)
            ));
            print_summary(&snapshot);
        }
    }
    Ok(())
}

fn update_bar(bar: &ProgressBar, snapshot: &StatusMap) {
    let finished = snapshot.values().filter(|s| is_terminal_status(s)).count();
    bar.set_length(snapshot.len() as u64);
    bar.set_position(finished as u64);
    bar.set_message(format!("{:.1}%", import_progress(snapshot)));
}

/// Chapters per status, with every "save error: <reason>" in one row.
fn status_counts(snapshot: &StatusMap) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for status in snapshot.values() {
        let label = if status.starts_with("save error") {
            "save error"
        } else {
            status.as_str()
        };
        *counts.entry(label).or_default() += 1;
    }
    counts
}

fn print_summary(snapshot: &StatusMap) {
    if snapshot.is_empty() {
        return;
    }
    let mut table = table(&["Status", "Chapters"]);
    for (status, count) in status_counts(snapshot) {
        table.add_row(vec![status.to_string(), count.to_string()]);
    }
    table.add_row(vec![
        "total".to_string(),
        format!("{} ({:.1}% done)", snapshot.len(), import_progress(snapshot)),
    ]);
    eprintln!("\n{table}");
}
