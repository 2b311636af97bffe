use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use photosift_core::WorkerEvent;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::open_engine;
use crate::library::DirectorySource;

fn active_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "  {bar:30.cyan/blue} {spinner:.green} {pos:>5}/{len:<5} {prefix:.dim} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━╸─")
}

fn done_style() -> ProgressStyle {
    ProgressStyle::with_template("  {bar:30.green} {prefix:.green} {msg:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Tally of worker events over one scan.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ScanTally {
    pub(crate) analyzed: usize,
    /// Assets that failed for good, retries exhausted.
    pub(crate) failed: usize,
    pub(crate) failed_attempts: usize,
    pub(crate) groups: usize,
    pub(crate) grouped_assets: usize,
    /// Total handed to the worker across every drain.
    pub(crate) queued: usize,
}

impl ScanTally {
    pub(crate) fn record(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::DrainStarted { pending } => self.queued += pending,
            WorkerEvent::Analyzed { .. } => self.analyzed += 1,
            WorkerEvent::Failed { will_retry, .. } => {
                self.failed_attempts += 1;
                if !will_retry {
                    self.failed += 1;
                }
            }
            WorkerEvent::Clustered {
                groups,
                grouped_assets,
            } => {
                self.groups = *groups;
                self.grouped_assets = *grouped_assets;
            }
            WorkerEvent::Flushed { .. } | WorkerEvent::Idle => {}
        }
    }

    /// Queue items the worker has finished with, one per attempt.
    pub(crate) fn settled(&self) -> usize {
        self.analyzed + self.failed_attempts
    }
}

fn display_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string())
}

pub async fn run(data_dir: &Path, root: PathBuf) -> Result<()> {
    let library = tokio::task::spawn_blocking(move || DirectorySource::open(&root))
        .await
        .context("directory walk panicked")??;
    let library = Arc::new(library);
    debug!(root = %library.root().display(), files = library.len(), "Walked library");

    let mp = MultiProgress::new();
    mp.println(String::new()).ok();
    mp.println(format!(
        "  Scanning {} ({} files)",
        display_name(library.root()),
        library.len()
    ))
    .ok();

    let engine = open_engine(data_dir, library.clone());
    let mut events = engine.events();

    let indexing = mp.add(ProgressBar::new_spinner());
    indexing.set_prefix("Indexing");
    indexing.enable_steady_tick(Duration::from_millis(80));

    let analysis = mp.add(ProgressBar::new(0));
    analysis.set_style(active_style());
    analysis.set_prefix("Analyzing");
    analysis.enable_steady_tick(Duration::from_millis(80));

    let mut tally = ScanTally::default();
    let reload = engine.reload();
    tokio::pin!(reload);
    let mut indexed: Option<usize> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            result = &mut reload, if indexed.is_none() => {
                let total = result?;
                indexing.set_style(done_style());
                indexing.set_prefix("done");
                indexing.finish_with_message(format!("Indexed {total} files"));
                indexed = Some(total);
            }
            event = events.recv() => match event {
                Ok(event) => {
                    tally.record(&event);
                    if let WorkerEvent::Analyzed { id } = &event {
                        analysis.set_message(id.clone());
                    }
                    analysis.set_length(tally.queued as u64);
                    analysis.set_position(tally.settled() as u64);
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick(), if indexed.is_some() => {
                if engine.worker().is_idle() {
                    break;
                }
            }
        }
    }

    analysis.set_style(done_style());
    analysis.set_prefix("done");
    analysis.finish_with_message(format!(
        "Analyzed {} files ({} failed)",
        tally.analyzed, tally.failed
    ));

    engine.shutdown().await?;

    mp.println(String::new()).ok();
    mp.println(format!(
        "  Scan complete: {} similar groups covering {} assets.",
        tally.groups, tally.grouped_assets
    ))
    .ok();
    mp.println(String::new()).ok();
    Ok(())
}
