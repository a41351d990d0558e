//! Live progress bar fed from the pipeline's watch channels

use crate::display::{format_bytes, format_eta};
use hashsync_types::{PipelineState, ProgressSnapshot};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const TEMPLATE: &str =
    "{spinner:.green} {prefix:>11.bold} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Progress bar following one pipeline run
pub struct TransferProgress {
    bar: ProgressBar,
    task: JoinHandle<()>,
}

impl TransferProgress {
    /// Start following `progress` and `state`; hidden when `quiet`
    pub fn spawn(
        mut progress: watch::Receiver<ProgressSnapshot>,
        mut state: watch::Receiver<PipelineState>,
        quiet: bool,
    ) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▉▊▋▌▍▎▏  "),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        };
        bar.set_prefix(state.borrow().as_str());

        let handle = bar.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = progress.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = *progress.borrow_and_update();
                        render(&handle, &snapshot);
                    }
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *state.borrow_and_update();
                        handle.set_prefix(current.as_str());
                        if current.is_terminal() {
                            break;
                        }
                    }
                }
            }
        });

        Self { bar, task }
    }

    /// Stop following and clear the bar
    pub async fn finish(self) {
        self.task.abort();
        let _ = self.task.await;
        self.bar.finish_and_clear();
    }
}

fn render(bar: &ProgressBar, snapshot: &ProgressSnapshot) {
    bar.set_length(snapshot.bytes_total);
    bar.set_position(snapshot.bytes_downloaded.min(snapshot.bytes_total));
    bar.set_message(status_line(snapshot));
}

/// `files 3/10 | 1.20 MB/s | ETA 42s`
pub fn status_line(snapshot: &ProgressSnapshot) -> String {
    format!(
        "files {}/{} | {}/s | ETA {}",
        snapshot.files_downloaded,
        snapshot.files_total,
        format_bytes(snapshot.speed as u64),
        format_eta(snapshot.eta)
    )
}
