//! Human-readable progress reporting.

use std::sync::Arc;

/// Receives unstructured progress lines during a sync run.
///
/// Any `Fn(&str) + Send + Sync` closure is a sink:
///
/// ```
/// use std::sync::Arc;
/// use mailsync_core::{ProgressSink, SyncOptions};
///
/// let sink: Arc<dyn ProgressSink> = Arc::new(|line: &str| eprintln!("{line}"));
/// let options = SyncOptions::default().with_workers(4).with_progress(sink);
/// assert_eq!(options.workers, 4);
/// ```
pub trait ProgressSink: Send + Sync {
    /// Handles one progress line.
    fn report(&self, line: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, line: &str) {
        self(line);
    }
}

/// Optional sink shared between the orchestrator, strategies and the
/// progress ticker.
#[derive(Clone, Default)]
pub(crate) struct Reporter {
    sink: Option<Arc<dyn ProgressSink>>,
}

impl Reporter {
    pub(crate) fn new(sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self { sink }
    }

    pub(crate) const fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn report(&self, line: &str) {
        if let Some(sink) = &self.sink {
            sink.report(line);
        }
    }

    pub(crate) fn report_progress(&self, fetched: usize, total: usize) {
        if self.is_enabled() {
            self.report(&progress_line(fetched, total));
        }
    }
}

/// Formats `Syncing: F / T messages (P%)`.
#[allow(clippy::cast_precision_loss)] // Message counts are far below 2^52
pub(crate) fn progress_line(fetched: usize, total: usize) -> String {
    let percent = if total == 0 {
        100.0
    } else {
        fetched as f64 / total as f64 * 100.0
    };
    format!("Syncing: {fetched} / {total} messages ({percent:.1}%)")
}
