//! Terminal progress bars that stay pinned below log output

use crate::pipeline::JobProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}";

fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        mp
    })
}

/// Mirrors a job's processed/total counters onto a progress bar until
/// finished. The counters are polled, so the run itself never touches the
/// terminal.
pub struct ProgressDisplay {
    bar: ProgressBar,
    poller: JoinHandle<()>,
}

impl ProgressDisplay {
    /// `None` when stderr is not a terminal or output is JSON
    pub fn start(progress: Arc<JobProgress>, message: &str, enabled: bool) -> Option<Self> {
        if !enabled || !io::IsTerminal::is_terminal(&io::stderr()) {
            return None;
        }

        let bar = multi_progress().add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        let poll_bar = bar.clone();
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            loop {
                ticker.tick().await;
                let snapshot = progress.snapshot();
                poll_bar.set_length(snapshot.total);
                poll_bar.set_position(snapshot.processed);
            }
        });

        Some(Self { bar, poller })
    }

    pub fn finish(self, message: &str) {
        self.poller.abort();
        self.bar.finish_with_message(message.to_string());
    }
}

/// Routes `tracing` output through the shared `MultiProgress`
#[derive(Default, Clone)]
pub struct LogWriterFactory;

/// Buffers one log line at a time
pub struct LogWriter {
    pending: String,
}

impl LogWriter {
    fn emit(line: &str) {
        let line = line.trim_end_matches('\r');
        let _ = multi_progress().println(line);
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.push_str(&String::from_utf8_lossy(buf));
        while let Some(idx) = self.pending.find('\n') {
            Self::emit(&self.pending[..idx]);
            self.pending.drain(..=idx);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            Self::emit(&self.pending);
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            pending: String::new(),
        }
    }
}
