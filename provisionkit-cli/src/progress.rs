//! Terminal progress display.
//!
//! One bar per descriptor, created on its first event. Byte callbacks drive
//! the bar position while fetching; phase events update the message.

use std::collections::HashMap;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use provisionkit::{Phase, PhaseEvent, ProgressObserver};

const BAR_TEMPLATE: &str =
    "{prefix:>16.bold} [{bar:30.cyan/blue}] {bytes:>10}/{total_bytes:<10} {msg}";
const SPINNER_TEMPLATE: &str = "{prefix:>16.bold} {spinner} {msg}";

/// Observer rendering indicatif bars on stderr.
pub struct TerminalProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TerminalProgress {
    pub fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, key: &str) -> ProgressBar {
        let mut bars = self.bars.lock();
        bars.entry(key.to_string())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new_spinner());
                if let Ok(spinner) = ProgressStyle::with_template(SPINNER_TEMPLATE) {
                    bar.set_style(spinner);
                }
                bar.set_prefix(key.to_string());
                bar
            })
            .clone()
    }

    /// Stop drawing; bars that are still running are left as they are.
    pub fn clear(&self) {
        let _ = self.multi.clear();
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_phase(&self, event: &PhaseEvent) {
        let bar = self.bar(&event.key);
        match event.to {
            Phase::Done => bar.finish_with_message(style("done").green().to_string()),
            Phase::Failed => {
                let reason = event.error.as_deref().unwrap_or("unknown error");
                bar.abandon_with_message(format!("{} {}", style("failed:").red(), reason));
            }
            Phase::Pending if event.from == Phase::Failed => {
                bar.reset();
                bar.set_message("retrying");
            }
            phase => bar.set_message(phase.to_string()),
        }
    }

    fn on_bytes(&self, key: &str, downloaded: u64, total: Option<u64>) {
        let bar = self.bar(key);
        if let Some(total) = total {
            if bar.length() != Some(total) {
                bar.set_length(total);
                if let Ok(bytes) = ProgressStyle::with_template(BAR_TEMPLATE) {
                    bar.set_style(bytes.progress_chars("=> "));
                }
                bar.set_message("fetching");
            }
        }
        bar.set_position(downloaded);
    }
}
