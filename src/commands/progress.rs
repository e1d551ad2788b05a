//! Progress reporting with indicatif

use indicatif::{ProgressBar, ProgressStyle};
use rdfu_core::transfer::{Action, TransferProgress};

/// Create the bar style, labelled with the current action
fn create_progress_bar_style(action: Action) -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos:>3}}% {:<10}",
            action
        ))?
        .progress_chars("#>-"))
}

/// Progress reporter using one indicatif bar per action
#[derive(Default)]
pub struct IndicatifProgress {
    current_bar: Option<ProgressBar>,
    action: Option<Action>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            let message = match self.action {
                Some(Action::Write) => "Write complete",
                Some(Action::Read) => "Read complete",
                Some(Action::Verify) => "Verify complete",
                Some(Action::Attach) => "Attached",
                _ => "Done",
            };
            pb.finish_with_message(message);
        }
    }
}

impl TransferProgress for IndicatifProgress {
    fn action_changed(&mut self, action: Action) {
        self.finish();
        self.action = Some(action);
        if action == Action::Idle {
            return;
        }
        let pb = ProgressBar::new(100);
        pb.set_style(
            create_progress_bar_style(action).unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        self.current_bar = Some(pb);
    }

    fn percentage_changed(&mut self, percentage: u8) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(u64::from(percentage));
        }
    }
}

impl Drop for IndicatifProgress {
    fn drop(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.abandon();
        }
    }
}
