//! Terminal rendering: spinner while a job runs, colored results.
//!
//! Uses `indicatif` for the spinner and `console` for styles. With `--json`
//! responses are printed verbatim instead.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use viki::service::Response;

pub struct Ui {
    json: bool,
    green: Style,
    red: Style,
    dim: Style,
}

impl Ui {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Prints the response; `details` renders the payload of a success.
    pub fn show<T: Serialize>(&self, response: &Response<T>, details: impl FnOnce(&T)) {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(response).unwrap_or_default()
            );
            return;
        }
        if response.success {
            println!("  {} {}", self.green.apply_to("✓"), response.message);
            details(&response.data);
        } else {
            let kind = response
                .kind
                .map(|k| format!(" ({k})"))
                .unwrap_or_default();
            println!(
                "  {} {}{}",
                self.red.apply_to("✗"),
                response.message,
                self.dim.apply_to(kind)
            );
        }
    }

    pub fn line(&self, text: &str) {
        if !self.json {
            println!("    {text}");
        }
    }

    /// Starts a spinner for a running job. Hidden in JSON mode.
    pub fn start_run(&self, job: &str) -> ProgressBar {
        if self.json {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("running {job}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }
}
