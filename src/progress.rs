//! Progress reporting for the binaries.
//!
//! Long-running phases take a [`Reporter`] value instead of consulting a
//! process-global flag, so library code never reads ambient state and a
//! background run can ask for tail-friendly stderr lines up front.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// How a phase should surface its progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reporter {
    /// Live bars on a terminal.
    #[default]
    Interactive,
    /// Hidden bars; interval lines on stderr instead.
    LogOnly,
}

impl Reporter {
    pub fn from_flag(log_only: bool) -> Reporter {
        if log_only {
            Reporter::LogOnly
        } else {
            Reporter::Interactive
        }
    }

    pub fn is_log_only(self) -> bool {
        self == Reporter::LogOnly
    }

    /// A bounded progress bar; hidden when the run logs lines instead.
    pub fn bar(self, len: u64, msg: &str) -> ProgressBar {
        let pb = ProgressBar::new(len);
        match self {
            Reporter::LogOnly => pb.set_draw_target(ProgressDrawTarget::hidden()),
            Reporter::Interactive => pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:<32} {wide_bar} {pos}/{len} [{elapsed_precise}<{eta_precise}]")
                    .unwrap()
                    .progress_chars("## "),
            ),
        }
        pb.set_message(msg.to_string());
        pb
    }

    /// A spinner for indeterminate phases; hidden when logging lines.
    pub fn spinner(self, msg: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        match self {
            Reporter::LogOnly => pb.set_draw_target(ProgressDrawTarget::hidden()),
            Reporter::Interactive => {
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner} {msg} [{elapsed_precise}]")
                        .unwrap(),
                );
                pb.enable_steady_tick(Duration::from_millis(120));
            }
        }
        pb.set_message(msg.to_string());
        pb
    }

    /// Interval stderr line for tail-following. A no-op for interactive
    /// runs, where the bar already shows the same numbers.
    pub fn line(self, phase: &str, current: u64, total: u64, interval: u64) {
        if !self.is_log_only() || total == 0 {
            return;
        }
        if current % interval == 0 || current == total {
            let pct = 100.0 * current as f64 / total as f64;
            eprintln!("[{phase}] {current}/{total} ({pct:.1}%)");
        }
    }
}

/// Compact wall-clock formatting: "45.3s", "4m07s", "1h12m".
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if total < 3600 {
        format!("{}m{:02}s", total / 60, total % 60)
    } else {
        format!("{}h{:02}m", total / 3600, (total % 3600) / 60)
    }
}

/// ETA formatting; "unknown" when there is no estimate yet.
pub fn format_eta(eta_secs: Option<f64>) -> String {
    match eta_secs {
        Some(secs) if secs >= 0.0 => format_duration(Duration::from_secs_f64(secs)),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting_bands() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30.0s");
        assert_eq!(format_duration(Duration::from_secs(247)), "4m07s");
        assert_eq!(format_duration(Duration::from_secs(4_320)), "1h12m");
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(None), "unknown");
        assert_eq!(format_eta(Some(-5.0)), "unknown");
        assert_eq!(format_eta(Some(30.0)), "30.0s");
    }

    #[test]
    fn reporter_from_flag() {
        assert_eq!(Reporter::from_flag(true), Reporter::LogOnly);
        assert_eq!(Reporter::from_flag(false), Reporter::Interactive);
        assert!(Reporter::LogOnly.is_log_only());
        assert!(!Reporter::Interactive.is_log_only());
    }

    #[test]
    fn log_only_bars_are_hidden() {
        let bar = Reporter::LogOnly.bar(100, "phase");
        assert!(bar.is_hidden());
        let spinner = Reporter::LogOnly.spinner("phase");
        assert!(spinner.is_hidden());
    }
}
