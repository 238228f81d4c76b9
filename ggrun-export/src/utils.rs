use std::{
    io::{self, Write},
    sync::atomic::{AtomicUsize, Ordering},
};

const BAR_WIDTH: usize = 30;
const DESCRIPTION_WIDTH: usize = 42;

/// Single-line progress bar redrawn on stdout.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    total: usize,
    last_displayed: AtomicUsize,
    label: String,
}

impl ProgressTracker {
    pub fn new(total: usize, label: &str) -> Self {
        Self { total: total.max(1), last_displayed: AtomicUsize::new(0), label: label.to_string() }
    }

    pub fn set_current(&self, current: usize, description: Option<&str>) {
        let current = current.min(self.total);
        let last_displayed = self.last_displayed.load(Ordering::Relaxed);

        if !should_redraw(current, last_displayed, self.total) {
            return;
        }
        self.last_displayed.store(current, Ordering::Relaxed);

        let percent = (current * 100) / self.total;
        print!(
            "\r{}: [{}] {current}/{} ({percent}%): {}",
            self.label,
            render_bar(current, self.total, BAR_WIDTH),
            self.total,
            fixed_len(description.unwrap_or_default(), DESCRIPTION_WIDTH)
        );
        io::stdout().flush().unwrap_or(());

        if current >= self.total {
            println!();
        }
    }
}

/// Redraw on every whole percent, every 10 items and at both ends.
fn should_redraw(current: usize, last_displayed: usize, total: usize) -> bool {
    current == 0
        || current >= total
        || (current * 100) / total > (last_displayed * 100) / total
        || current.saturating_sub(last_displayed) >= 10
}

fn render_bar(current: usize, total: usize, width: usize) -> String {
    let filled = (current * width) / total;
    "█".repeat(filled) + &"░".repeat(width - filled)
}

fn fixed_len(description: &str, width: usize) -> String {
    if description.chars().count() > width {
        let mut desc: String = description.chars().take(width.saturating_sub(2)).collect();
        desc.push_str("..");
        desc
    } else {
        format!("{description:width$}")
    }
}
