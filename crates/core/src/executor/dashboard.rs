//! Live terminal dashboard: an overall bar plus a grid of worker panels.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;

use super::reporter::Reporter;
use super::state::{Snapshot, WorkerState, WorkerStatus};

const PANEL_BAR_WIDTH: usize = 10;
const MAX_MESSAGE_CHARS: usize = 24;

/// Multi-panel reporter drawn with `indicatif`, refreshed in place.
pub struct DashboardReporter {
    title: String,
    grid_cols: usize,
    color: bool,
    multi: MultiProgress,
    overall: Option<ProgressBar>,
    rows: Vec<ProgressBar>,
}

impl DashboardReporter {
    /// Dashboard drawn on stderr.
    pub fn new(title: impl Into<String>, grid_cols: usize) -> Self {
        Self::with_draw_target(title, grid_cols, ProgressDrawTarget::stderr(), true)
    }

    /// Dashboard drawing nowhere, for tests and non-interactive use.
    pub fn hidden(title: impl Into<String>, grid_cols: usize) -> Self {
        Self::with_draw_target(title, grid_cols, ProgressDrawTarget::hidden(), false)
    }

    pub fn with_draw_target(
        title: impl Into<String>,
        grid_cols: usize,
        target: ProgressDrawTarget,
        color: bool,
    ) -> Self {
        Self {
            title: title.into(),
            grid_cols: grid_cols.max(1),
            color,
            multi: MultiProgress::with_draw_target(target),
            overall: None,
            rows: Vec::new(),
        }
    }

    /// Text of one grid row, as currently rendered.
    pub fn row_text(&self, row: usize) -> Option<String> {
        self.rows.get(row).map(|bar| bar.message())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn overall_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ")
    }

    fn row_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }

    fn paint_status(&self, status: WorkerStatus) -> String {
        let label = format!("{:<7}", status.as_str());
        if !self.color {
            return label;
        }
        match status {
            WorkerStatus::Pending => label.dimmed().to_string(),
            WorkerStatus::Running => label.yellow().to_string(),
            WorkerStatus::Success => label.green().to_string(),
            WorkerStatus::Failed => label.red().bold().to_string(),
        }
    }

    fn render_panel(&self, worker: &WorkerState) -> String {
        let filled = (worker.fraction() * PANEL_BAR_WIDTH as f64).round() as usize;
        let filled = filled.min(PANEL_BAR_WIDTH);
        let bar = format!(
            "{}{}",
            "█".repeat(filled),
            "░".repeat(PANEL_BAR_WIDTH - filled)
        );

        let mut panel = format!(
            "#{:<2} {} {} {}/{} r{}/{}",
            worker.worker_id,
            self.paint_status(worker.status),
            bar,
            worker.completed,
            worker.total,
            worker.retries_used,
            worker.max_retries
        );

        let note = match worker.status {
            WorkerStatus::Failed => worker.last_error.as_deref().or(worker.message.as_deref()),
            _ => worker.message.as_deref(),
        };
        if let Some(note) = note {
            panel.push(' ');
            panel.push_str(&truncate(note, MAX_MESSAGE_CHARS));
        }
        panel
    }

    fn render_row(&self, workers: &[WorkerState]) -> String {
        workers
            .iter()
            .map(|w| self.render_panel(w))
            .collect::<Vec<_>>()
            .join("  │  ")
    }

    fn refresh(&mut self, snapshot: &Snapshot) {
        if let Some(overall) = &self.overall {
            overall.set_length(snapshot.total_items);
            overall.set_position(snapshot.global_completed);
            overall.set_message(snapshot.summary());
        }

        let rendered: Vec<String> = snapshot
            .workers
            .chunks(self.grid_cols)
            .map(|chunk| self.render_row(chunk))
            .collect();

        for (text, bar) in rendered.into_iter().zip(&self.rows) {
            bar.set_message(text);
        }
    }
}

impl Reporter for DashboardReporter {
    fn name(&self) -> &'static str {
        "dashboard"
    }

    fn start(&mut self, snapshot: &Snapshot) {
        let overall = self.multi.add(ProgressBar::new(snapshot.total_items));
        overall.set_style(Self::overall_style());
        overall.set_prefix(self.title.clone());

        let row_count = snapshot.workers.len().div_ceil(self.grid_cols);
        self.rows = (0..row_count)
            .map(|_| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(Self::row_style());
                bar
            })
            .collect();
        self.overall = Some(overall);

        self.refresh(snapshot);
    }

    fn update(&mut self, snapshot: &Snapshot) {
        self.refresh(snapshot);
    }

    fn finish(&mut self, snapshot: &Snapshot) {
        self.refresh(snapshot);
        if let Some(overall) = &self.overall {
            overall.finish();
        }
        for row in &self.rows {
            row.finish();
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
