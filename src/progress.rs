//! Harvest and indexing progress reporting.
//!
//! Reports observable progress during `harvest sync` so users see which
//! subject is being loaded, how far along its relations are, and when the
//! search index is ready. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Loading of a subject's relations began. `position` is 1-based.
    SubjectStarted {
        subject: String,
        position: usize,
        total: usize,
    },
    /// Fraction of the current subject's calls that completed.
    Loading { subject: String, fraction: f64 },
    /// All relation calls of a subject completed.
    SubjectDone { subject: String },
    /// Bulk index build: n entries written out of total.
    Indexing { n: u64, total: u64 },
    /// The search index accepts queries.
    IndexReady { entries: u64 },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "harvest Ann (2 of 40)  loading  35%".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::SubjectStarted {
                subject,
                position,
                total,
            } => format!("harvest {} ({} of {})\n", subject, position, total),
            ProgressEvent::Loading { subject, fraction } => {
                format!("harvest {}  loading  {:.0}%\n", subject, fraction * 100.0)
            }
            ProgressEvent::SubjectDone { subject } => format!("harvest {}  done\n", subject),
            ProgressEvent::Indexing { n, total } => format!(
                "index  building  {} / {} records\n",
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::IndexReady { entries } => {
                format!("index  ready  {} records\n", format_number(*entries))
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::SubjectStarted {
                subject,
                position,
                total,
            } => serde_json::json!({
                "event": "subject_started",
                "subject": subject,
                "position": position,
                "total": total
            }),
            ProgressEvent::Loading { subject, fraction } => serde_json::json!({
                "event": "progress",
                "phase": "loading",
                "subject": subject,
                "fraction": fraction
            }),
            ProgressEvent::SubjectDone { subject } => serde_json::json!({
                "event": "subject_done",
                "subject": subject
            }),
            ProgressEvent::Indexing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "n": n,
                "total": total
            }),
            ProgressEvent::IndexReady { entries } => serde_json::json!({
                "event": "index_ready",
                "entries": entries
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
