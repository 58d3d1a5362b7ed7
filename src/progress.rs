//! Import progress reporting.
//!
//! Reports observable progress during `refsync import` so operators see
//! which phase a run is in and how much is left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::ingest::RunState;

/// A single progress event for an import run.
#[derive(Clone, Debug)]
pub enum ImportProgressEvent {
    /// The run entered a new state.
    Phase { run_id: i64, state: RunState },
    /// Source records processed so far out of the changed-key total.
    Records { run_id: i64, n: u64, total: u64 },
    /// Tag labels processed in the current phase.
    Tags { run_id: i64, n: u64, total: u64 },
}

/// Reports import progress. Implementations write to stderr (human or JSON).
pub trait ImportProgressReporter: Send + Sync {
    fn report(&self, event: ImportProgressEvent);
}

/// Human-friendly progress on stderr: "import #3  records  1,234 / 5,000".
pub struct StderrProgress;

impl ImportProgressReporter for StderrProgress {
    fn report(&self, event: ImportProgressEvent) {
        let line = match &event {
            ImportProgressEvent::Phase { run_id, state } => {
                format!("import #{}  {}\n", run_id, state.label())
            }
            ImportProgressEvent::Records { run_id, n, total } => format!(
                "import #{}  records  {} / {}\n",
                run_id,
                format_number(*n),
                format_number(*total)
            ),
            ImportProgressEvent::Tags { run_id, n, total } => format!(
                "import #{}  tags  {} / {}\n",
                run_id,
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ImportProgressReporter for JsonProgress {
    fn report(&self, event: ImportProgressEvent) {
        let obj = match &event {
            ImportProgressEvent::Phase { run_id, state } => serde_json::json!({
                "event": "phase",
                "run_id": run_id,
                "state": state,
            }),
            ImportProgressEvent::Records { run_id, n, total } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "unit": "records",
                "n": n,
                "total": total
            }),
            ImportProgressEvent::Tags { run_id, n, total } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "unit": "tags",
                "n": n,
                "total": total
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

impl ImportProgressReporter for NoProgress {
    fn report(&self, _event: ImportProgressEvent) {}
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

    pub fn reporter(&self) -> Box<dyn ImportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
