#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use streak_kernel_core::{
    analyze_window, consolidate_all, now_unix_ms, same_history, ActiveRunEvent, ActiveRunPayload,
    ActiveRunTracker, CategoryClassifier, InsertOutcome, Run, StreakHistory, StreakRecord,
    StreakRuleset, Window,
};
use tracing::{debug, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Missing,
    Unreadable,
    Loaded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReport {
    pub status: LoadStatus,
    pub records: Vec<StreakRecord>,
    pub dropped: usize,
}

impl LoadReport {
    fn empty(status: LoadStatus) -> Self {
        Self {
            status,
            records: Vec::new(),
            dropped: 0,
        }
    }
}

/// The on-disk history: a pretty-printed JSON array of records, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonHistoryFile {
    path: PathBuf,
}

impl JsonHistoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling path used for atomic replacement: `<file>.tmp.<pid>`.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(format!(".tmp.{}", std::process::id()));
        self.path.with_file_name(name)
    }

    /// Reads and validates every stored record.
    ///
    /// A missing or unparseable file yields an empty report; individual
    /// records that fail validation are dropped and counted.
    #[must_use]
    pub fn load(&self) -> LoadReport {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return LoadReport::empty(LoadStatus::Missing);
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read streak history");
                return LoadReport::empty(LoadStatus::Unreadable);
            }
        };

        let items = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => items,
            Ok(_) => {
                warn!(path = %self.path.display(), "streak history is not a JSON array");
                return LoadReport::empty(LoadStatus::Unreadable);
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "streak history is not valid JSON");
                return LoadReport::empty(LoadStatus::Unreadable);
            }
        };

        let mut records = Vec::with_capacity(items.len());
        let mut dropped = 0;
        for (position, item) in items.iter().enumerate() {
            match StreakRecord::from_json(item) {
                Ok(record) => records.push(record),
                Err(err) => {
                    dropped += 1;
                    debug!(position, error = %err, "dropping invalid streak record");
                }
            }
        }

        if dropped > 0 {
            warn!(
                path = %self.path.display(),
                dropped,
                kept = records.len(),
                "dropped invalid streak records on load"
            );
        }

        LoadReport {
            status: LoadStatus::Loaded,
            records,
            dropped,
        }
    }

    /// Replaces the file atomically with `records`.
    ///
    /// The new content is written to [`JsonHistoryFile::temp_path`] and then
    /// renamed over the target. On any failure the previous file is untouched.
    pub fn save(&self, records: &[StreakRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let payload =
            serde_json::to_string_pretty(records).context("failed to serialize streak history")?;
        let temp_path = self.temp_path();

        fs::write(&temp_path, payload.as_bytes()).with_context(|| {
            format!(
                "failed to write temporary history file {}",
                temp_path.display()
            )
        })?;

        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| {
                format!(
                    "failed to replace {} with {}",
                    self.path.display(),
                    temp_path.display()
                )
            });
        }

        Ok(())
    }

    /// Deletes the file. Returns `false` when there was nothing to delete.
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InsertReport {
    pub outcome: InsertOutcome,
    pub persisted: bool,
}

/// Owns the in-memory history and writes it through to its JSON file.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    file: JsonHistoryFile,
    history: StreakHistory,
}

impl HistoryStore {
    /// Loads the history at `path`, consolidated and capped to `max_count`.
    #[must_use]
    pub fn open(path: &Path, max_count: usize) -> Self {
        let file = JsonHistoryFile::new(path);
        let report = file.load();
        let history = StreakHistory::from_records(&report.records, max_count);

        info!(
            path = %path.display(),
            status = ?report.status,
            loaded = report.records.len(),
            dropped = report.dropped,
            kept = history.len(),
            "opened streak history"
        );

        Self { file, history }
    }

    #[must_use]
    pub fn file(&self) -> &JsonHistoryFile {
        &self.file
    }

    #[must_use]
    pub fn history(&self) -> &StreakHistory {
        &self.history
    }

    #[must_use]
    pub fn records(&self) -> &[StreakRecord] {
        self.history.records()
    }

    /// Records a completed run and persists the history when it changed.
    ///
    /// A failed write is logged and reported through
    /// [`InsertReport::persisted`]; the previously committed file stays
    /// authoritative.
    pub fn try_insert(&mut self, run: &Run, timestamp: i64) -> Result<InsertReport> {
        let outcome = self
            .history
            .try_insert(run, timestamp)
            .map_err(|err| anyhow!("failed to record streak: {err}"))?;

        let persisted = match &outcome {
            InsertOutcome::Inserted {
                group,
                key,
                superseded,
                evicted,
            } => {
                info!(
                    group = group.0,
                    length = run.len(),
                    sequence = %key,
                    superseded = superseded.len(),
                    evicted = evicted.len(),
                    "recorded completed streak"
                );
                match self.save() {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "streak history not persisted");
                        false
                    }
                }
            }
            InsertOutcome::RejectedDuplicate { group, key } => {
                debug!(group = group.0, sequence = %key, "streak already recorded");
                false
            }
            InsertOutcome::RejectedContained {
                group,
                key,
                container,
            } => {
                debug!(
                    group = group.0,
                    sequence = %key,
                    container = %container,
                    "streak contained in a recorded streak"
                );
                false
            }
        };

        Ok(InsertReport { outcome, persisted })
    }

    pub fn save(&self) -> Result<()> {
        self.file.save(self.history.records())
    }

    /// Empties the history and deletes its file.
    pub fn clear(&mut self) -> Result<()> {
        self.history.clear();
        if self.file.remove()? {
            info!(path = %self.file.path().display(), "streak history cleared");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub status: LoadStatus,
    pub loaded: usize,
    pub dropped: usize,
    pub kept: usize,
    pub rewritten: bool,
}

/// One pass of the periodic cleaner: load, consolidate, rewrite if changed.
///
/// Missing or unparseable files are left alone. Records dropped by
/// validation count as a change so the file is rewritten clean.
pub fn sweep_once(file: &JsonHistoryFile) -> Result<SweepReport> {
    let LoadReport {
        status,
        records,
        dropped,
    } = file.load();

    let cleaned = consolidate_all(&records);
    let mut report = SweepReport {
        status,
        loaded: records.len(),
        dropped,
        kept: cleaned.len(),
        rewritten: false,
    };

    if status != LoadStatus::Loaded || (dropped == 0 && same_history(&cleaned, &records)) {
        return Ok(report);
    }

    file.save(&cleaned)?;
    report.rewritten = true;
    info!(
        path = %file.path().display(),
        before = records.len() + dropped,
        after = cleaned.len(),
        "cleaned streak history"
    );

    Ok(report)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Ulid,
    pub window_len: usize,
    pub highlight_positions: Vec<usize>,
    pub active: Option<ActiveRunPayload>,
    pub inserts: Vec<InsertReport>,
    pub events: Vec<ActiveRunEvent>,
    pub history: Vec<StreakRecord>,
}

/// Runs evaluation cycles for one live process: detection, history
/// insertion and active-run edge tracking.
#[derive(Debug, Clone)]
pub struct LiveEvaluator {
    ruleset: StreakRuleset,
    classifier: CategoryClassifier,
    store: HistoryStore,
    tracker: ActiveRunTracker,
}

impl LiveEvaluator {
    pub fn new(ruleset: StreakRuleset, history_path: &Path) -> Result<Self> {
        let classifier = CategoryClassifier::from_ruleset(&ruleset)
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;
        let store = HistoryStore::open(history_path, ruleset.max_history);
        let tracker = ActiveRunTracker::new(ruleset.min_streak);

        Ok(Self {
            ruleset,
            classifier,
            store,
            tracker,
        })
    }

    #[must_use]
    pub fn ruleset(&self) -> &StreakRuleset {
        &self.ruleset
    }

    #[must_use]
    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Evaluates one newest-first window.
    pub fn evaluate(&mut self, newest_first: &[u32]) -> CycleReport {
        let cycle_id = Ulid::new();
        let window = Window::from_newest_first(
            newest_first,
            self.ruleset.window_size,
            &self.classifier,
        );
        let analysis = analyze_window(&window, self.ruleset.min_streak);

        let mut inserts = Vec::new();
        for run in &analysis.completed {
            match self.store.try_insert(run, now_unix_ms()) {
                Ok(report) => inserts.push(report),
                Err(err) => warn!(%cycle_id, error = %err, "skipping streak candidate"),
            }
        }

        let events: Vec<ActiveRunEvent> = self
            .tracker
            .observe(&window, analysis.trailing.as_ref())
            .into_iter()
            .collect();

        debug!(
            %cycle_id,
            window_len = window.len(),
            runs = analysis.runs.len(),
            completed = analysis.completed.len(),
            inserted = inserts.iter().filter(|report| report.outcome.is_inserted()).count(),
            events = events.len(),
            "evaluated window"
        );

        CycleReport {
            cycle_id,
            window_len: window.len(),
            highlight_positions: analysis.highlight_positions,
            active: analysis.active,
            inserts,
            events,
            history: self
                .store
                .history()
                .newest(self.ruleset.display_limit)
                .to_vec(),
        }
    }
}
