//! `ScanContext`: the single value threaded through every decoder instead of
//! the process-wide flags the original tool kept (output mode, restore
//! type, recovery mode, current database path, ...). See spec §9, "Global
//! mutable state".

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// How a decoded field is rendered to text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Tab-separated fields, `\n` row terminator, `\N` for NULL.
    Csv,
    /// `INSERT INTO ...` statements, single-quoted values, `NULL` for NULL.
    Sql,
}

/// Which kind of DML the WAL restore path should emit for a recovered
/// tuple pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreKind {
    /// Emit the pre-image of a deleted row as a plain row (or `INSERT`).
    Delete,
    /// Emit an `UPDATE ... SET changed = new WHERE unchanged = old` statement.
    Update,
}

/// Selects which transactions the restore pass (spec §4.F) considers.
#[derive(Debug, Clone)]
pub enum RecoveryFilter {
    ByXid(u32),
    ByTime { start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>> },
}

/// Time-window filtering state machine (spec §4.F table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFilterMode {
    None,
    FormerHalf,
    LatterHalf,
    Full,
}

impl TimeFilterMode {
    pub fn classify(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        match (start.is_some(), end.is_some()) {
            (false, false) => TimeFilterMode::None,
            (true, false) => TimeFilterMode::FormerHalf,
            (false, true) => TimeFilterMode::LatterHalf,
            (true, true) => TimeFilterMode::Full,
        }
    }
}

/// Outcome of presenting one commit's wall-clock time to the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// This transaction is outside the window; don't record it.
    Skip,
    /// This transaction is inside the window.
    Accept,
    /// We've moved past the window entirely; the caller should stop scanning.
    StopScan,
}

/// Tracks the widening/narrowing bounds described in spec §4.F and decides,
/// for each commit time observed, whether to accept/skip/stop.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    mode: TimeFilterMode,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        TimeWindow {
            mode: TimeFilterMode::classify(start, end),
            start,
            end,
        }
    }

    pub fn mode(&self) -> TimeFilterMode {
        self.mode
    }

    /// Evaluate a commit's `txTime` against the window, widening bounds as
    /// `None` and narrowing as a filter is active (mirrors the table in
    /// spec §4.F exactly).
    pub fn evaluate(&mut self, tx_time: DateTime<Utc>) -> FilterDecision {
        match self.mode {
            TimeFilterMode::None => {
                self.start = Some(self.start.map_or(tx_time, |s| s.min(tx_time)));
                self.end = Some(self.end.map_or(tx_time, |e| e.max(tx_time)));
                FilterDecision::Accept
            }
            TimeFilterMode::FormerHalf => {
                let start = self.start.expect("FormerHalf implies start set");
                if tx_time < start {
                    return FilterDecision::Skip;
                }
                self.end = Some(self.end.map_or(tx_time, |e| e.max(tx_time)));
                FilterDecision::Accept
            }
            TimeFilterMode::LatterHalf => {
                let end = self.end.expect("LatterHalf implies end set");
                if tx_time > end {
                    return FilterDecision::StopScan;
                }
                self.start = Some(self.start.map_or(tx_time, |s| s.min(tx_time)));
                FilterDecision::Accept
            }
            TimeFilterMode::Full => {
                let start = self.start.expect("Full implies start set");
                let end = self.end.expect("Full implies end set");
                if tx_time > end {
                    return FilterDecision::StopScan;
                }
                if tx_time < start {
                    return FilterDecision::Skip;
                }
                FilterDecision::Accept
            }
        }
    }
}

/// Configured ceiling on a decompression scratch buffer (spec §4.B): if the
/// raw size stored in a compressed varlena header exceeds this, the
/// decoder emits the `(DATA COMPRESSED)` sentinel instead of allocating.
pub const DEFAULT_WORKSPACE_LIMIT: usize = 64 * 1024 * 1024;

/// The single value passed by reference through every decoder in place of
/// process-wide flags (spec §9).
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub output_mode: OutputMode,
    pub restore_kind: RestoreKind,
    pub data_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub workspace_limit: usize,
    pub errors_emitted: u64,
    pub rows_emitted: u64,
}

impl ScanContext {
    pub fn new(data_dir: impl Into<PathBuf>, output_mode: OutputMode) -> Self {
        ScanContext {
            output_mode,
            restore_kind: RestoreKind::Delete,
            data_dir: data_dir.into(),
            archive_dir: None,
            workspace_limit: DEFAULT_WORKSPACE_LIMIT,
            errors_emitted: 0,
            rows_emitted: 0,
        }
    }

    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    pub fn with_restore_kind(mut self, kind: RestoreKind) -> Self {
        self.restore_kind = kind;
        self
    }

    pub fn record_error(&mut self) {
        self.errors_emitted += 1;
    }

    pub fn record_row(&mut self) {
        self.rows_emitted += 1;
    }
}
