//! On-disk archive of fuzz results.
//!
//! ```text
//! <root>/
//!   maps/actual_maps/<outcome>/...          current run
//!   maps/previous_maps/run_<N>/<outcome>/... earlier runs
//!   logs/actual_logs/{trace.txt,iterations.csv,overview.csv}
//!   logs/previous_logs/run_<N>/...
//!   logs/overview_logs/{attemptCounter.txt,history.csv,errorHistory.csv,fullHistory.csv}
//! ```
//!
//! The attempt counter file is the single source of truth for run numbers.
//! It is only ever incremented and never recomputed from `run_<N>`
//! directory names, so deleting or renaming historical runs cannot corrupt
//! numbering.

use chrono::{DateTime, Local};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::outcome::Outcome;

const COUNTER_FILE: &str = "attemptCounter.txt";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "attempt counter {path} is missing but earlier results exist under the archive root; \
         it was deleted without the rest of the results. Delete the whole results directory \
         to restart numbering"
    )]
    CounterMissing { path: PathBuf },
    #[error("attempt counter {path} is corrupt: {content:?}")]
    CorruptCounter { path: PathBuf, content: String },
    #[error("cannot migrate into {path}: destination already exists")]
    MigrationCollision { path: PathBuf },
    #[error("cannot route map to {path}: a map with that name is already filed there")]
    RouteCollision { path: PathBuf },
    #[error("migration left residue in {dir}")]
    ResidueLeft { dir: PathBuf },
    #[error("migration destination {dir} is empty after moving results")]
    DestinationEmpty { dir: PathBuf },
    #[error("archive is not ready (state: {state})")]
    NotReady { state: ArchiveState },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Single source of truth for every path under the results root.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn maps_dir(&self) -> PathBuf {
        self.root.join("maps")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn actual_maps(&self) -> PathBuf {
        self.maps_dir().join("actual_maps")
    }

    pub fn previous_maps(&self) -> PathBuf {
        self.maps_dir().join("previous_maps")
    }

    pub fn actual_logs(&self) -> PathBuf {
        self.logs_dir().join("actual_logs")
    }

    pub fn previous_logs(&self) -> PathBuf {
        self.logs_dir().join("previous_logs")
    }

    pub fn overview_logs(&self) -> PathBuf {
        self.logs_dir().join("overview_logs")
    }

    pub fn counter_file(&self) -> PathBuf {
        self.overview_logs().join(COUNTER_FILE)
    }

    pub fn trace_file(&self) -> PathBuf {
        self.actual_logs().join("trace.txt")
    }

    pub fn iterations_csv(&self) -> PathBuf {
        self.actual_logs().join("iterations.csv")
    }

    pub fn overview_csv(&self) -> PathBuf {
        self.actual_logs().join("overview.csv")
    }

    pub fn history_csv(&self) -> PathBuf {
        self.overview_logs().join("history.csv")
    }

    pub fn error_history_csv(&self) -> PathBuf {
        self.overview_logs().join("errorHistory.csv")
    }

    pub fn full_history_csv(&self) -> PathBuf {
        self.overview_logs().join("fullHistory.csv")
    }

    /// Where a map is staged before its outcome is known.
    pub fn staging_dir(&self) -> PathBuf {
        self.actual_maps()
    }

    pub fn outcome_dir(&self, outcome: Outcome) -> PathBuf {
        self.actual_maps().join(outcome.directory_name())
    }

    pub fn previous_run(&self, previous_tree: &Path, attempt: u64) -> PathBuf {
        previous_tree.join(format!("run_{}", attempt))
    }

    /// Any sign that an earlier attempt wrote here.
    fn has_prior_state(&self) -> bool {
        [
            self.actual_maps(),
            self.previous_maps(),
            self.actual_logs(),
            self.previous_logs(),
            self.history_csv(),
            self.error_history_csv(),
            self.full_history_csv(),
        ]
        .iter()
        .any(|p| p.exists())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    Uninitialized,
    RootReady,
    Migrated,
    Ready,
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchiveState::Uninitialized => "uninitialized",
            ArchiveState::RootReady => "root_ready",
            ArchiveState::Migrated => "migrated",
            ArchiveState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// One fuzzing session. The number is fixed once assigned.
#[derive(Debug, Clone)]
pub struct RunAttempt {
    number: u64,
    started_at: DateTime<Local>,
    started: Instant,
}

impl RunAttempt {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Result of migrating one `actual_*` tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
    Created,
    Empty,
    Moved { destination: PathBuf, files: usize },
}

/// Owns the archive directory tree for the lifetime of one run attempt.
///
/// Exactly one fuzzer process may target a given root at a time.
pub struct RunArchiver {
    layout: ArchiveLayout,
    state: ArchiveState,
}

impl RunArchiver {
    pub fn new(layout: ArchiveLayout) -> Self {
        Self {
            layout,
            state: ArchiveState::Uninitialized,
        }
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn state(&self) -> ArchiveState {
        self.state
    }

    /// Drives Uninitialized → RootReady → Migrated → Ready and returns the
    /// new attempt. The counter is persisted before this returns, so a crash
    /// mid-run still leaves the right number for the next run.
    pub fn initialize(&mut self) -> Result<RunAttempt, ArchiveError> {
        if self.state != ArchiveState::Uninitialized {
            return Err(ArchiveError::NotReady { state: self.state });
        }
        let had_prior_state = self.layout.has_prior_state();
        self.prepare_root()?;
        self.state = ArchiveState::RootReady;

        let counter_path = self.layout.counter_file();
        let previous = read_counter(&counter_path)?;
        if previous.is_none() && had_prior_state {
            return Err(ArchiveError::CounterMissing { path: counter_path });
        }
        let number = previous.unwrap_or(0) + 1;

        let trees = [
            (self.layout.actual_maps(), self.layout.previous_maps()),
            (self.layout.actual_logs(), self.layout.previous_logs()),
        ];
        for (actual, previous_tree) in trees.iter() {
            let migration = match previous {
                Some(residue_attempt) => {
                    let slot = self.layout.previous_run(previous_tree, residue_attempt);
                    migrate_actual(actual, &slot)?
                }
                None => {
                    ensure_dir(actual)?;
                    Migration::Created
                }
            };
            if let Migration::Moved { destination, files } = &migration {
                info!(
                    from = %actual.display(),
                    to = %destination.display(),
                    files,
                    "archived residue of previous attempt"
                );
            }
        }
        self.state = ArchiveState::Migrated;

        write_counter(&counter_path, number)?;
        self.state = ArchiveState::Ready;
        info!(attempt = number, root = %self.layout.root().display(), "archive ready");
        Ok(RunAttempt {
            number,
            started_at: Local::now(),
            started: Instant::now(),
        })
    }

    fn prepare_root(&self) -> Result<(), ArchiveError> {
        for dir in [
            self.layout.root().to_path_buf(),
            self.layout.maps_dir(),
            self.layout.logs_dir(),
            self.layout.overview_logs(),
        ] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }

    /// Moves a staged map into `actual_maps/<outcome>/`, creating the
    /// per-outcome directory on first use.
    pub fn route_artifact(&self, path: &Path, outcome: Outcome) -> Result<PathBuf, ArchiveError> {
        self.require_ready()?;
        let dir = self.layout.outcome_dir(outcome);
        ensure_dir(&dir)?;
        let file_name = path.file_name().ok_or_else(|| ArchiveError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file path"),
        })?;
        let destination = dir.join(file_name);
        if destination.exists() {
            return Err(ArchiveError::RouteCollision { path: destination });
        }
        fs::rename(path, &destination).map_err(io_err(path))?;
        debug!(to = %destination.display(), %outcome, "routed map");
        Ok(destination)
    }

    /// Deletes everything under `previous_maps` and `previous_logs`. The
    /// counter and overview logs are untouched.
    pub fn clean_previous(&self) -> Result<(), ArchiveError> {
        self.require_ready()?;
        for dir in [self.layout.previous_maps(), self.layout.previous_logs()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
                let path = entry.map_err(io_err(&dir))?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path).map_err(io_err(&path))?;
                } else {
                    fs::remove_file(&path).map_err(io_err(&path))?;
                }
            }
            info!(dir = %dir.display(), "cleaned previous results");
        }
        Ok(())
    }

    fn require_ready(&self) -> Result<(), ArchiveError> {
        if self.state == ArchiveState::Ready {
            Ok(())
        } else {
            Err(ArchiveError::NotReady { state: self.state })
        }
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(path).map_err(io_err(path))
}

fn read_counter(path: &Path) -> Result<Option<u64>, ArchiveError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match content.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ArchiveError::CorruptCounter {
            path: path.to_path_buf(),
            content,
        }),
    }
}

fn write_counter(path: &Path, value: u64) -> Result<(), ArchiveError> {
    atomic_write_bytes(path, value.to_string().as_bytes()).map_err(io_err(path))
}

/// Temp file + fsync + rename, then fsync of the parent directory.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn dir_has_files(dir: &Path) -> bool {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| !e.file_type().is_dir())
}

fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .count()
}

/// Relocates everything found in `actual` into `destination`, keeping
/// subdirectory structure. Empty subdirectories are dropped.
///
/// Afterwards `actual` exists and is empty; if anything was moved,
/// `destination` holds it. A violation of either is an invariant failure.
pub fn migrate_actual(actual: &Path, destination: &Path) -> Result<Migration, ArchiveError> {
    if !actual.exists() {
        ensure_dir(actual)?;
        return Ok(Migration::Created);
    }
    if !dir_has_files(actual) {
        remove_children(actual)?;
        return Ok(Migration::Empty);
    }

    ensure_dir(destination)?;
    move_children(actual, destination)?;

    let leftover = fs::read_dir(actual).map_err(io_err(actual))?.next().is_some();
    if leftover {
        return Err(ArchiveError::ResidueLeft {
            dir: actual.to_path_buf(),
        });
    }
    let files = count_files(destination);
    if files == 0 {
        return Err(ArchiveError::DestinationEmpty {
            dir: destination.to_path_buf(),
        });
    }
    Ok(Migration::Moved {
        destination: destination.to_path_buf(),
        files,
    })
}

fn move_children(from: &Path, to: &Path) -> Result<(), ArchiveError> {
    for entry in fs::read_dir(from).map_err(io_err(from))? {
        let entry = entry.map_err(io_err(from))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let is_dir = entry.file_type().map_err(io_err(&src))?.is_dir();
        if is_dir {
            if !dir_has_files(&src) {
                fs::remove_dir_all(&src).map_err(io_err(&src))?;
            } else if dst.exists() {
                // The slot already has this subdirectory; merge file by file.
                move_children(&src, &dst)?;
                fs::remove_dir_all(&src).map_err(io_err(&src))?;
            } else {
                fs::rename(&src, &dst).map_err(io_err(&src))?;
            }
        } else {
            if dst.exists() {
                return Err(ArchiveError::MigrationCollision { path: dst });
            }
            fs::rename(&src, &dst).map_err(io_err(&src))?;
        }
    }
    Ok(())
}

fn remove_children(dir: &Path) -> Result<(), ArchiveError> {
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        fs::remove_dir_all(&path).map_err(io_err(&path))?;
    }
    Ok(())
}
