pub mod archive;
pub mod config;
pub mod input;
pub mod ledger;
pub mod outcome;
pub mod supervisor;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use archive::{ArchiveError, ArchiveLayout, RunArchiver, RunAttempt};
pub use config::{load_config, FuzzConfig};
pub use input::{FuzzInput, InputSource, RandomInputSource};
pub use ledger::{IterationLedger, IterationRecord, OutcomeGroup};
pub use outcome::{classify, Outcome, OutcomeCounts};
pub use supervisor::{Execution, ProcessSupervisor, SupervisorError};

/// Why the loop stopped. Both are normal completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationBudget,
    TimeBudget,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub attempt: u64,
    pub results_root: PathBuf,
    pub logs_dir: PathBuf,
    pub iterations: usize,
    pub counts: OutcomeCounts,
    pub stop_reason: StopReason,
    pub elapsed_ms: u64,
    pub log_failures: Vec<String>,
}

/// One run attempt with the configured random generator.
pub fn run_fuzz(config: &FuzzConfig) -> Result<RunSummary> {
    let mut source = RandomInputSource::new(config)?;
    run_fuzz_with(config, &mut source)
}

/// One run attempt: settle the archive, iterate until a budget is spent,
/// then flush the ledger.
///
/// Archive and spawn failures abort the attempt. Whatever was recorded up to
/// that point is still flushed so the residue can be migrated next time.
pub fn run_fuzz_with(config: &FuzzConfig, source: &mut dyn InputSource) -> Result<RunSummary> {
    config.validate()?;
    let layout = ArchiveLayout::new(&config.results.root);
    let mut archiver = RunArchiver::new(layout.clone());
    let attempt = archiver
        .initialize()
        .with_context(|| format!("failed to prepare results root {}", layout.root().display()))?;
    info!(
        attempt = attempt.number(),
        max_iterations = config.budget.max_iterations,
        iteration_timeout_ms = config.budget.iteration_timeout_ms,
        "fuzz run started"
    );

    let supervisor = ProcessSupervisor::new(&config.target, config.budget.iteration_timeout());
    let mut ledger = IterationLedger::new(layout.clone(), config.results.log_history);

    let stopped = drive(config, &attempt, &archiver, &supervisor, source, &mut ledger);
    let report = ledger.flush(&attempt);
    let stop_reason = stopped?;

    if config.results.clean_previous {
        archiver
            .clean_previous()
            .context("failed to clean previous results")?;
    }

    let counts = ledger.counts();
    let elapsed = attempt.elapsed();
    info!(
        attempt = attempt.number(),
        iterations = counts.total(),
        accepted = counts.accepted,
        crashed = counts.crashed,
        rejected = counts.rejected,
        timed_out = counts.timed_out,
        unknown = counts.unknown,
        ?stop_reason,
        "fuzz run finished"
    );
    Ok(RunSummary {
        attempt: attempt.number(),
        results_root: layout.root().to_path_buf(),
        logs_dir: layout.actual_logs(),
        iterations: counts.total(),
        counts,
        stop_reason,
        elapsed_ms: duration_ms(elapsed),
        log_failures: report
            .failed
            .iter()
            .map(|(path, err)| format!("{}: {}", path.display(), err))
            .collect(),
    })
}

fn drive(
    config: &FuzzConfig,
    attempt: &RunAttempt,
    archiver: &RunArchiver,
    supervisor: &ProcessSupervisor,
    source: &mut dyn InputSource,
    ledger: &mut IterationLedger,
) -> Result<StopReason> {
    let staging = archiver.layout().staging_dir();
    let run_budget = config.budget.run_budget();
    loop {
        if ledger.records().len() >= config.budget.max_iterations {
            return Ok(StopReason::IterationBudget);
        }
        let iteration = ledger.next_iteration();
        let input = source
            .next_input(&staging, iteration)
            .with_context(|| format!("failed to prepare input for iteration {}", iteration))?;
        let execution = supervisor.execute(&input.map_path, &input.action_sequence)?;
        let outcome = classify(execution.exit_code, execution.timed_out);
        let routed = archiver.route_artifact(&input.map_path, outcome)?;
        debug!(
            iteration,
            %outcome,
            exit_code = execution.exit_code,
            elapsed_ms = duration_ms(execution.elapsed),
            actions = %input.action_sequence,
            "iteration done"
        );
        ledger.record(
            routed,
            input.action_sequence,
            outcome,
            execution.output,
            input.custom_attribute,
        );

        // Checked only between iterations; the one in flight always finishes.
        if attempt.elapsed() >= run_budget {
            return Ok(StopReason::TimeBudget);
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Deletes a whole results root, counter included. Returns false when there
/// was nothing to delete.
pub fn remove_results(root: &Path) -> Result<bool> {
    if !root.exists() {
        return Ok(false);
    }
    let layout = ArchiveLayout::new(root);
    if !layout.overview_logs().exists() && !layout.maps_dir().exists() {
        warn!(root = %root.display(), "directory does not look like a results root");
        anyhow::bail!(
            "refusing to delete {}: not a results root (no maps/ or logs/overview_logs/)",
            root.display()
        );
    }
    fs::remove_dir_all(root).with_context(|| format!("failed to remove {}", root.display()))?;
    info!(root = %root.display(), "results removed");
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ledger::read_iterations_csv;
    use std::time::Instant;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mapfuzz_run_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    /// Config whose target is `/bin/sh <script> <map> <actions>`.
    fn config_for(dir: &Path, script: &str, iterations: usize) -> FuzzConfig {
        let script_path = dir.join("target.sh");
        fs::write(&script_path, script).expect("write target script");
        let mut config = FuzzConfig::default();
        config.target.command = vec![
            "/bin/sh".to_string(),
            script_path.to_string_lossy().to_string(),
        ];
        config.budget.max_iterations = iterations;
        config.budget.iteration_timeout_ms = 5_000;
        config.results.root = dir.join("results");
        config.seed = Some(7);
        config
    }

    fn files_in(dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
            .unwrap_or(0)
    }

    #[test]
    fn rejecting_target_routes_every_map_to_rejected() {
        let dir = temp_dir("rejected");
        let config = config_for(&dir, "echo \"invalid map\"\nexit 10\n", 5);
        let summary = run_fuzz(&config).expect("run");
        assert_eq!(summary.attempt, 1);
        assert_eq!(summary.iterations, 5);
        assert_eq!(summary.counts.rejected, 5);
        assert_eq!(summary.stop_reason, StopReason::IterationBudget);

        let layout = ArchiveLayout::new(&config.results.root);
        assert_eq!(files_in(&layout.outcome_dir(Outcome::Rejected)), 5);
        assert_eq!(files_in(&layout.staging_dir()), 0, "no map left unrouted");

        let rows = read_iterations_csv(&layout.iterations_csv()).expect("iterations csv");
        let indices: Vec<usize> = rows.iter().map(|r| r.iteration).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert!(rows.iter().all(|r| r.output == "invalid map\n"));
        assert!(rows.iter().all(|r| r.map_path.exists()), "ledger points at routed maps");
        let _ = fs::remove_dir_all(dir);
    }

    /// Empty text map and the single action `E`, every iteration.
    struct EmptyMapQuit;

    impl InputSource for EmptyMapQuit {
        fn next_input(&mut self, staging_dir: &Path, iteration: usize) -> Result<FuzzInput> {
            let map_path = staging_dir.join(format!("map_{}.txt", iteration));
            fs::write(&map_path, b"")?;
            Ok(FuzzInput {
                map_path,
                action_sequence: "E".to_string(),
                custom_attribute: None,
            })
        }
    }

    #[test]
    fn empty_map_with_quit_is_rejected() {
        let dir = temp_dir("emptymap");
        let script = "if [ ! -s \"$1\" ] && [ \"$2\" = E ]; then exit 10; fi\nexit 0\n";
        let config = config_for(&dir, script, 2);
        let summary = run_fuzz_with(&config, &mut EmptyMapQuit).expect("run");
        assert_eq!(summary.counts.rejected, 2);

        let layout = ArchiveLayout::new(&config.results.root);
        let rejected = layout.outcome_dir(Outcome::Rejected);
        assert!(rejected.join("map_1.txt").is_file());
        assert!(rejected.join("map_2.txt").is_file());
        let rows = read_iterations_csv(&layout.iterations_csv()).expect("iterations csv");
        assert!(rows.iter().all(|r| r.outcome == Outcome::Rejected && r.action_sequence == "E"));
        assert!(rows.iter().all(|r| r.custom_attribute == "none"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn exit_codes_are_classified_per_action_sequence() {
        let dir = temp_dir("classify");
        let script = "case \"$2\" in\n  E) exit 0 ;;\n  Q) exit 1 ;;\n  S) exit 10 ;;\n  *) echo odd >&2; exit 3 ;;\nesac\n";
        let mut config = config_for(&dir, script, 4);
        config.custom.sequences = ["E", "Q", "S", "W"].iter().map(|s| s.to_string()).collect();
        let summary = run_fuzz(&config).expect("run");
        assert_eq!(
            (
                summary.counts.accepted,
                summary.counts.crashed,
                summary.counts.rejected,
                summary.counts.unknown
            ),
            (1, 1, 1, 1)
        );
        let layout = ArchiveLayout::new(&config.results.root);
        assert_eq!(files_in(&layout.outcome_dir(Outcome::Unknown(3))), 1);
        let overview = fs::read_to_string(layout.overview_csv()).expect("overview");
        assert!(overview.contains("3,\"odd\n\",1,4"), "overview: {}", overview);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn hung_target_is_killed_and_recorded_as_timed_out() {
        let dir = temp_dir("hung");
        let mut config = config_for(&dir, "trap '' TERM\nexec sleep 60\n", 1);
        config.budget.iteration_timeout_ms = 2_000;
        let started = Instant::now();
        let summary = run_fuzz(&config).expect("run");
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(summary.counts.timed_out, 1);
        let layout = ArchiveLayout::new(&config.results.root);
        assert_eq!(files_in(&layout.outcome_dir(Outcome::TimedOut)), 1);
        let rows = read_iterations_csv(&layout.iterations_csv()).expect("iterations csv");
        assert_eq!(rows[0].outcome, Outcome::TimedOut);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn second_run_archives_the_first() {
        let dir = temp_dir("second");
        let config = config_for(&dir, "exit 10\n", 3);
        assert_eq!(run_fuzz(&config).expect("first").attempt, 1);
        assert_eq!(run_fuzz(&config).expect("second").attempt, 2);

        let layout = ArchiveLayout::new(&config.results.root);
        let run_1 = layout.previous_run(&layout.previous_maps(), 1);
        assert_eq!(files_in(&run_1.join("rejected")), 3);
        assert!(layout
            .previous_run(&layout.previous_logs(), 1)
            .join("iterations.csv")
            .is_file());
        assert_eq!(files_in(&layout.outcome_dir(Outcome::Rejected)), 3);

        let history = fs::read_to_string(layout.history_csv()).expect("history");
        let attempts: Vec<&str> = history
            .lines()
            .skip(1)
            .map(|l| l.split(',').next().unwrap_or(""))
            .collect();
        assert_eq!(attempts, vec!["1", "2"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn numbering_survives_deleting_previous_results() {
        let dir = temp_dir("deleted");
        let config = config_for(&dir, "exit 0\n", 2);
        run_fuzz(&config).expect("first");
        run_fuzz(&config).expect("second");
        let layout = ArchiveLayout::new(&config.results.root);
        fs::remove_dir_all(layout.previous_maps()).expect("remove previous maps");
        fs::remove_dir_all(layout.previous_logs()).expect("remove previous logs");

        let third = run_fuzz(&config).expect("third");
        assert_eq!(third.attempt, 3);
        let run_2 = layout.previous_run(&layout.previous_maps(), 2);
        assert_eq!(files_in(&run_2.join("accepted")), 2);
        assert!(!layout.previous_run(&layout.previous_maps(), 1).exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn clean_previous_empties_archive_after_run() {
        let dir = temp_dir("clean");
        let mut config = config_for(&dir, "exit 1\n", 2);
        run_fuzz(&config).expect("first");
        config.results.clean_previous = true;
        let second = run_fuzz(&config).expect("second");
        assert_eq!(second.attempt, 2);
        let layout = ArchiveLayout::new(&config.results.root);
        assert_eq!(fs::read_dir(layout.previous_maps()).expect("dir").count(), 0);
        assert_eq!(files_in(&layout.outcome_dir(Outcome::Crashed)), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn time_budget_stops_between_iterations() {
        let dir = temp_dir("time");
        let mut config = config_for(&dir, "sleep 0.2\nexit 0\n", 50);
        config.budget.max_time_ms = 1;
        let summary = run_fuzz(&config).expect("run");
        assert_eq!(summary.stop_reason, StopReason::TimeBudget);
        assert_eq!(summary.iterations, 1, "the in-flight iteration still completes");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_target_aborts_but_keeps_the_counter() {
        let dir = temp_dir("missing");
        let mut config = config_for(&dir, "exit 0\n", 3);
        config.target.command = vec![dir.join("nope").to_string_lossy().to_string()];
        let err = run_fuzz(&config).expect_err("spawn must fail");
        let msg = format!("{:#}", err);
        assert!(msg.contains("failed to spawn"), "unexpected: {}", msg);

        let layout = ArchiveLayout::new(&config.results.root);
        let counter = fs::read_to_string(layout.counter_file()).expect("counter");
        assert_eq!(counter.trim(), "1");
        assert!(layout.iterations_csv().is_file(), "ledger flushed on abort");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn remove_results_refuses_foreign_directories() {
        let dir = temp_dir("remove");
        fs::write(dir.join("notes.txt"), "keep").expect("write");
        assert!(remove_results(&dir).is_err());
        assert!(dir.join("notes.txt").exists());

        let config = config_for(&dir, "exit 0\n", 1);
        run_fuzz(&config).expect("run");
        assert!(remove_results(&config.results.root).expect("remove"));
        assert!(!config.results.root.exists());
        assert!(!remove_results(&config.results.root).expect("second remove"));
        let _ = fs::remove_dir_all(dir);
    }
}
