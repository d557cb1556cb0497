use crate::types::VegResult;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

/// Why a unit did not run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Every artifact of the unit was already on disk
    AlreadyExists,
    /// Input data was missing or unusable
    InputUnavailable(String),
}

/// Result kind of one unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Success(String),
    Skipped(SkipReason),
    Failed(String),
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Success(msg) => write!(f, "ok: {}", msg),
            UnitOutcome::Skipped(SkipReason::AlreadyExists) => write!(f, "skipped: already exists"),
            UnitOutcome::Skipped(SkipReason::InputUnavailable(msg)) => write!(f, "skipped: {}", msg),
            UnitOutcome::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Outcome of one unit, keyed by its artifact identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: String,
    pub outcome: UnitOutcome,
}

/// A unit of work producing one or more files
pub trait WorkUnit: Send + Sync {
    /// Stable identity of the unit's output
    fn id(&self) -> String;

    /// Files the unit writes; all present means nothing to do
    fn artifacts(&self) -> Vec<PathBuf>;

    /// Produce the artifacts, each written atomically
    fn run(&self) -> VegResult<String>;
}

/// Aggregated reports of one stage
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stage: String,
    pub reports: Vec<UnitReport>,
}

impl RunSummary {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reports: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Success(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, UnitOutcome::Failed(_)))
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.reports.extend(other.reports);
    }

    /// Log the counts plus every skip and failure
    pub fn log_summary(&self) {
        log::info!(
            "[{}] {} units: {} succeeded, {} skipped, {} failed",
            self.stage,
            self.reports.len(),
            self.succeeded(),
            self.skipped(),
            self.failed()
        );
        for report in &self.reports {
            match &report.outcome {
                UnitOutcome::Failed(_) => log::error!("[{}] {}: {}", self.stage, report.unit, report.outcome),
                UnitOutcome::Skipped(SkipReason::InputUnavailable(_)) => {
                    log::warn!("[{}] {}: {}", self.stage, report.unit, report.outcome)
                }
                _ => log::debug!("[{}] {}: {}", self.stage, report.unit, report.outcome),
            }
        }
    }
}

/// Fixed-size pool that runs units and never lets a failure escape
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every distinct unit once and report each outcome in input order
    pub fn run<U: WorkUnit>(&self, stage: &str, units: Vec<U>) -> RunSummary {
        let units = dedup_units(units);
        log::info!("[{}] dispatching {} units on {} workers", stage, units.len(), self.workers);

        let reports = self.dispatch(&units);
        let summary = RunSummary {
            stage: stage.to_string(),
            reports,
        };
        summary.log_summary();
        summary
    }

    #[cfg(feature = "parallel")]
    fn dispatch<U: WorkUnit>(&self, units: &[U]) -> Vec<UnitReport> {
        use rayon::prelude::*;

        match rayon::ThreadPoolBuilder::new().num_threads(self.workers).build() {
            Ok(pool) => pool.install(|| units.par_iter().map(run_unit).collect()),
            Err(e) => {
                log::warn!("Could not start {} workers ({}); running serially", self.workers, e);
                units.iter().map(run_unit).collect()
            }
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn dispatch<U: WorkUnit>(&self, units: &[U]) -> Vec<UnitReport> {
        units.iter().map(run_unit).collect()
    }
}

fn dedup_units<U: WorkUnit>(units: Vec<U>) -> Vec<U> {
    let mut seen = HashSet::new();
    units
        .into_iter()
        .filter(|unit| {
            let fresh = seen.insert(unit.id());
            if !fresh {
                log::warn!("Dropping duplicate unit {}", unit.id());
            }
            fresh
        })
        .collect()
}

/// Existence check, then the unit, with errors and panics captured
pub fn run_unit<U: WorkUnit>(unit: &U) -> UnitReport {
    let id = unit.id();
    let artifacts = unit.artifacts();
    if !artifacts.is_empty() && artifacts.iter().all(|path| path.exists()) {
        log::debug!("{} already exists", id);
        return UnitReport {
            unit: id,
            outcome: UnitOutcome::Skipped(SkipReason::AlreadyExists),
        };
    }

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| unit.run())) {
        Ok(Ok(message)) => UnitOutcome::Success(message),
        Ok(Err(e)) if e.is_input_fault() => UnitOutcome::Skipped(SkipReason::InputUnavailable(e.to_string())),
        Ok(Err(e)) => UnitOutcome::Failed(e.to_string()),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            UnitOutcome::Failed(format!("panicked: {}", message))
        }
    };
    UnitReport { unit: id, outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VegError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FileUnit<'a> {
        path: PathBuf,
        behaviour: &'static str,
        runs: &'a AtomicUsize,
    }

    impl WorkUnit for FileUnit<'_> {
        fn id(&self) -> String {
            self.path.display().to_string()
        }

        fn artifacts(&self) -> Vec<PathBuf> {
            vec![self.path.clone()]
        }

        fn run(&self) -> VegResult<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                "write" => {
                    std::fs::write(&self.path, b"done")?;
                    Ok("written".to_string())
                }
                "missing" => Err(VegError::NoObservations("nothing found".to_string())),
                "broken" => Err(VegError::ShapeMismatch("bad grid".to_string())),
                _ => panic!("unit exploded"),
            }
        }
    }

    #[test]
    fn test_outcomes_are_captured_per_unit() {
        let dir = TempDir::new().unwrap();
        let runs = AtomicUsize::new(0);
        let unit = |name: &str, behaviour| FileUnit {
            path: dir.path().join(name),
            behaviour,
            runs: &runs,
        };

        let summary = WorkerPool::new(3).run(
            "test",
            vec![
                unit("a", "write"),
                unit("b", "missing"),
                unit("c", "broken"),
                unit("d", "panic"),
                unit("a", "write"),
            ],
        );

        assert_eq!(summary.reports.len(), 4);
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.failed(), 2);
        assert!(matches!(
            summary.reports[1].outcome,
            UnitOutcome::Skipped(SkipReason::InputUnavailable(_))
        ));
        assert!(matches!(&summary.reports[3].outcome, UnitOutcome::Failed(m) if m.contains("unit exploded")));
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_existing_artifact_is_not_recomputed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tif");
        std::fs::write(&path, b"original").unwrap();
        let runs = AtomicUsize::new(0);

        let summary = WorkerPool::new(2).run(
            "test",
            vec![FileUnit {
                path: path.clone(),
                behaviour: "write",
                runs: &runs,
            }],
        );

        assert_eq!(summary.reports[0].outcome, UnitOutcome::Skipped(SkipReason::AlreadyExists));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }
}
