use crate::core::worker_pool::RunSummary;
use crate::types::{TileId, VegResult};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Per-tile stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TileStage {
    Download,
    Index,
    BuildSeries,
}

impl TileStage {
    pub const ORDER: [TileStage; 3] = [TileStage::Download, TileStage::Index, TileStage::BuildSeries];

    pub fn name(&self) -> &'static str {
        match self {
            TileStage::Download => "download",
            TileStage::Index => "index",
            TileStage::BuildSeries => "series",
        }
    }

    /// State a tile enters when this stage starts
    fn entered_state(&self) -> Option<TileState> {
        match self {
            TileStage::Download => Some(TileState::Downloading),
            TileStage::Index => Some(TileState::Indexing),
            TileStage::BuildSeries => None,
        }
    }

    /// State a tile enters when this stage succeeds
    fn completed_state(&self) -> Option<TileState> {
        match self {
            TileStage::BuildSeries => Some(TileState::SeriesBuilt),
            _ => None,
        }
    }
}

impl fmt::Display for TileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of one tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileState {
    Pending,
    Downloading,
    Indexing,
    SeriesBuilt,
    Done,
    Failed { stage: TileStage, message: String },
}

impl TileState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TileState::Done | TileState::Failed { .. })
    }
}

/// Work performed for one tile at each stage.
///
/// A stage may hand back the per-unit summary of work it dispatched.
pub trait TileStages {
    fn run_stage(&self, stage: TileStage, tile: &TileId) -> VegResult<Option<RunSummary>>;
}

/// Tile states, their history and the merged per-stage summaries
#[derive(Debug, Clone, Default)]
pub struct TileLoopReport {
    /// Latest state of each tile; terminal once the loop returns
    pub states: BTreeMap<TileId, TileState>,
    /// Every state change in the order it happened
    pub transitions: Vec<(TileId, TileState)>,
    pub summaries: BTreeMap<TileStage, RunSummary>,
}

impl TileLoopReport {
    fn enter(&mut self, tile: &TileId, state: TileState) {
        log::debug!("Tile {}: {:?}", tile, state);
        self.transitions.push((tile.clone(), state.clone()));
        self.states.insert(tile.clone(), state);
    }

    /// States `tile` passed through, in order
    pub fn history(&self, tile: &TileId) -> Vec<TileState> {
        self.transitions
            .iter()
            .filter(|(t, _)| t == tile)
            .map(|(_, state)| state.clone())
            .collect()
    }

    /// Tiles that completed every stage, in tile order
    pub fn done_tiles(&self) -> Vec<TileId> {
        self.states
            .iter()
            .filter(|(_, state)| **state == TileState::Done)
            .map(|(tile, _)| tile.clone())
            .collect()
    }

    pub fn failed_tiles(&self) -> Vec<(TileId, TileStage, String)> {
        self.states
            .iter()
            .filter_map(|(tile, state)| match state {
                TileState::Failed { stage, message } => Some((tile.clone(), *stage, message.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Runs the per-tile stages; a tile's failure ends only that tile
#[derive(Debug, Clone, Copy, Default)]
pub struct TileLoop;

impl TileLoop {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, stages: &dyn TileStages, tiles: &[TileId]) -> TileLoopReport {
        let mut report = TileLoopReport::default();
        for tile in tiles {
            if !report.states.contains_key(tile) {
                report.enter(tile, TileState::Pending);
            }
        }

        for tile in tiles {
            if report.states.get(tile).map_or(false, TileState::is_terminal) {
                log::warn!("Tile {} listed twice; ignoring repeat", tile);
                continue;
            }
            let state = self.run_tile(stages, tile, &mut report);
            match &state {
                TileState::Done => log::info!("Tile {} done", tile),
                TileState::Failed { stage, message } => {
                    log::error!("Tile {} failed at {}: {}", tile, stage, message)
                }
                _ => {}
            }
            report.enter(tile, state);
        }

        log::info!(
            "Tile loop finished: {} done, {} failed",
            report.done_tiles().len(),
            report.failed_tiles().len()
        );
        report
    }

    /// Runs the stages of one tile and returns its terminal state
    fn run_tile(&self, stages: &dyn TileStages, tile: &TileId, report: &mut TileLoopReport) -> TileState {
        for stage in TileStage::ORDER {
            if let Some(state) = stage.entered_state() {
                report.enter(tile, state);
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| stages.run_stage(stage, tile)));
            match result {
                Ok(Ok(summary)) => {
                    if let Some(summary) = summary {
                        report
                            .summaries
                            .entry(stage)
                            .or_insert_with(|| RunSummary::new(stage.name()))
                            .merge(summary);
                    }
                    if let Some(state) = stage.completed_state() {
                        report.enter(tile, state);
                    }
                }
                Ok(Err(e)) => {
                    return TileState::Failed {
                        stage,
                        message: e.to_string(),
                    }
                }
                Err(_) => {
                    return TileState::Failed {
                        stage,
                        message: "stage panicked".to_string(),
                    }
                }
            }
        }
        TileState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VegError;
    use std::sync::Mutex;

    struct Scripted {
        fail: Option<(&'static str, TileStage)>,
        calls: Mutex<Vec<(String, TileStage)>>,
    }

    impl TileStages for Scripted {
        fn run_stage(&self, stage: TileStage, tile: &TileId) -> VegResult<Option<RunSummary>> {
            self.calls.lock().unwrap().push((tile.to_string(), stage));
            match self.fail {
                Some((bad, at)) if bad == tile.as_str() && at == stage => {
                    Err(VegError::NoObservations(format!("nothing for {}", tile)))
                }
                _ => Ok(Some(RunSummary::new(stage.name()))),
            }
        }
    }

    #[test]
    fn test_failure_is_isolated_to_its_tile() {
        let stages = Scripted {
            fail: Some(("34HCH", TileStage::Index)),
            calls: Mutex::new(Vec::new()),
        };
        let tiles = [TileId::new("34HBH"), TileId::new("34HCH"), TileId::new("34HDH")];

        let report = TileLoop::new().run(&stages, &tiles);

        assert_eq!(report.done_tiles(), vec![TileId::new("34HBH"), TileId::new("34HDH")]);
        let failed = report.failed_tiles();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, TileId::new("34HCH"));
        assert_eq!(failed[0].1, TileStage::Index);

        let calls = stages.calls.lock().unwrap();
        assert!(!calls.contains(&("34HCH".to_string(), TileStage::BuildSeries)));
        assert!(calls.contains(&("34HDH".to_string(), TileStage::BuildSeries)));
        assert_eq!(calls.len(), 8);

        assert_eq!(
            report.history(&TileId::new("34HBH")),
            vec![
                TileState::Pending,
                TileState::Downloading,
                TileState::Indexing,
                TileState::SeriesBuilt,
                TileState::Done
            ]
        );
        assert_eq!(
            report.history(&TileId::new("34HCH")),
            vec![
                TileState::Pending,
                TileState::Downloading,
                TileState::Indexing,
                TileState::Failed {
                    stage: TileStage::Index,
                    message: "No observations: nothing for 34HCH".to_string()
                }
            ]
        );
    }

    struct Exploding;

    impl TileStages for Exploding {
        fn run_stage(&self, stage: TileStage, _tile: &TileId) -> VegResult<Option<RunSummary>> {
            if stage == TileStage::BuildSeries {
                panic!("corrupt volume");
            }
            Ok(None)
        }
    }

    #[test]
    fn test_panicking_stage_marks_tile_failed() {
        let report = TileLoop::new().run(&Exploding, &[TileId::new("34HBH")]);
        assert!(report.done_tiles().is_empty());
        assert_eq!(
            report.states[&TileId::new("34HBH")],
            TileState::Failed {
                stage: TileStage::BuildSeries,
                message: "stage panicked".to_string()
            }
        );
    }
}
