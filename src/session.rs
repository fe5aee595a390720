use std::fmt;

use crate::config::TrainConfig;
use crate::dataset::DictionaryStats;
use crate::train::{EpochSummary, TrainOutcome};
use crate::PipelineError;

/// Lifecycle of one dashboard run. Every phase change goes through a checked
/// transition so a stale "is training" flag cannot survive a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Training,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Training => "training",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Single-owner application state for the dashboard: the active
/// configuration, the last loaded dictionary's statistics, live metrics
/// history and the last run outcome.
pub struct Session {
    phase: Phase,
    pub cfg: TrainConfig,
    pub stats: Option<DictionaryStats>,
    pub history: Vec<EpochSummary>,
    pub outcome: Option<TrainOutcome>,
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(cfg: TrainConfig) -> Self {
        Self {
            phase: Phase::Idle,
            cfg,
            stats: None,
            history: Vec::new(),
            outcome: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, from: &[Phase], to: Phase) -> crate::Result<()> {
        if !from.contains(&self.phase) {
            return Err(PipelineError::Session(format!(
                "cannot move from '{}' to '{to}'",
                self.phase
            )));
        }
        self.phase = to;
        Ok(())
    }

    /// A new run starts: previous history and outcome are discarded.
    pub fn begin_preparing(&mut self) -> crate::Result<()> {
        self.transition(&[Phase::Idle, Phase::Done, Phase::Failed], Phase::Preparing)?;
        self.history.clear();
        self.outcome = None;
        self.last_error = None;
        Ok(())
    }

    pub fn begin_training(&mut self) -> crate::Result<()> {
        self.transition(&[Phase::Preparing], Phase::Training)
    }

    pub fn record_epoch(&mut self, summary: &EpochSummary) {
        if self.phase == Phase::Training {
            self.history.push(summary.clone());
        }
    }

    pub fn finish(&mut self, outcome: TrainOutcome) -> crate::Result<()> {
        self.transition(&[Phase::Training], Phase::Done)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Allowed from any phase; the message is surfaced as an error banner.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.phase = Phase::Failed;
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::EpochMetrics;
    use std::path::PathBuf;

    fn session() -> Session {
        Session::new(TrainConfig::defaults())
    }

    fn outcome() -> TrainOutcome {
        TrainOutcome {
            run_dir: PathBuf::from("/tmp/run"),
            history: Vec::new(),
            best_epoch: 1,
            best_val_loss: 0.5,
        }
    }

    fn summary() -> EpochSummary {
        EpochSummary {
            epoch: 1,
            train: EpochMetrics {
                loss: 1.0,
                accuracy: 0.5,
            },
            val: EpochMetrics {
                loss: 1.2,
                accuracy: 0.4,
            },
            epoch_seconds: 0.1,
        }
    }

    #[test]
    fn full_lifecycle() {
        let mut s = session();
        assert_eq!(s.phase(), Phase::Idle);
        s.begin_preparing().unwrap();
        s.begin_training().unwrap();
        s.record_epoch(&summary());
        s.finish(outcome()).unwrap();
        assert_eq!(s.phase(), Phase::Done);
        assert_eq!(s.history.len(), 1);
        assert!(s.outcome.is_some());
    }

    #[test]
    fn cannot_train_from_idle() {
        let mut s = session();
        assert!(matches!(
            s.begin_training(),
            Err(PipelineError::Session(_))
        ));
    }

    #[test]
    fn cannot_finish_without_training() {
        let mut s = session();
        assert!(s.finish(outcome()).is_err());
    }

    #[test]
    fn failure_is_recoverable() {
        let mut s = session();
        s.begin_preparing().unwrap();
        s.fail("dictionary unreadable");
        assert_eq!(s.phase(), Phase::Failed);
        s.begin_preparing().unwrap();
        assert!(s.last_error.is_none());
    }

    #[test]
    fn new_run_clears_history() {
        let mut s = session();
        s.begin_preparing().unwrap();
        s.begin_training().unwrap();
        s.record_epoch(&summary());
        s.finish(outcome()).unwrap();
        s.begin_preparing().unwrap();
        assert!(s.history.is_empty());
        assert!(s.outcome.is_none());
    }
}
