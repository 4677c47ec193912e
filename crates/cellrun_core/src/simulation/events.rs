use crate::error::EngineError;
use crate::results::RunId;
use std::time::Duration;

/// Requests from the controller, applied by the worker between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Pause,
    Resume,
    Stop,
    Reset { all: bool },
}

/// What the worker reports back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationEvent {
    Started {
        run: RunId,
        points: usize,
    },
    Progress {
        run: RunId,
        point: f64,
        /// Share of the points computed so far, in `[0, 1]`.
        fraction: f64,
    },
    Paused {
        run: RunId,
        point: f64,
    },
    Resumed {
        run: RunId,
    },
    Reset {
        run: RunId,
        all: bool,
    },
    Finished {
        run: RunId,
        /// Wall time spent computing, pauses excluded.
        elapsed: Duration,
    },
    Stopped {
        run: RunId,
        point: f64,
    },
    Failed {
        run: RunId,
        error: EngineError,
        point: f64,
    },
}

impl SimulationEvent {
    pub fn run(&self) -> RunId {
        match self {
            SimulationEvent::Started { run, .. }
            | SimulationEvent::Progress { run, .. }
            | SimulationEvent::Paused { run, .. }
            | SimulationEvent::Resumed { run }
            | SimulationEvent::Reset { run, .. }
            | SimulationEvent::Finished { run, .. }
            | SimulationEvent::Stopped { run, .. }
            | SimulationEvent::Failed { run, .. } => *run,
        }
    }

    /// Whether this is the last event of its run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SimulationEvent::Finished { .. }
                | SimulationEvent::Stopped { .. }
                | SimulationEvent::Failed { .. }
        )
    }
}
