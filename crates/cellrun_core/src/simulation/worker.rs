use super::data::SimulationData;
use super::events::{Command, SimulationEvent};
use super::run::SimulationRun;
use crate::error::{EngineError, EvaluationError, StepError};
use crate::results::{RunId, SharedResults};
use crate::solvers::Integrator;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

enum Outcome {
    Finished,
    Stopped,
}

struct Failure {
    error: EngineError,
    point: f64,
}

/// Wall time of a run, pauses excluded.
struct Clock {
    started: Instant,
    paused: Duration,
}

impl Clock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.paused)
    }
}

pub(crate) struct Worker {
    pub(crate) id: RunId,
    pub(crate) run: SimulationRun,
    pub(crate) data: SimulationData,
    pub(crate) results: SharedResults,
    pub(crate) commands: Receiver<Command>,
    pub(crate) events: Sender<SimulationEvent>,
    pub(crate) progress_stride: usize,
    pub(crate) point_delay: Duration,
}

impl Worker {
    /// Runs to completion and hands the data back to the controller.
    pub(crate) fn run(mut self) -> SimulationData {
        let mut clock = Clock {
            started: Instant::now(),
            paused: Duration::ZERO,
        };
        let mut point = self.run.starting_point;
        let event = match self.simulate(&mut clock, &mut point) {
            Ok(Outcome::Finished) => {
                let elapsed = clock.elapsed();
                info!(run = %self.id, ?elapsed, "simulation finished");
                SimulationEvent::Finished {
                    run: self.id,
                    elapsed,
                }
            }
            Ok(Outcome::Stopped) => {
                info!(run = %self.id, point, "simulation stopped");
                SimulationEvent::Stopped { run: self.id, point }
            }
            Err(failure) => {
                error!(run = %self.id, point = failure.point, error = %failure.error, "simulation failed");
                SimulationEvent::Failed {
                    run: self.id,
                    error: failure.error,
                    point: failure.point,
                }
            }
        };
        self.results.write().finish_run(self.id);
        // The controller may already be gone.
        let _ = self.events.send(event);
        self.data
    }

    fn send(&self, event: SimulationEvent) {
        let _ = self.events.send(event);
    }

    fn simulate(&mut self, clock: &mut Clock, point: &mut f64) -> Result<Outcome, Failure> {
        let t0 = self.run.starting_point;
        let solver = self.run.plan.ode.kind().name();
        let evaluation = |time: f64| {
            move |e: EvaluationError| Failure {
                error: StepError::new(solver, time, e).into(),
                point: time,
            }
        };

        if let Some(nla) = self.run.plan.nla {
            self.data.set_nla(nla);
        }
        self.data.recompute_variables(t0).map_err(evaluation(t0))?;
        let mut integrator = Integrator::initialize(
            &self.run.plan,
            t0,
            self.data.states(),
            &self.data.evaluator().unknowns(),
        )
        .map_err(|e| Failure {
            error: e.into(),
            point: t0,
        })?;

        let size = self.run.size();
        self.send(SimulationEvent::Started {
            run: self.id,
            points: size,
        });
        let mut row = Vec::new();
        let outcome = self.points(&mut integrator, clock, point, &mut row, size);
        integrator.dispose();
        outcome
    }

    fn points(
        &mut self,
        integrator: &mut Integrator,
        clock: &mut Clock,
        point: &mut f64,
        row: &mut Vec<f64>,
        size: usize,
    ) -> Result<Outcome, Failure> {
        let solver = integrator.kind().name();
        self.append(*point, row)?;

        for k in 1..size {
            let target = self.run.point(k);
            integrator
                .step(self.data.evaluator(), target)
                .map_err(|e| Failure {
                    error: e.into(),
                    point: *point,
                })?;
            self.data.set_states(integrator.states());
            self.data.recompute_variables(target).map_err(|e| Failure {
                error: StepError::new(solver, target, e).into(),
                point: target,
            })?;
            *point = target;
            self.append(target, row)?;
            trace!(run = %self.id, point = target, "point accepted");

            if k % self.progress_stride == 0 || k + 1 == size {
                self.send(SimulationEvent::Progress {
                    run: self.id,
                    point: target,
                    fraction: k as f64 / (size - 1) as f64,
                });
            }
            if !self.point_delay.is_zero() {
                thread::sleep(self.point_delay);
            }
            if k + 1 < size {
                if let Some(outcome) = self.apply_commands(integrator, clock, target)? {
                    return Ok(outcome);
                }
            }
        }
        Ok(Outcome::Finished)
    }

    fn append(&mut self, point: f64, row: &mut Vec<f64>) -> Result<(), Failure> {
        self.data.fill_row(point, row);
        self.results
            .write()
            .append(self.id, row)
            .map_err(|e| Failure {
                error: e.into(),
                point,
            })
    }

    /// Applies the pending commands. A pause blocks here until the run is
    /// resumed or stopped.
    fn apply_commands(
        &mut self,
        integrator: &mut Integrator,
        clock: &mut Clock,
        point: f64,
    ) -> Result<Option<Outcome>, Failure> {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Ok(Some(Outcome::Stopped)),
            };
            match command {
                Command::Pause => {
                    if let Some(outcome) = self.pause(integrator, clock, point)? {
                        return Ok(Some(outcome));
                    }
                }
                Command::Resume => {}
                Command::Stop => return Ok(Some(Outcome::Stopped)),
                Command::Reset { all } => self.reset(integrator, point, all)?,
            }
        }
    }

    fn pause(
        &mut self,
        integrator: &mut Integrator,
        clock: &mut Clock,
        point: f64,
    ) -> Result<Option<Outcome>, Failure> {
        let paused_at = Instant::now();
        info!(run = %self.id, point, "simulation paused");
        self.send(SimulationEvent::Paused { run: self.id, point });

        let outcome = loop {
            match self.commands.recv() {
                Ok(Command::Resume) => break None,
                Ok(Command::Stop) | Err(_) => break Some(Outcome::Stopped),
                Ok(Command::Reset { all }) => self.reset(integrator, point, all)?,
                Ok(Command::Pause) => {}
            }
        };
        clock.paused += paused_at.elapsed();
        if outcome.is_none() {
            info!(run = %self.id, point, "simulation resumed");
            self.send(SimulationEvent::Resumed { run: self.id });
        }
        Ok(outcome)
    }

    /// Resets the data and restarts the integrator from it at `point`.
    fn reset(&mut self, integrator: &mut Integrator, point: f64, all: bool) -> Result<(), Failure> {
        let solver = integrator.kind().name();
        let failed = |e: EvaluationError| Failure {
            error: StepError::new(solver, point, e).into(),
            point,
        };
        self.data.reset(all).map_err(failed)?;
        self.data.recompute_variables(point).map_err(failed)?;
        integrator.reinitialize(point, self.data.states(), &self.data.evaluator().unknowns());
        debug!(run = %self.id, point, all, "integrator reinitialized");
        self.send(SimulationEvent::Reset { run: self.id, all });
        Ok(())
    }
}
