use super::data::SimulationData;
use super::events::{Command, SimulationEvent};
use super::run::{SimulationRun, SimulationSettings};
use super::worker::Worker;
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, EvaluationError, StepError, ThreadError};
use crate::model::ModelRuntime;
use crate::results::{ResultsStore, RunId, SharedResults};
use crate::solvers::SolverKind;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Paused,
    Stopping,
    Finished,
    Failed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::Paused => "paused",
            ControllerState::Stopping => "stopping",
            ControllerState::Finished => "finished",
            ControllerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct ActiveRun {
    id: RunId,
    commands: Sender<Command>,
    events: Receiver<SimulationEvent>,
    handle: JoinHandle<SimulationData>,
}

/// Drives one model through time on a worker thread.
///
/// The controller owns the simulation data while no run is active and lends
/// it to the worker for the duration of a run. Its state only changes on
/// the owning thread: through requests, or while draining the worker's
/// events with [`poll_events`](Self::poll_events) or [`wait`](Self::wait).
pub struct SimulationController {
    runtime: Arc<ModelRuntime>,
    config: EngineConfig,
    settings: SimulationSettings,
    results: SharedResults,
    data: Option<SimulationData>,
    state: ControllerState,
    active: Option<ActiveRun>,
    pending: Vec<SimulationEvent>,
    last_error: Option<EngineError>,
}

impl SimulationController {
    pub fn new(runtime: Arc<ModelRuntime>, config: EngineConfig) -> Result<Self, EngineError> {
        let settings = SimulationSettings::default();
        let data = SimulationData::new(Arc::clone(&runtime), None, settings.starting_point)
            .map_err(|e| evaluation_failed(&runtime, &settings, settings.starting_point, e))?;
        let results = ResultsStore::new(runtime.layout().clone(), &config).shared();
        Ok(Self {
            runtime,
            config,
            settings,
            results,
            data: Some(data),
            state: ControllerState::Idle,
            active: None,
            pending: Vec::new(),
            last_error: None,
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn runtime(&self) -> &Arc<ModelRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Settings of the latest run.
    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    pub fn results(&self) -> SharedResults {
        Arc::clone(&self.results)
    }

    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    /// The simulation data, unless a run currently holds it.
    pub fn data(&self) -> Option<&SimulationData> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Result<&mut SimulationData, EngineError> {
        let state = self.state;
        self.data
            .as_mut()
            .ok_or_else(|| not_allowed("modify the simulation data", state))
    }

    /// Validates `settings`, reserves memory for the results and starts a
    /// worker thread.
    pub fn run(&mut self, settings: SimulationSettings) -> Result<RunId, EngineError> {
        if self.active.is_some() {
            return Err(not_allowed("start a run", self.state));
        }
        let Some(data) = self.data.as_mut() else {
            return Err(not_allowed("start a run", self.state));
        };

        // Constants may have been edited since the last computation.
        data.set_starting_point(settings.starting_point);
        data.recompute_computed_constants_and_variables(settings.starting_point)
            .map_err(|e| evaluation_failed(&self.runtime, &settings, settings.starting_point, e))?;
        let run = SimulationRun::new(&settings, &self.runtime, data.states(), data.constants())?;
        let id = self
            .results
            .write()
            .begin_run(run.size(), run.workspace_bytes(&self.runtime))?;

        let (command_sender, command_receiver) = unbounded();
        let (event_sender, event_receiver) = unbounded();
        let points = run.size();
        let Some(data) = self.data.take() else {
            return Err(not_allowed("start a run", self.state));
        };
        let worker = Worker {
            id,
            run,
            data,
            results: Arc::clone(&self.results),
            commands: command_receiver,
            events: event_sender,
            progress_stride: self.config.progress_stride.max(1),
            point_delay: self.config.point_delay(),
        };
        let spawned = thread::Builder::new()
            .name(format!("cellrun-run-{id}"))
            .spawn(move || worker.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.results.write().finish_run(id);
                self.data = SimulationData::new(Arc::clone(&self.runtime), None, settings.starting_point).ok();
                return Err(ThreadError::Spawn {
                    cause: e.to_string(),
                }
                .into());
            }
        };

        info!(
            run = %id,
            points,
            solver = settings.ode.as_ref().map_or("none", |setup| setup.kind.name()),
            "simulation started"
        );
        self.settings = settings;
        self.last_error = None;
        self.state = ControllerState::Running;
        self.active = Some(ActiveRun {
            id,
            commands: command_sender,
            events: event_receiver,
            handle,
        });
        Ok(id)
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        match self.state {
            ControllerState::Running => {
                self.send(Command::Pause);
                self.state = ControllerState::Paused;
                Ok(())
            }
            ControllerState::Paused => {
                warn!("the simulation is already paused");
                Ok(())
            }
            state => Err(not_allowed("pause the simulation", state)),
        }
    }

    pub fn resume(&mut self) -> Result<(), EngineError> {
        match self.state {
            ControllerState::Paused => {
                self.send(Command::Resume);
                self.state = ControllerState::Running;
                Ok(())
            }
            ControllerState::Running => {
                warn!("the simulation is already running");
                Ok(())
            }
            state => Err(not_allowed("resume the simulation", state)),
        }
    }

    /// Stops the active run, if any, and joins its worker. Rows accepted so
    /// far stay in the results. Always leaves the controller idle.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if let Some(active) = &self.active {
            self.state = ControllerState::Stopping;
            // Fails only when the worker has already ended.
            let _ = active.commands.send(Command::Stop);
            self.pending.extend(active.events.iter());
            let joined = self.join();
            self.state = ControllerState::Idle;
            return joined;
        }
        self.state = ControllerState::Idle;
        Ok(())
    }

    /// Resets the states to their initial values, keeping user constants.
    pub fn reset_states(&mut self) -> Result<(), EngineError> {
        self.reset(false)
    }

    /// Resets every variable to the model's initial values.
    pub fn reset_all(&mut self) -> Result<(), EngineError> {
        self.reset(true)
    }

    fn reset(&mut self, all: bool) -> Result<(), EngineError> {
        match self.state {
            ControllerState::Paused => {
                self.send(Command::Reset { all });
                Ok(())
            }
            ControllerState::Running | ControllerState::Stopping => {
                Err(not_allowed("reset the simulation", self.state))
            }
            state => {
                let Some(data) = self.data.as_mut() else {
                    return Err(not_allowed("reset the simulation", state));
                };
                data.reset(all).map_err(|e| {
                    evaluation_failed(&self.runtime, &self.settings, self.settings.starting_point, e)
                })
            }
        }
    }

    /// Drops every stored run.
    pub fn clear_results(&mut self) -> Result<(), EngineError> {
        if self.active.is_some() {
            return Err(not_allowed("clear the results", self.state));
        }
        self.results.write().clear();
        Ok(())
    }

    /// Events received since the last call, without blocking.
    pub fn poll_events(&mut self) -> Result<Vec<SimulationEvent>, EngineError> {
        let mut events = std::mem::take(&mut self.pending);
        let mut received = Vec::new();
        if let Some(active) = &self.active {
            received.extend(active.events.try_iter());
        }
        self.observe(&received)?;
        events.extend(received);
        Ok(events)
    }

    /// Blocks until the active run ends and returns its remaining events.
    pub fn wait(&mut self) -> Result<Vec<SimulationEvent>, EngineError> {
        if self.state == ControllerState::Paused {
            return Err(not_allowed("wait for the simulation", self.state));
        }
        let mut events = std::mem::take(&mut self.pending);
        let mut received = Vec::new();
        if let Some(active) = &self.active {
            for event in active.events.iter() {
                let terminal = event.is_terminal();
                received.push(event);
                if terminal {
                    break;
                }
            }
        }
        let observed = self.observe(&received);
        if self.active.is_some() {
            // The worker ended without a terminal event.
            self.join()?;
        }
        observed?;
        events.extend(received);
        Ok(events)
    }

    fn observe(&mut self, events: &[SimulationEvent]) -> Result<(), EngineError> {
        for event in events {
            match event {
                SimulationEvent::Finished { .. } => self.state = ControllerState::Finished,
                SimulationEvent::Failed { error, .. } => {
                    self.state = ControllerState::Failed;
                    self.last_error = Some(error.clone());
                }
                SimulationEvent::Stopped { .. } => self.state = ControllerState::Idle,
                _ => {}
            }
        }
        if events.iter().any(SimulationEvent::is_terminal) {
            self.join()?;
        }
        Ok(())
    }

    fn send(&self, command: Command) {
        if let Some(active) = &self.active {
            if active.commands.send(command).is_err() {
                warn!(run = %active.id, ?command, "the simulation worker has already ended");
            }
        }
    }

    fn join(&mut self) -> Result<(), EngineError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        match active.handle.join() {
            Ok(data) => {
                self.data = Some(data);
                Ok(())
            }
            Err(_) => {
                let error = EngineError::from(ThreadError::Panicked);
                self.state = ControllerState::Failed;
                self.last_error = Some(error.clone());
                self.data = SimulationData::new(
                    Arc::clone(&self.runtime),
                    None,
                    self.settings.starting_point,
                )
                .ok();
                Err(error)
            }
        }
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        if self.active.is_some() {
            let _ = self.stop();
        }
    }
}

fn not_allowed(operation: &str, state: ControllerState) -> EngineError {
    ConfigError::NotAllowedWhile {
        operation: operation.to_string(),
        state: state.to_string(),
    }
    .into()
}

/// Evaluation failures outside a step are charged to the NLA solver when
/// the model needs one, otherwise to the selected ODE solver.
fn evaluation_failed(
    runtime: &ModelRuntime,
    settings: &SimulationSettings,
    time: f64,
    error: EvaluationError,
) -> EngineError {
    let kind = if runtime.needs_nla_solver() {
        settings.nla.as_ref().map_or(SolverKind::Newton, |setup| setup.kind)
    } else {
        settings.ode.as_ref().map_or(SolverKind::Sdirk, |setup| setup.kind)
    };
    StepError::new(kind.name(), time, error).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::model::{ColumnId, ModelDescription};
    use crate::solvers::properties::MAXIMUM_STEP;
    use crate::solvers::SolverSetup;
    use crate::test_models;
    use std::time::{Duration, Instant};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, EngineError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn controller(description: ModelDescription, config: EngineConfig) -> SimulationController {
        let runtime = ModelRuntime::compile(description, &config).expect("compile");
        SimulationController::new(Arc::new(runtime), config).expect("controller")
    }

    fn slow() -> EngineConfig {
        EngineConfig {
            point_delay_ms: 1,
            ..EngineConfig::default()
        }
    }

    fn rk4(starting_point: f64, ending_point: f64, point_interval: f64) -> SimulationSettings {
        SimulationSettings {
            starting_point,
            ending_point,
            point_interval,
            ode: Some(SolverSetup::new(SolverKind::FourthOrderRungeKutta)),
            nla: None,
        }
    }

    fn rows(controller: &SimulationController, run: RunId) -> Vec<Vec<f64>> {
        let results = controller.results();
        let store = results.read();
        let view = store.run(run).expect("run");
        (0..view.len())
            .map(|i| view.row(i).expect("row").to_vec())
            .collect()
    }

    /// Polls until `accept` matches an event, collecting everything seen.
    fn poll_until(
        controller: &mut SimulationController,
        accept: impl Fn(&SimulationEvent) -> bool,
    ) -> Vec<SimulationEvent> {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let events = controller.poll_events().expect("poll");
            let found = events.iter().any(&accept);
            seen.extend(events);
            if found {
                return seen;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out, events so far: {seen:?}");
    }

    #[test]
    fn two_state_model_produces_one_row_per_point() {
        let mut controller = controller(test_models::oscillator(), EngineConfig::default());
        let run = controller.run(rk4(0.0, 10.0, 1.0)).expect("run");
        let events = controller.wait().expect("wait");
        assert_eq!(controller.state(), ControllerState::Finished);
        assert!(matches!(events.first(), Some(SimulationEvent::Started { points: 11, .. })));
        assert!(matches!(events.last(), Some(SimulationEvent::Finished { .. })));

        let rows = rows(&controller, run);
        assert_eq!(rows.len(), 11);
        let points: Vec<f64> = rows.iter().map(|row| row[0]).collect();
        assert_eq!(points, (0..=10).map(f64::from).collect::<Vec<_>>());

        let layout = controller.runtime().layout();
        let x = layout.by_name("x").expect("x");
        let y = layout.by_name("y").expect("y");
        assert_eq!(rows[0][x.0], 1.0);
        assert_eq!(rows[0][y.0], 0.0);
        assert_eq!(controller.data().expect("data").initial_states(), &[1.0, 0.0]);
    }

    #[test]
    fn default_settings_integrate_with_sdirk() {
        let mut controller = controller(test_models::decay(), EngineConfig::default());
        let settings = SimulationSettings {
            ending_point: 10.0,
            ..SimulationSettings::default()
        };
        let run = controller.run(settings).expect("run");
        let events = controller.wait().expect("wait");
        assert_eq!(controller.state(), ControllerState::Finished);
        let progress = events
            .iter()
            .filter(|event| matches!(event, SimulationEvent::Progress { .. }))
            .count();
        assert_eq!(progress, 1);

        let rows = rows(&controller, run);
        assert_eq!(rows.len(), 11);
        for row in &rows {
            let exact = (-row[0]).exp();
            assert!((row[3] - exact).abs() < 1e-5, "x({}) = {}", row[0], row[3]);
        }
    }

    #[test]
    fn missing_nla_solver_is_reported_before_starting() {
        let mut controller = controller(test_models::algebraic(), EngineConfig::default());
        let err = controller.run(rk4(0.0, 1.0, 0.1)).expect_err("no NLA solver");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert_eq!(
            err.to_string(),
            "the model needs both an ODE and an NLA solver, but no NLA solver is available"
        );
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.results().read().runs().count(), 0);
    }

    #[test]
    fn models_with_algebraic_unknowns_run_with_both_solvers() {
        let mut controller = controller(test_models::algebraic(), EngineConfig::default());
        let mut settings = rk4(0.0, 1.0, 0.1);
        settings.nla = Some(SolverSetup::new(SolverKind::Newton));
        let run = controller.run(settings).expect("run");
        controller.wait().expect("wait");
        assert_eq!(controller.state(), ControllerState::Finished);

        let z = controller.runtime().layout().by_name("z").expect("z");
        let x = controller.runtime().layout().by_name("x").expect("x");
        for row in rows(&controller, run) {
            let residual = row[z.0].powi(3) + row[z.0] - row[x.0];
            assert!(residual.abs() < 1e-8, "residual {residual} at t = {}", row[0]);
        }
    }

    #[test]
    fn dae_solver_runs_models_without_algebraic_unknowns() {
        let mut controller = controller(test_models::decay(), EngineConfig::default());
        let settings = SimulationSettings {
            starting_point: 0.0,
            ending_point: 1.0,
            point_interval: 0.1,
            ode: Some(SolverSetup::new(SolverKind::BackwardEulerDae).with(MAXIMUM_STEP, 0.001)),
            nla: Some(SolverSetup::new(SolverKind::Newton)),
        };
        let run = controller.run(settings).expect("run");
        let events = controller.wait().expect("wait");
        assert_eq!(controller.state(), ControllerState::Finished);
        assert!(matches!(events.last(), Some(SimulationEvent::Finished { .. })));

        let x = controller.runtime().layout().by_name("x").expect("x");
        let rows = rows(&controller, run);
        assert_eq!(rows.len(), 11);
        for row in &rows {
            let exact = (-row[0]).exp();
            assert!((row[x.0] - exact).abs() < 1e-3, "x({}) = {}", row[0], row[x.0]);
        }
    }

    #[test]
    fn pause_and_resume_do_not_change_the_results() {
        let mut reference = controller(test_models::oscillator(), EngineConfig::default());
        let first = reference.run(rk4(0.0, 2.0, 0.01)).expect("run");
        reference.wait().expect("wait");

        let mut controller = controller(test_models::oscillator(), slow());
        let second = controller.run(rk4(0.0, 2.0, 0.01)).expect("run");
        controller.pause().expect("pause");
        assert_eq!(controller.state(), ControllerState::Paused);
        poll_until(&mut controller, |event| {
            matches!(event, SimulationEvent::Paused { .. })
        });
        controller.resume().expect("resume");
        let events = controller.wait().expect("wait");
        assert!(events.iter().any(|event| matches!(event, SimulationEvent::Resumed { .. })));
        assert_eq!(controller.state(), ControllerState::Finished);

        let bits = |rows: Vec<Vec<f64>>| -> Vec<Vec<u64>> {
            rows.into_iter()
                .map(|row| row.into_iter().map(f64::to_bits).collect())
                .collect()
        };
        assert_eq!(bits(rows(&reference, first)), bits(rows(&controller, second)));
    }

    #[test]
    fn stop_is_idempotent_and_keeps_accepted_rows() {
        let mut controller = controller(test_models::oscillator(), slow());
        let run = controller.run(rk4(0.0, 1000.0, 1.0)).expect("run");
        poll_until(&mut controller, |event| {
            matches!(event, SimulationEvent::Started { .. })
        });
        controller.stop().expect("stop");
        assert_eq!(controller.state(), ControllerState::Idle);
        controller.stop().expect("stop again");
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(controller.data().is_some());

        let events = controller.poll_events().expect("poll");
        assert!(matches!(events.last(), Some(SimulationEvent::Stopped { .. })));
        let accepted = rows(&controller, run).len();
        assert!(accepted >= 1 && accepted < 1001);

        let next = controller.run(rk4(0.0, 1.0, 0.5)).expect("run again");
        controller.wait().expect("wait");
        assert_eq!(rows(&controller, next).len(), 3);
        assert_eq!(rows(&controller, run).len(), accepted);
    }

    #[test]
    fn resets_are_rejected_while_running() {
        let mut controller = controller(test_models::oscillator(), slow());
        controller.run(rk4(0.0, 1000.0, 1.0)).expect("run");
        assert_err_contains(
            controller.reset_states(),
            "cannot reset the simulation while the simulation is running",
        );
        assert_err_contains(controller.clear_results(), "cannot clear the results");
        assert_err_contains(controller.run(rk4(0.0, 1.0, 0.5)), "cannot start a run");
        controller.stop().expect("stop");
    }

    #[test]
    fn resets_while_paused_restart_from_the_initial_values() {
        let mut controller = controller(test_models::oscillator(), slow());
        let run = controller.run(rk4(0.0, 1000.0, 1.0)).expect("run");
        controller.pause().expect("pause");
        poll_until(&mut controller, |event| {
            matches!(event, SimulationEvent::Paused { .. })
        });
        controller.reset_all().expect("reset");
        poll_until(&mut controller, |event| {
            matches!(event, SimulationEvent::Reset { all: true, .. })
        });
        controller.stop().expect("stop");
        assert!(rows(&controller, run).len() >= 2);
        assert_eq!(controller.data().expect("data").states(), &[1.0, 0.0]);
    }

    #[test]
    fn failures_keep_the_rows_computed_so_far() {
        let mut controller = controller(test_models::failing(2.5), EngineConfig::default());
        let run = controller.run(rk4(0.0, 10.0, 1.0)).expect("run");
        let events = controller.wait().expect("wait");
        assert_eq!(controller.state(), ControllerState::Failed);

        let Some(SimulationEvent::Failed { error, point, .. }) = events.last() else {
            panic!("expected a failure, got {events:?}");
        };
        assert_eq!(*point, 2.0);
        assert_eq!(error.category(), ErrorCategory::Step);
        assert!(error.to_string().contains("`compute_rates` reported error code 3"));
        assert_eq!(controller.last_error(), Some(error));

        let points: Vec<f64> = rows(&controller, run).iter().map(|row| row[0]).collect();
        assert_eq!(points, vec![0.0, 1.0, 2.0]);
        assert!(controller.data().is_some());
    }

    #[test]
    fn runs_that_do_not_fit_the_budget_never_start() {
        let config = EngineConfig {
            memory_budget: 1024,
            ..EngineConfig::default()
        };
        let mut controller = controller(test_models::decay(), config);
        let err = controller.run(rk4(0.0, 1000.0, 1.0)).expect_err("too large");
        assert_eq!(err.category(), ErrorCategory::Memory);
        assert!(err.to_string().starts_with("the simulation requires"));
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(controller.data().is_some());
    }

    #[test]
    fn sequential_runs_share_the_results_until_cleared() {
        let mut controller = controller(test_models::decay(), EngineConfig::default());
        let first = controller.run(rk4(0.0, 1.0, 0.5)).expect("first");
        controller.wait().expect("wait");
        let second = controller.run(rk4(0.0, 2.0, 0.5)).expect("second");
        controller.wait().expect("wait");
        {
            let results = controller.results();
            let store = results.read();
            assert_eq!(store.runs().count(), 2);
            assert_eq!(store.latest_run().map(|view| view.id()), Some(second));
            let x = ColumnId(3);
            let view = store.run(first).expect("first run");
            let expected = (-0.75f64).exp();
            assert!((view.interpolate(x, 0.75) - expected).abs() < 2e-2);
        }
        controller.clear_results().expect("clear");
        assert_eq!(controller.results().read().runs().count(), 0);
    }

    #[test]
    fn changing_the_starting_point_recomputes_the_data() {
        let mut controller = controller(test_models::decay(), EngineConfig::default());
        controller.data_mut().expect("data").set_constant(0, 2.0).expect("constant");
        let run = controller.run(rk4(5.0, 6.0, 0.5)).expect("run");
        controller.wait().expect("wait");
        let rows = rows(&controller, run);
        assert_eq!(rows[0][0], 5.0);
        // k = 2 from the user, x' = -k x.
        assert_eq!(rows[0][1], 2.0);
        assert_eq!(rows[0][2], -2.0);
        assert_eq!(controller.data().expect("data").starting_point(), 5.0);
    }

    #[test]
    fn pause_requires_a_running_simulation() {
        let mut controller = controller(test_models::decay(), EngineConfig::default());
        assert_err_contains(controller.pause(), "cannot pause the simulation while the simulation is idle");
        assert_err_contains(controller.resume(), "cannot resume the simulation while the simulation is idle");
        controller.reset_all().expect("reset while idle");
    }
}
