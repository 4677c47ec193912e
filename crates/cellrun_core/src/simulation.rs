//! Simulation controller.
//!
//! A [`SimulationController`] validates a run, reserves its results and
//! hands the [`SimulationData`] to a worker thread, which steps the selected
//! integrator from point to point and appends one row per point. Requests
//! (pause, resume, stop, reset) travel to the worker over a channel and take
//! effect between two points; the worker reports back with
//! [`SimulationEvent`]s.

mod controller;
mod data;
mod events;
mod run;
mod worker;

pub use controller::{ControllerState, SimulationController};
pub use data::SimulationData;
pub use events::SimulationEvent;
pub use run::{run_size, validate_points, SimulationRun, SimulationSettings};
