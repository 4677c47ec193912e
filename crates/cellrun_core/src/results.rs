//! Append-only time series of simulation results.
//!
//! Each run owns a row-major buffer with one column per variable, in the
//! order of the model's [`ColumnLayout`]. Buffers grow in chunks of
//! `chunk_rows` rows up to the capacity reserved by [`ResultsStore::begin_run`],
//! which is checked against the memory budget before anything is allocated.

use crate::config::EngineConfig;
use crate::error::MemoryError;
use crate::model::{ColumnId, ColumnLayout};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

pub type SharedResults = Arc<RwLock<ResultsStore>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u32);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const VALUE_BYTES: u64 = std::mem::size_of::<f64>() as u64;

#[derive(Debug)]
struct Run {
    id: RunId,
    capacity: usize,
    rows: usize,
    data: Vec<f64>,
    /// Solver workspace charged to the budget while the run is active.
    workspace_bytes: u64,
}

#[derive(Debug)]
pub struct ResultsStore {
    layout: ColumnLayout,
    runs: Vec<Run>,
    next_id: u32,
    chunk_rows: usize,
    memory_budget: u64,
}

impl ResultsStore {
    pub fn new(layout: ColumnLayout, config: &EngineConfig) -> Self {
        Self {
            layout,
            runs: Vec::new(),
            next_id: 0,
            chunk_rows: config.chunk_rows.max(1),
            memory_budget: config.memory_budget,
        }
    }

    pub fn shared(self) -> SharedResults {
        Arc::new(RwLock::new(self))
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    /// Bytes needed to hold `rows` complete rows of `columns` values.
    pub fn estimate_bytes(rows: usize, columns: usize) -> u64 {
        (rows as u64)
            .saturating_mul(columns as u64)
            .saturating_mul(VALUE_BYTES)
    }

    /// Bytes charged to the budget: reserved rows of every run plus the
    /// workspace of runs still in progress.
    pub fn used_bytes(&self) -> u64 {
        self.runs
            .iter()
            .map(|run| Self::estimate_bytes(run.capacity, self.layout.len()) + run.workspace_bytes)
            .sum()
    }

    pub fn available_bytes(&self) -> u64 {
        self.memory_budget.saturating_sub(self.used_bytes())
    }

    /// Reserves room for `capacity_rows` rows. Fails without allocating
    /// when the rows and the solver workspace do not fit in the budget.
    pub fn begin_run(&mut self, capacity_rows: usize, workspace_bytes: u64) -> Result<RunId, MemoryError> {
        let required = Self::estimate_bytes(capacity_rows, self.layout.len()).saturating_add(workspace_bytes);
        let available = self.available_bytes();
        if required > available {
            return Err(MemoryError::Insufficient { required, available });
        }

        let id = RunId(self.next_id);
        self.next_id += 1;
        self.runs.push(Run {
            id,
            capacity: capacity_rows,
            rows: 0,
            data: Vec::new(),
            workspace_bytes,
        });
        debug!(run = %id, capacity = capacity_rows, required, "results run started");
        Ok(id)
    }

    /// Releases the workspace charge of a run; its rows stay.
    pub fn finish_run(&mut self, id: RunId) {
        if let Some(run) = self.run_mut(id) {
            run.workspace_bytes = 0;
        }
    }

    /// Appends one row. `row` holds one value per column and its time must
    /// move away from the previous row's in the run direction.
    pub fn append(&mut self, id: RunId, row: &[f64]) -> Result<(), MemoryError> {
        let columns = self.layout.len();
        let chunk_rows = self.chunk_rows;
        let Some(run) = self.run_mut(id) else {
            return Err(MemoryError::UnknownRun { run: id });
        };
        if row.len() != columns {
            return Err(MemoryError::RowWidth {
                run: id,
                expected: columns,
                found: row.len(),
            });
        }
        let time = row[0];
        if run.rows > 0 {
            let previous = run.data[(run.rows - 1) * columns];
            // The first two rows fix the direction of the run.
            let ascending = if run.rows > 1 {
                run.data[columns] > run.data[0]
            } else {
                time > previous
            };
            let ordered = if ascending { time > previous } else { time < previous };
            if !ordered {
                return Err(MemoryError::TimeOrder {
                    run: id,
                    previous,
                    time,
                });
            }
        }

        if run.rows == run.capacity {
            return Err(MemoryError::CapacityExhausted {
                run: id,
                capacity: run.capacity,
            });
        }
        if run.data.len() == run.data.capacity() {
            let rows = chunk_rows.min(run.capacity - run.rows);
            let additional = rows * columns;
            run.data.try_reserve_exact(additional).map_err(|_| MemoryError::AllocationFailed {
                requested: ResultsStore::estimate_bytes(rows, columns),
            })?;
            trace!(run = %id, rows, "results chunk allocated");
        }
        run.data.extend_from_slice(row);
        run.rows += 1;
        Ok(())
    }

    pub fn runs(&self) -> impl Iterator<Item = RunView<'_>> + '_ {
        self.runs.iter().map(|run| self.view(run))
    }

    pub fn run(&self, id: RunId) -> Option<RunView<'_>> {
        self.runs.iter().find(|run| run.id == id).map(|run| self.view(run))
    }

    pub fn latest_run(&self) -> Option<RunView<'_>> {
        self.runs.last().map(|run| self.view(run))
    }

    /// Drops every run. Run ids keep increasing.
    pub fn clear(&mut self) {
        debug!(runs = self.runs.len(), "results cleared");
        self.runs.clear();
    }

    fn run_mut(&mut self, id: RunId) -> Option<&mut Run> {
        self.runs.iter_mut().find(|run| run.id == id)
    }

    fn view<'a>(&'a self, run: &'a Run) -> RunView<'a> {
        RunView {
            run,
            columns: self.layout.len(),
        }
    }
}

/// Read-only view of one run, row ordered and column indexed.
#[derive(Debug, Clone, Copy)]
pub struct RunView<'a> {
    run: &'a Run,
    columns: usize,
}

impl<'a> RunView<'a> {
    pub fn id(&self) -> RunId {
        self.run.id
    }

    pub fn len(&self) -> usize {
        self.run.rows
    }

    pub fn is_empty(&self) -> bool {
        self.run.rows == 0
    }

    pub fn capacity(&self) -> usize {
        self.run.capacity
    }

    pub fn row(&self, index: usize) -> Option<&'a [f64]> {
        if index >= self.run.rows {
            return None;
        }
        let start = index * self.columns;
        self.run.data.get(start..start + self.columns)
    }

    pub fn value(&self, row: usize, column: ColumnId) -> Option<f64> {
        if column.0 >= self.columns {
            return None;
        }
        self.row(row).map(|values| values[column.0])
    }

    /// Values of the variable of integration.
    pub fn points(&self) -> impl Iterator<Item = f64> + 'a {
        self.run.data.chunks_exact(self.columns).map(|row| row[0])
    }

    pub fn column(&self, column: ColumnId) -> Option<impl Iterator<Item = f64> + 'a> {
        (column.0 < self.columns).then(|| {
            self.run
                .data
                .chunks_exact(self.columns)
                .map(move |row| row[column.0])
        })
    }

    fn time(&self, row: usize) -> f64 {
        self.run.data[row * self.columns]
    }

    /// Linear interpolation of `column` at `time`; NaN outside the run.
    pub fn interpolate(&self, column: ColumnId, time: f64) -> f64 {
        let n = self.run.rows;
        if n == 0 || column.0 >= self.columns || time.is_nan() {
            return f64::NAN;
        }
        let ascending = self.time(n - 1) >= self.time(0);
        let before = |t: f64| if ascending { t < time } else { t > time };

        // First row whose time is not before `time`.
        let (mut lo, mut hi) = (0, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if before(self.time(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let value = |row: usize| self.run.data[row * self.columns + column.0];
        if lo == n {
            return f64::NAN;
        }
        let t1 = self.time(lo);
        if t1 == time {
            return value(lo);
        }
        if lo == 0 {
            return f64::NAN;
        }
        let t0 = self.time(lo - 1);
        let weight = (time - t0) / (t1 - t0);
        value(lo - 1) + weight * (value(lo) - value(lo - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelDescription, VariableInfo};

    fn layout() -> ColumnLayout {
        ColumnLayout::new(&ModelDescription {
            source: String::new(),
            voi: VariableInfo::new("t"),
            states: vec![VariableInfo::new("x")],
            constants: Vec::new(),
            algebraic: Vec::new(),
            entry_points: Default::default(),
            nla_unknowns: Vec::new(),
        })
    }

    fn store(chunk_rows: usize, memory_budget: u64) -> ResultsStore {
        let config = EngineConfig {
            chunk_rows,
            memory_budget,
            ..EngineConfig::default()
        };
        ResultsStore::new(layout(), &config)
    }

    #[test]
    fn rows_grow_in_chunks_up_to_capacity() {
        let mut store = store(2, 1 << 20);
        let run = store.begin_run(5, 0).expect("begin");
        for k in 0..5 {
            let t = k as f64;
            store.append(run, &[t, -t, 2.0 * t]).expect("append");
        }
        let err = store.append(run, &[5.0, 0.0, 0.0]).expect_err("full");
        assert_eq!(err, MemoryError::CapacityExhausted { run, capacity: 5 });

        let view = store.run(run).expect("run");
        assert_eq!(view.len(), 5);
        assert_eq!(view.row(4), Some(&[4.0, -4.0, 8.0][..]));
        assert_eq!(view.points().collect::<Vec<_>>(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(view.value(2, ColumnId(2)), Some(4.0));
        assert_eq!(view.value(2, ColumnId(3)), None);
    }

    #[test]
    fn budget_is_checked_before_allocating() {
        // 3 columns of 8 bytes per row.
        let mut store = store(16, 240);
        let err = store.begin_run(10, 8).expect_err("over budget");
        assert_eq!(
            err,
            MemoryError::Insufficient {
                required: 248,
                available: 240
            }
        );
        assert_eq!(store.runs().count(), 0);

        let first = store.begin_run(5, 16).expect("fits");
        assert_eq!(store.available_bytes(), 240 - 120 - 16);
        store.finish_run(first);
        assert_eq!(store.available_bytes(), 120);
        assert!(store.begin_run(6, 0).is_err());
        assert!(store.begin_run(5, 0).is_ok());
    }

    #[test]
    fn runs_are_kept_until_cleared() {
        let mut store = store(4, 1 << 20);
        let first = store.begin_run(2, 0).expect("first");
        store.append(first, &[0.0, 1.0, 1.0]).expect("append");
        let second = store.begin_run(2, 0).expect("second");
        assert_ne!(first, second);
        assert_eq!(store.latest_run().map(|run| run.id()), Some(second));
        assert_eq!(store.run(first).map(|run| run.len()), Some(1));

        store.clear();
        assert!(store.latest_run().is_none());
        assert_eq!(store.used_bytes(), 0);
        let third = store.begin_run(1, 0).expect("third");
        assert_eq!(third, RunId(2));
    }

    #[test]
    fn interpolation_is_linear_inside_the_run() {
        let mut store = store(4, 1 << 20);
        let run = store.begin_run(3, 0).expect("begin");
        for (t, x) in [(0.0, 0.0), (1.0, 10.0), (2.0, 30.0)] {
            store.append(run, &[t, 0.0, x]).expect("append");
        }
        let view = store.run(run).expect("run");
        let x = ColumnId(2);
        assert_eq!(view.interpolate(x, 0.0), 0.0);
        assert_eq!(view.interpolate(x, 0.5), 5.0);
        assert_eq!(view.interpolate(x, 1.5), 20.0);
        assert_eq!(view.interpolate(x, 2.0), 30.0);
        assert!(view.interpolate(x, -0.1).is_nan());
        assert!(view.interpolate(x, 2.1).is_nan());
    }

    #[test]
    fn interpolation_follows_backward_runs() {
        let mut store = store(4, 1 << 20);
        let run = store.begin_run(3, 0).expect("begin");
        for (t, x) in [(2.0, 0.0), (1.0, 4.0), (0.0, 8.0)] {
            store.append(run, &[t, 0.0, x]).expect("append");
        }
        let view = store.run(run).expect("run");
        assert_eq!(view.interpolate(ColumnId(2), 1.5), 2.0);
        assert_eq!(view.interpolate(ColumnId(2), 0.0), 8.0);
        assert!(view.interpolate(ColumnId(2), 2.5).is_nan());
        let column: Vec<f64> = view.column(ColumnId(2)).expect("column").collect();
        assert_eq!(column, vec![0.0, 4.0, 8.0]);
    }

    #[test]
    fn rows_must_match_the_layout() {
        let mut store = store(4, 1 << 20);
        let run = store.begin_run(3, 0).expect("begin");
        let err = store.append(run, &[0.0, 1.0]).expect_err("too narrow");
        assert_eq!(
            err,
            MemoryError::RowWidth {
                run,
                expected: 3,
                found: 2
            }
        );
        assert!(store.append(run, &[0.0, 1.0, 2.0, 3.0]).is_err());
        assert_eq!(store.run(run).map(|view| view.len()), Some(0));
        assert_eq!(
            store.append(RunId(7), &[0.0, 1.0, 2.0]),
            Err(MemoryError::UnknownRun { run: RunId(7) })
        );
    }

    #[test]
    fn time_must_keep_moving_in_the_run_direction() {
        let mut store = store(4, 1 << 20);
        let run = store.begin_run(4, 0).expect("begin");
        store.append(run, &[1.0, 0.0, 0.0]).expect("append");
        let err = store.append(run, &[1.0, 0.0, 0.0]).expect_err("repeated time");
        assert_eq!(
            err,
            MemoryError::TimeOrder {
                run,
                previous: 1.0,
                time: 1.0
            }
        );
        assert!(store.append(run, &[f64::NAN, 0.0, 0.0]).is_err());

        store.append(run, &[0.5, 0.0, 0.0]).expect("backward run");
        assert!(store.append(run, &[0.75, 0.0, 0.0]).is_err());
        store.append(run, &[0.25, 0.0, 0.0]).expect("still backward");
        assert_eq!(store.run(run).map(|view| view.len()), Some(3));
    }

    #[test]
    fn rows_stay_readable_after_a_failed_append() {
        let mut store = store(1, 1 << 20);
        let run = store.begin_run(1, 0).expect("begin");
        store.append(run, &[0.0, 1.0, 2.0]).expect("append");
        assert!(store.append(run, &[1.0, 1.0, 2.0]).is_err());
        assert_eq!(store.run(run).and_then(|view| view.row(0)), Some(&[0.0, 1.0, 2.0][..]));
    }
}
