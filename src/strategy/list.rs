//! Plain list walker: no evaluation beyond completion.

use std::rc::Rc;
use std::time::Duration;

use log::info;

use super::{AppliedPoint, EquilibrationSettings, OperationPoint, PointScheduler, Strategy, StrategyPhase};
use crate::app::ports::Clock;
use crate::drivers::SensorRow;
use crate::error::Result;

pub struct OperationPointList {
    scheduler: PointScheduler,
    actual_flowrates: Vec<f64>,
}

impl OperationPointList {
    pub fn new(
        points: Vec<OperationPoint>,
        dead_time: Duration,
        equilibration: EquilibrationSettings,
        clock: Rc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            scheduler: PointScheduler::new(points, dead_time, equilibration, clock)?,
            actual_flowrates: Vec::new(),
        })
    }

    pub fn actual_flowrates(&self) -> &[f64] {
        &self.actual_flowrates
    }
}

impl Strategy for OperationPointList {
    fn next_operation_point(&mut self) -> Option<AppliedPoint> {
        self.scheduler.next_operation_point()
    }

    fn push_value(&mut self, row: Option<&SensorRow>) {
        self.scheduler.push_value(row);
    }

    fn point_complete(&mut self) -> bool {
        self.scheduler.point_complete()
    }

    fn has_error(&self) -> bool {
        self.scheduler.has_error()
    }

    fn push_actual_flowrate(&mut self, values: &[f64]) {
        self.actual_flowrates = values.to_vec();
    }

    fn finish(&mut self) {
        info!(
            "strategy: {} point(s) held, {} row(s) received",
            self.scheduler.completed(),
            self.scheduler.rows().len()
        );
    }

    fn phase(&self) -> StrategyPhase {
        self.scheduler.phase()
    }
}
