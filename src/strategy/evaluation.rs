//! Absolute evaluation: the list walker plus per-point heat balance.
//!
//! Once a hold's dead time is over, every new row extends an evaluation
//! window and the point's [`PointMetrics`] are recomputed over it.
//!
//! Flows are in ml/min, concentrations in mol/l, heat flux in W.  The
//! `/ 6e4` factors turn ml/min · mol/l into mol/s.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{AppliedPoint, EquilibrationSettings, OperationPoint, PointScheduler, Strategy, StrategyPhase};
use crate::app::ports::Clock;
use crate::drivers::SensorRow;
use crate::drivers::calibration::HeatFluxCalibration;
use crate::error::{CalibrationError, Error, Result};

/// Molar concentration of water, mol/l.
pub const WATER_CONCENTRATION: f64 = 0.997 / 18.015 * 1000.0;

/// Molar heat capacity of water, J/(mol·K).
pub const WATER_CP: f64 = 75.336;

const ML_MIN_TO_L_S: f64 = 6.0e4;

/// Row columns averaged over the window: T_A, T_B, T_out, U_pre, U_R1, U_R2.
const MEAN_COLUMNS: std::ops::RangeInclusive<usize> = 5..=10;

// ═══════════════════════════════════════════════════════════════
//  Substance data
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Substance {
    A,
    B,
}

impl Substance {
    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Stock solutions A and B and which pump delivers which.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstanceData {
    pub weighing_g: [f64; 2],
    pub volume_ml: [f64; 2],
    pub molar_mass_g_per_mol: [f64; 2],
    /// One entry per pump.
    pub pump_assignment: Vec<Substance>,
}

impl SubstanceData {
    /// mol/l of A and B.
    pub fn concentration(&self) -> [f64; 2] {
        std::array::from_fn(|i| self.weighing_g[i] / (self.volume_ml[i] * 1e-3) / self.molar_mass_g_per_mol[i])
    }
}

// ═══════════════════════════════════════════════════════════════
//  Metrics
// ═══════════════════════════════════════════════════════════════

/// Aggregated result of one held point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointMetrics {
    /// 1-based.
    pub point: usize,
    pub temperature: f64,
    /// Calorimeter elapsed time at the window start and at its last row.
    pub window_s: (f64, f64),
    pub rows: usize,
    /// Per substance A, B.
    pub set_volume_flow: [f64; 2],
    pub actual_volume_flow: [f64; 2],
    pub actual_molar_flow: [f64; 2],
    pub water_molar_flow: [f64; 2],
    /// Means of T_A, T_B, T_out, U_pre, U_R1, U_R2.
    pub means: [f64; 6],
    /// `T_point - mean` for T_A, T_B, T_out.
    pub temperature_difference: [f64; 3],
    /// Inlet A, inlet B, outlet.
    pub outside_heat_flux: [f64; 3],
    /// Pre-heater, pre-heater balance, R1, R2.
    pub reactor_heat_flux: [f64; 4],
    /// kJ/mol of A; `None` without A flow.
    pub enthalpy_kj_per_mol: Option<f64>,
}

impl PointMetrics {
    fn open(point: usize, temperature: f64, start_s: f64) -> Self {
        Self {
            point,
            temperature,
            window_s: (start_s, start_s),
            rows: 0,
            set_volume_flow: [0.0; 2],
            actual_volume_flow: [0.0; 2],
            actual_molar_flow: [0.0; 2],
            water_molar_flow: [0.0; 2],
            means: [0.0; 6],
            temperature_difference: [0.0; 3],
            outside_heat_flux: [0.0; 3],
            reactor_heat_flux: [0.0; 4],
            enthalpy_kj_per_mol: None,
        }
    }

    /// Recompute everything that depends on the window rows.
    fn update(&mut self, window: &[SensorRow], calibration: &HeatFluxCalibration) {
        let Some(last) = window.last() else {
            return;
        };
        self.window_s.1 = last.elapsed_s;
        self.rows = window.len();

        let n = window.len() as f64;
        for (slot, column) in self.means.iter_mut().zip(MEAN_COLUMNS) {
            *slot = window.iter().filter_map(|r| r.column(column)).sum::<f64>() / n;
        }

        for i in 0..3 {
            self.temperature_difference[i] = self.temperature - self.means[i];
        }
        for i in 0..2 {
            self.outside_heat_flux[i] = self.actual_volume_flow[i] * WATER_CONCENTRATION * WATER_CP
                * self.temperature_difference[i]
                / ML_MIN_TO_L_S;
        }
        self.outside_heat_flux[2] =
            self.water_molar_flow.iter().sum::<f64>() * WATER_CP * self.temperature_difference[2];

        let [pre, r1, r2] = calibration.forward([self.means[3], self.means[4], self.means[5]]);
        let balance = pre - self.outside_heat_flux[0] - self.outside_heat_flux[1];
        self.reactor_heat_flux = [pre, balance, r1, r2];

        let released = balance + r1 + r2 + self.outside_heat_flux[2];
        let molar_a = self.actual_molar_flow[0];
        self.enthalpy_kj_per_mol = (molar_a != 0.0).then(|| released / (molar_a * 1000.0));
    }
}

// ═══════════════════════════════════════════════════════════════
//  Strategy
// ═══════════════════════════════════════════════════════════════

pub struct AbsoluteEvaluation {
    scheduler: PointScheduler,
    substances: SubstanceData,
    calibration: BTreeMap<i64, HeatFluxCalibration>,
    actual_flowrates: Vec<f64>,
    metrics: Vec<PointMetrics>,
    /// Index of the first row in the open evaluation window.
    window_start: Option<usize>,
}

impl AbsoluteEvaluation {
    /// Point temperatures are rounded to whole degrees, the granularity
    /// of the calorimeter calibration.
    pub fn new(
        points: Vec<OperationPoint>,
        dead_time: Duration,
        equilibration: EquilibrationSettings,
        substances: SubstanceData,
        calibration: BTreeMap<i64, HeatFluxCalibration>,
        clock: Rc<dyn Clock>,
    ) -> Result<Self> {
        let points: Vec<OperationPoint> = points
            .into_iter()
            .map(|p| OperationPoint {
                temperature: p.temperature.round(),
                ..p
            })
            .collect();

        for (idx, point) in points.iter().enumerate() {
            if point.pump_count() != substances.pump_assignment.len() {
                return Err(Error::Config(format!(
                    "operation point {} has {} flow rates but {} pumps are assigned to substances",
                    idx + 1,
                    point.pump_count(),
                    substances.pump_assignment.len()
                )));
            }
            let key = point.temperature as i64;
            if !calibration.contains_key(&key) {
                return Err(CalibrationError::Missing { temperature: key }.into());
            }
        }

        Ok(Self {
            scheduler: PointScheduler::new(points, dead_time, equilibration, clock)?,
            substances,
            calibration,
            actual_flowrates: Vec::new(),
            metrics: Vec::new(),
            window_start: None,
        })
    }

    fn open_window(&mut self) {
        let Some(point) = self.scheduler.current() else {
            return;
        };
        let rows = self.scheduler.rows();
        let start = rows.len().saturating_sub(1);
        let start_s = rows.get(start).map_or(0.0, |r| r.elapsed_s);

        let concentration = self.substances.concentration();
        let mut metrics = PointMetrics::open(self.metrics.len() + 1, point.temperature, start_s);
        for (pump, substance) in self.substances.pump_assignment.iter().enumerate() {
            let s = substance.index();
            let set = point.flowrates.get(pump).copied().unwrap_or(0.0);
            let actual = self.actual_flowrates.get(pump).copied().unwrap_or(set);
            metrics.set_volume_flow[s] += set;
            metrics.actual_volume_flow[s] += actual;
            metrics.actual_molar_flow[s] += actual * concentration[s] / ML_MIN_TO_L_S;
            metrics.water_molar_flow[s] += actual * WATER_CONCENTRATION / ML_MIN_TO_L_S;
        }
        debug!("evaluation: window for point {} opens at {:.1} s", metrics.point, start_s);
        self.metrics.push(metrics);
        self.window_start = Some(start);
    }
}

impl Strategy for AbsoluteEvaluation {
    fn next_operation_point(&mut self) -> Option<AppliedPoint> {
        self.scheduler.next_operation_point()
    }

    fn push_value(&mut self, row: Option<&SensorRow>) {
        if !self.scheduler.push_value(row) || !self.scheduler.evaluation_open() {
            return;
        }
        if self.window_start.is_none() {
            self.open_window();
        }

        let (Some(start), Some(point)) = (self.window_start, self.scheduler.current()) else {
            return;
        };
        let Some(calibration) = self.calibration.get(&(point.temperature as i64)) else {
            return;
        };
        let rows = self.scheduler.rows();
        if let Some(metrics) = self.metrics.last_mut() {
            metrics.update(&rows[start..], calibration);
        }
    }

    fn point_complete(&mut self) -> bool {
        let arming = self.scheduler.phase() == StrategyPhase::SettingDeadline;
        let complete = self.scheduler.point_complete();
        if arming {
            self.window_start = None;
        }
        if complete && self.window_start.take().is_some() {
            if let Some(m) = self.metrics.last() {
                info!(
                    "evaluation: point {} done over {} rows, enthalpy {:?} kJ/mol",
                    m.point, m.rows, m.enthalpy_kj_per_mol
                );
            }
        }
        complete
    }

    fn has_error(&self) -> bool {
        self.scheduler.has_error()
    }

    fn push_actual_flowrate(&mut self, values: &[f64]) {
        self.actual_flowrates = values.to_vec();
    }

    fn finish(&mut self) {
        info!(
            "evaluation: {} of {} held point(s) evaluated, {} row(s) received",
            self.metrics.len(),
            self.scheduler.completed(),
            self.scheduler.rows().len()
        );
        for m in &self.metrics {
            info!(
                "evaluation: point {} at {:.0} °C: reactor flux {:?} W, enthalpy {:?} kJ/mol",
                m.point, m.temperature, m.reactor_heat_flux, m.enthalpy_kj_per_mol
            );
        }
    }

    fn phase(&self) -> StrategyPhase {
        self.scheduler.phase()
    }

    fn metrics(&self) -> &[PointMetrics] {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::time::ManualClock;
    use crate::strategy::test_support::row_at;

    fn substances() -> SubstanceData {
        SubstanceData {
            weighing_g: [6.0, 3.6],
            volume_ml: [100.0, 100.0],
            molar_mass_g_per_mol: [60.0, 36.0],
            pump_assignment: vec![Substance::A, Substance::B],
        }
    }

    fn calibration() -> BTreeMap<i64, HeatFluxCalibration> {
        BTreeMap::from([(
            25,
            HeatFluxCalibration {
                coefficients: [[0.0, -1.0, 0.0], [0.0, -2.0, 0.0], [0.0, -3.0, 0.0]],
            },
        )])
    }

    fn strategy(clock: &ManualClock) -> AbsoluteEvaluation {
        AbsoluteEvaluation::new(
            vec![OperationPoint::new(18_000, 25.2, vec![6.0, 6.0])],
            Duration::from_millis(6000),
            EquilibrationSettings::default(),
            substances(),
            calibration(),
            Rc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn concentrations() {
        let c = substances().concentration();
        assert!((c[0] - 1.0).abs() < 1e-12);
        assert!((c[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_uncalibrated_temperature_and_pump_mismatch() {
        let clock = ManualClock::new();
        let missing = AbsoluteEvaluation::new(
            vec![OperationPoint::new(18_000, 30.0, vec![1.0, 1.0])],
            Duration::from_millis(6000),
            EquilibrationSettings::default(),
            substances(),
            calibration(),
            Rc::new(clock.clone()),
        );
        assert!(matches!(
            missing,
            Err(Error::Calibration(CalibrationError::Missing { temperature: 30 }))
        ));

        let mismatch = AbsoluteEvaluation::new(
            vec![OperationPoint::new(18_000, 25.0, vec![1.0])],
            Duration::from_millis(6000),
            EquilibrationSettings::default(),
            substances(),
            calibration(),
            Rc::new(clock),
        );
        assert!(matches!(mismatch, Err(Error::Config(_))));
    }

    #[test]
    fn aggregates_after_the_dead_time() {
        let clock = ManualClock::new();
        let mut s = strategy(&clock);
        let soak = s.next_operation_point().unwrap();
        assert_eq!(soak.temperature, 25.0);
        for i in 0..10 {
            s.push_value(Some(&row_at(f64::from(i), 25.0)));
        }
        assert!(s.point_complete());

        s.next_operation_point().unwrap();
        s.push_actual_flowrate(&[6.0, 6.0]);
        assert!(!s.point_complete());

        // rows inside the dead time are not evaluated
        s.push_value(Some(&row_at(10.0, 25.0)));
        assert!(s.metrics().is_empty());

        clock.advance(Duration::from_millis(6001));
        s.push_value(Some(&row_at(16.0, 25.0)));
        s.push_value(Some(&row_at(17.0, 25.0)));

        let m = &s.metrics()[0];
        assert_eq!(m.point, 1);
        assert_eq!(m.rows, 2);
        assert_eq!(m.window_s, (16.0, 17.0));
        assert_eq!(m.actual_volume_flow, [6.0, 6.0]);
        assert!((m.actual_molar_flow[0] - 1e-4).abs() < 1e-12);
        // row_at: T_A = t - 0.4, T_B = t - 0.5, T_out = t + 0.2
        assert!((m.temperature_difference[0] - 0.4).abs() < 1e-9);
        assert!((m.temperature_difference[1] - 0.5).abs() < 1e-9);
        assert!((m.temperature_difference[2] + 0.2).abs() < 1e-9);

        let inlet_a = 6.0 * WATER_CONCENTRATION * WATER_CP * 0.4 / 6.0e4;
        assert!((m.outside_heat_flux[0] - inlet_a).abs() < 1e-9);

        // q = -(b·u) with u_pre = 0.5, u_r1 = u_r2 = 0.2
        assert!((m.reactor_heat_flux[0] - 0.5).abs() < 1e-9);
        assert!((m.reactor_heat_flux[2] - 0.4).abs() < 1e-9);
        assert!((m.reactor_heat_flux[3] - 0.6).abs() < 1e-9);
        let balance = 0.5 - m.outside_heat_flux[0] - m.outside_heat_flux[1];
        assert!((m.reactor_heat_flux[1] - balance).abs() < 1e-12);

        let expected = (balance + 0.4 + 0.6 + m.outside_heat_flux[2]) / (1e-4 * 1000.0);
        assert!((m.enthalpy_kj_per_mol.unwrap() - expected).abs() < 1e-9);

        clock.advance(Duration::from_millis(12_000));
        assert!(s.point_complete());
        assert_eq!(s.next_operation_point(), None);
        s.finish();
        assert_eq!(s.metrics().len(), 1);
    }
}
