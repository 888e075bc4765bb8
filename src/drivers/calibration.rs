//! Calibrations between physical units and device units.
//!
//! Only *applies* calibrations.  Fitting them is done elsewhere; the
//! coefficients come in through the configuration.

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Linear pump calibration: `device = ml_per_min * factor`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowCalibration {
    pub factor: f64,
}

impl FlowCalibration {
    pub const fn new(factor: f64) -> Self {
        Self { factor }
    }

    pub fn forward(&self, ml_per_min: f64) -> f64 {
        ml_per_min * self.factor
    }

    pub fn backward(&self, device_value: f64) -> f64 {
        device_value / self.factor
    }

    /// Device units rounded and clamped to `0..=max`.
    pub fn to_device(&self, ml_per_min: f64, max: u32) -> u32 {
        let raw = self.forward(ml_per_min).round();
        if raw.is_nan() || raw <= 0.0 {
            0
        } else if raw >= f64::from(max) {
            max
        } else {
            raw as u32
        }
    }
}

/// Built-in identity of the rig's pumps, looked up by device name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpProfile {
    pub calibration: FlowCalibration,
    /// HPLC pump head (10 or 50 ml).
    pub head: Option<u16>,
    /// Lambda bus address.
    pub address: Option<u8>,
}

/// Profiles of the pumps known to the lab.
pub fn builtin_pump_profile(name: &str) -> Option<PumpProfile> {
    let (factor, head, address) = match name {
        "HPLC A" | "HPLC B" => (1000.0, Some(50), None),
        "HPLC C" => (1000.0, Some(10), None),
        "Lambda 1" => (20.117, None, Some(2)),
        "Lambda 2" => (80.265, None, Some(2)),
        "Lambda 3" => (20.294, None, Some(2)),
        _ => return None,
    };
    Some(PumpProfile {
        calibration: FlowCalibration::new(factor),
        head,
        address,
    })
}

/// Maps the calorimeter target temperature to the bath setpoint.
///
/// `table` rows are `(calorimeter_max_c, bath_c)`.  The first row whose key is
/// at or above the input wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermostatCalibration {
    pub lower: f64,
    pub upper: f64,
    pub table: Vec<(f64, f64)>,
}

impl Default for ThermostatCalibration {
    fn default() -> Self {
        Self {
            lower: 25.0,
            upper: 40.0,
            table: vec![(25.0, 26.0), (30.0, 34.0), (35.0, 40.0)],
        }
    }
}

impl ThermostatCalibration {
    pub fn forward(&self, calorimeter_c: f64) -> Result<f64, CalibrationError> {
        let out_of_range = CalibrationError::OutOfRange {
            value: calorimeter_c,
            lower: self.lower,
            upper: self.upper,
        };
        if !(self.lower..=self.upper).contains(&calorimeter_c) {
            return Err(out_of_range);
        }
        let mut rows = self.table.clone();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        rows.iter()
            .find(|(key, _)| calorimeter_c <= *key)
            .map(|(_, bath)| *bath)
            .ok_or(out_of_range)
    }
}

/// Per-channel quadratic heat-flux calibration: `q = -(a·u² + b·u + c)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatFluxCalibration {
    pub coefficients: [[f64; 3]; 3],
}

impl HeatFluxCalibration {
    pub fn forward(&self, voltages: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (idx, u) in voltages.iter().enumerate() {
            let [a, b, c] = self.coefficients[idx];
            out[idx] = -(a * u * u + b * u + c);
        }
        out
    }
}
