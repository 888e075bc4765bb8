//! Rig configuration.
//!
//! Loaded from JSON.  Every field has a default matching the reference
//! rig, so a config only needs to name ports and operation points.
//! [`RigConfig::validate`] runs every setup check before any device is
//! opened.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::calibration::{FlowCalibration, HeatFluxCalibration, ThermostatCalibration, builtin_pump_profile};
use crate::drivers::calorimeter::CalorimeterSettings;
use crate::drivers::fisher::FisherSettings;
use crate::drivers::hplc::HplcSettings;
use crate::error::{CalibrationError, Error, Result};
use crate::fsm::context::ProtocolTiming;
use crate::strategy::{EquilibrationSettings, OperationPoint, SubstanceData};

// ---------------------------------------------------------------------------
// Serial settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud: u32,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialSettings {
    pub const fn new(baud: u32, parity: Parity) -> Self {
        Self {
            baud,
            parity,
            stop_bits: 1,
        }
    }

    fn hplc() -> Self {
        Self::new(9600, Parity::None)
    }

    fn lambda() -> Self {
        Self::new(2400, Parity::Odd)
    }

    fn fisher() -> Self {
        Self::new(9600, Parity::None)
    }

    fn calorimeter() -> Self {
        Self::new(9600, Parity::None)
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PumpConfig {
    Hplc(HplcPumpConfig),
    Lambda(LambdaPumpConfig),
}

impl PumpConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Hplc(p) => &p.name,
            Self::Lambda(p) => &p.name,
        }
    }

    pub fn port(&self) -> &str {
        match self {
            Self::Hplc(p) => &p.port,
            Self::Lambda(p) => &p.port,
        }
    }

    pub fn serial(&self) -> SerialSettings {
        match self {
            Self::Hplc(p) => p.serial,
            Self::Lambda(p) => p.serial,
        }
    }

    /// Explicit factor, else the built-in one for a known pump name.
    pub fn calibration(&self) -> Result<FlowCalibration> {
        let explicit = match self {
            Self::Hplc(p) => p.calibration,
            Self::Lambda(p) => p.calibration,
        };
        explicit
            .map(FlowCalibration::new)
            .or_else(|| builtin_pump_profile(self.name()).map(|p| p.calibration))
            .ok_or_else(|| unknown_device(self.name(), "calibration"))
    }
}

fn unknown_device(name: &str, missing: &str) -> Error {
    Error::Config(format!("unknown device \"{name}\" and no {missing} given"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HplcPumpConfig {
    pub name: String,
    pub port: String,
    #[serde(default = "SerialSettings::hplc")]
    pub serial: SerialSettings,
    /// 10 or 50 ml.  Known pump names carry a default.
    #[serde(default)]
    pub head: Option<u16>,
    #[serde(default)]
    pub pmin: Option<u32>,
    #[serde(default)]
    pub pmax: Option<u32>,
    /// Device units per ml/min.
    #[serde(default)]
    pub calibration: Option<f64>,
    #[serde(default)]
    pub retries: u32,
}

impl HplcPumpConfig {
    pub fn settings(&self) -> Result<HplcSettings> {
        let head = self
            .head
            .or_else(|| builtin_pump_profile(&self.name).and_then(|p| p.head))
            .ok_or_else(|| unknown_device(&self.name, "pump head"))?;
        let settings = HplcSettings::new(head)?;
        match (self.pmin, self.pmax) {
            (Some(pmin), Some(pmax)) => settings.with_pressure_limits(pmin, pmax),
            (None, None) => Ok(settings),
            _ => Err(Error::Config(format!(
                "{}: pmin and pmax must be given together",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaPumpConfig {
    pub name: String,
    pub port: String,
    #[serde(default = "SerialSettings::lambda")]
    pub serial: SerialSettings,
    #[serde(default)]
    pub address: Option<u8>,
    #[serde(default)]
    pub calibration: Option<f64>,
    #[serde(default)]
    pub retries: u32,
}

impl LambdaPumpConfig {
    pub fn address(&self) -> Result<u8> {
        let address = self
            .address
            .or_else(|| builtin_pump_profile(&self.name).and_then(|p| p.address))
            .ok_or_else(|| unknown_device(&self.name, "address"))?;
        if address > 99 {
            return Err(Error::Config(format!(
                "{}: address {address} outside 0..=99",
                self.name
            )));
        }
        Ok(address)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatConfig {
    pub name: String,
    pub port: String,
    pub serial: SerialSettings,
    #[serde(flatten)]
    pub settings: FisherSettings,
    pub retries: u32,
}

impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            name: "Fisher".into(),
            port: String::new(),
            serial: SerialSettings::fisher(),
            settings: FisherSettings::default(),
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalorimeterConfig {
    pub name: String,
    pub port: String,
    pub serial: SerialSettings,
    pub check_interval_ms: u64,
    pub telegram_timeout_ms: u64,
    pub max_corrections: u32,
    pub log_path: Option<PathBuf>,
}

impl Default for CalorimeterConfig {
    fn default() -> Self {
        Self {
            name: "Calo".into(),
            port: String::new(),
            serial: SerialSettings::calorimeter(),
            check_interval_ms: 5000,
            telegram_timeout_ms: 30_000,
            max_corrections: 3,
            log_path: None,
        }
    }
}

impl CalorimeterConfig {
    pub fn settings(&self) -> CalorimeterSettings {
        CalorimeterSettings {
            check_interval: Duration::from_millis(self.check_interval_ms),
            telegram_timeout: Duration::from_millis(self.telegram_timeout_ms),
            max_corrections: self.max_corrections,
            log_path: self.log_path.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Timing and strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub response_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Devices must be configured within this window.
    pub configuration_deadline_ms: u64,
    /// Pause between two orchestration ticks.
    pub tick_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            poll_interval_ms: 500,
            configuration_deadline_ms: 60_000,
            tick_interval_ms: 20,
        }
    }
}

impl TimingConfig {
    pub fn protocol(&self, retries: u32) -> ProtocolTiming {
        ProtocolTiming {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retries,
        }
    }

    pub fn configuration_deadline(&self) -> Duration {
        Duration::from_millis(self.configuration_deadline_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StrategyConfig {
    #[default]
    List,
    AbsoluteEvaluation {
        substances: SubstanceData,
        /// Keyed by whole-degree point temperature.
        calorimeter_calibration: BTreeMap<i64, HeatFluxCalibration>,
    },
}

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub pumps: Vec<PumpConfig>,
    pub thermostat: ThermostatConfig,
    pub calorimeter: CalorimeterConfig,
    pub timing: TimingConfig,
    pub equilibration: EquilibrationSettings,
    pub strategy: StrategyConfig,
    pub thermostat_calibration: ThermostatCalibration,
    /// Start of every hold excluded from evaluation.
    pub dead_time_ms: u64,
    pub operation_points: Vec<OperationPoint>,
    /// Skip switching the bath off during shutdown.
    pub leave_thermostat_on: bool,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            pumps: Vec::new(),
            thermostat: ThermostatConfig::default(),
            calorimeter: CalorimeterConfig::default(),
            timing: TimingConfig::default(),
            equilibration: EquilibrationSettings::default(),
            strategy: StrategyConfig::default(),
            thermostat_calibration: ThermostatCalibration::default(),
            dead_time_ms: 6000,
            operation_points: Vec::new(),
            leave_thermostat_on: false,
        }
    }
}

impl RigConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn dead_time(&self) -> Duration {
        Duration::from_millis(self.dead_time_ms)
    }

    /// Every check that must pass before devices are opened.
    pub fn validate(&self) -> Result<()> {
        if self.pumps.is_empty() {
            return Err(Error::Config("at least one pump is required".into()));
        }
        if self.operation_points.is_empty() {
            return Err(Error::Config("the operation point list is empty".into()));
        }

        let mut names = HashSet::new();
        let devices = self
            .pumps
            .iter()
            .map(PumpConfig::name)
            .chain([self.thermostat.name.as_str(), self.calorimeter.name.as_str()]);
        for name in devices {
            if !names.insert(name) {
                return Err(Error::Config(format!("device name \"{name}\" is used twice")));
            }
        }

        for pump in &self.pumps {
            pump.calibration()?;
            match pump {
                PumpConfig::Hplc(p) => {
                    p.settings()?;
                }
                PumpConfig::Lambda(p) => {
                    p.address()?;
                }
            }
        }

        for (idx, point) in self.operation_points.iter().enumerate() {
            if point.pump_count() != self.pumps.len() {
                return Err(Error::Config(format!(
                    "operation point {} has {} flow rates for {} pumps",
                    idx + 1,
                    point.pump_count(),
                    self.pumps.len()
                )));
            }
            if point.duration() <= self.dead_time() {
                return Err(Error::Config(format!(
                    "operation point {} lasts {} ms, not longer than the dead time of {} ms",
                    idx + 1,
                    point.duration_ms,
                    self.dead_time_ms
                )));
            }
            if point.flowrates.iter().any(|f| !f.is_finite() || *f < 0.0) {
                return Err(Error::Config(format!(
                    "operation point {} has a negative or non-finite flow rate",
                    idx + 1
                )));
            }
            self.thermostat_calibration.forward(point.temperature)?;
        }

        if let StrategyConfig::AbsoluteEvaluation {
            substances,
            calorimeter_calibration,
        } = &self.strategy
        {
            if substances.pump_assignment.len() != self.pumps.len() {
                return Err(Error::Config(format!(
                    "{} pumps but {} substance assignments",
                    self.pumps.len(),
                    substances.pump_assignment.len()
                )));
            }
            for point in &self.operation_points {
                let key = point.temperature.round() as i64;
                if !calorimeter_calibration.contains_key(&key) {
                    return Err(CalibrationError::Missing { temperature: key }.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RigConfig {
        RigConfig {
            pumps: vec![
                PumpConfig::Lambda(LambdaPumpConfig {
                    name: "Lambda 1".into(),
                    port: "sim".into(),
                    serial: SerialSettings::lambda(),
                    address: None,
                    calibration: None,
                    retries: 0,
                }),
                PumpConfig::Lambda(LambdaPumpConfig {
                    name: "Lambda 3".into(),
                    port: "sim".into(),
                    serial: SerialSettings::lambda(),
                    address: None,
                    calibration: None,
                    retries: 0,
                }),
            ],
            operation_points: vec![OperationPoint::new(18_000, 25.0, vec![6.1, 6.05])],
            ..RigConfig::default()
        }
    }

    #[test]
    fn defaults_match_the_reference_rig() {
        let c = RigConfig::default();
        assert_eq!(c.timing.response_timeout_ms, 1000);
        assert_eq!(c.timing.poll_interval_ms, 500);
        assert_eq!(c.timing.configuration_deadline_ms, 60_000);
        assert_eq!(c.thermostat.retries, 3);
        assert_eq!(c.calorimeter.check_interval_ms, 5000);
        assert_eq!(c.calorimeter.telegram_timeout_ms, 30_000);
        assert_eq!(c.equilibration.window, 10);
        assert!(!c.equilibration.strict);
        assert!(!c.leave_thermostat_on);
        assert_eq!(SerialSettings::lambda(), SerialSettings::new(2400, Parity::Odd));
    }

    #[test]
    fn minimal_config_validates() {
        minimal().validate().unwrap();
    }

    #[test]
    fn json_fills_defaults() {
        let c = RigConfig::from_json(
            r#"{
                "pumps": [
                    {"kind": "Hplc", "name": "HPLC A", "port": "/dev/ttyUSB0"},
                    {"kind": "Lambda", "name": "Lambda 1", "port": "/dev/ttyUSB1"}
                ],
                "thermostat": {"port": "/dev/ttyUSB2", "pump_speed": "M"},
                "operation_points": [
                    {"duration_ms": 18000, "temperature": 25.0, "flowrates": [6.1, 6.05]}
                ]
            }"#,
        )
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.pumps[0].serial(), SerialSettings::hplc());
        assert_eq!(c.pumps[1].serial().baud, 2400);
        assert_eq!(c.thermostat.name, "Fisher");
        assert_eq!(c.thermostat.settings.pump_speed, crate::drivers::fisher::PumpSpeed::M);
        match &c.pumps[0] {
            PumpConfig::Hplc(p) => assert_eq!(p.settings().unwrap().head(), 50),
            PumpConfig::Lambda(_) => unreachable!(),
        }
    }

    #[test]
    fn rejects_pump_count_mismatch() {
        let mut c = minimal();
        c.operation_points[0].flowrates.pop();
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_short_points() {
        let mut c = minimal();
        c.operation_points[0].duration_ms = c.dead_time_ms;
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_duplicate_and_unknown_devices() {
        let mut c = minimal();
        c.thermostat.name = "Lambda 1".into();
        assert!(c.validate().is_err());

        let mut c = minimal();
        if let PumpConfig::Lambda(p) = &mut c.pumps[0] {
            p.name = "Lambda 9".into();
        }
        assert!(matches!(c.validate(), Err(Error::Config(m)) if m.contains("unknown device")));
    }

    #[test]
    fn rejects_bad_hplc_limits() {
        let mut c = minimal();
        c.pumps[0] = PumpConfig::Hplc(HplcPumpConfig {
            name: "HPLC A".into(),
            port: "sim".into(),
            serial: SerialSettings::hplc(),
            head: None,
            pmin: Some(10),
            pmax: Some(200),
            calibration: None,
            retries: 0,
        });
        assert!(c.validate().is_err());
        if let PumpConfig::Hplc(p) = &mut c.pumps[0] {
            p.pmax = Some(150);
        }
        c.validate().unwrap();
    }

    #[test]
    fn rejects_uncalibrated_temperatures() {
        let mut c = minimal();
        c.operation_points[0].temperature = 41.0;
        assert!(matches!(c.validate(), Err(Error::Calibration(_))));

        let mut c = minimal();
        c.strategy = StrategyConfig::AbsoluteEvaluation {
            substances: SubstanceData {
                weighing_g: [1.0, 1.0],
                volume_ml: [100.0, 100.0],
                molar_mass_g_per_mol: [60.0, 36.0],
                pump_assignment: vec![crate::strategy::Substance::A, crate::strategy::Substance::B],
            },
            calorimeter_calibration: BTreeMap::new(),
        };
        assert!(matches!(
            c.validate(),
            Err(Error::Calibration(CalibrationError::Missing { temperature: 25 }))
        ));
    }

    #[test]
    fn shipped_example_validates() {
        let c = RigConfig::from_json(include_str!("../config/rig.example.json")).unwrap();
        c.validate().unwrap();
        assert_eq!(c.pumps.len(), 2);
        assert_eq!(c.calorimeter.settings().log_path, Some(PathBuf::from("calorimeter.log")));
    }

    #[test]
    fn serde_roundtrip() {
        let c = minimal();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(RigConfig::from_json(&json).unwrap(), c);
    }
}
