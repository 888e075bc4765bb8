//! Builds a ready-to-tick [`Automation`] from a [`RigConfig`].
//!
//! All fatal misconfiguration surfaces here as `Err`, before the first
//! tick: validation, unknown devices, table conflicts, ports that will
//! not open.

use std::rc::Rc;

use log::info;

use super::automation::{Automation, Rig, RunSettings};
use super::ports::{Clock, DeviceKind, PortOpener, PortSpec};
use crate::config::{PumpConfig, RigConfig, StrategyConfig};
use crate::drivers::calorimeter::CalorimeterReader;
use crate::drivers::fisher::FisherThermostat;
use crate::drivers::hplc::HplcPump;
use crate::drivers::lambda::LambdaPump;
use crate::drivers::Pump;
use crate::error::Result;
use crate::fsm::context::DeviceIo;
use crate::strategy::{AbsoluteEvaluation, OperationPointList, Strategy};

fn build_pump(config: &RigConfig, pump: &PumpConfig, ports: &mut impl PortOpener, clock: &Rc<dyn Clock>) -> Result<Box<dyn Pump>> {
    let calibration = pump.calibration()?;
    let mut spec = PortSpec {
        device: pump.name(),
        kind: DeviceKind::Hplc,
        port: pump.port(),
        serial: pump.serial(),
    };
    match pump {
        PumpConfig::Hplc(p) => {
            let settings = p.settings()?;
            let transport = ports.open(&spec)?;
            let io = DeviceIo::new(&p.name, transport, Rc::clone(clock), config.timing.protocol(p.retries));
            Ok(Box::new(HplcPump::new(settings, calibration, io)?))
        }
        PumpConfig::Lambda(p) => {
            let address = p.address()?;
            spec.kind = DeviceKind::Lambda { address };
            let transport = ports.open(&spec)?;
            let io = DeviceIo::new(&p.name, transport, Rc::clone(clock), config.timing.protocol(p.retries));
            Ok(Box::new(LambdaPump::new(address, calibration, io)?))
        }
    }
}

/// Open every device of `config`.
pub fn build_rig(config: &RigConfig, ports: &mut impl PortOpener, clock: Rc<dyn Clock>) -> Result<Rig> {
    let pumps = config
        .pumps
        .iter()
        .map(|pump| build_pump(config, pump, ports, &clock))
        .collect::<Result<Vec<_>>>()?;

    let bath = &config.thermostat;
    let transport = ports.open(&PortSpec {
        device: &bath.name,
        kind: DeviceKind::Fisher,
        port: &bath.port,
        serial: bath.serial,
    })?;
    let io = DeviceIo::new(&bath.name, transport, Rc::clone(&clock), config.timing.protocol(bath.retries));
    let thermostat = FisherThermostat::new(bath.settings, io)?;

    let calo = &config.calorimeter;
    let transport = ports.open(&PortSpec {
        device: &calo.name,
        kind: DeviceKind::Calorimeter,
        port: &calo.port,
        serial: calo.serial,
    })?;
    let io = DeviceIo::new(&calo.name, transport, clock, config.timing.protocol(0));
    let calorimeter = CalorimeterReader::new(calo.settings(), io)?;

    Ok(Rig {
        pumps,
        thermostat: Box::new(thermostat),
        calorimeter: Box::new(calorimeter),
    })
}

pub fn build_strategy(config: &RigConfig, clock: Rc<dyn Clock>) -> Result<Box<dyn Strategy>> {
    let points = config.operation_points.clone();
    let equilibration = config.equilibration.clone();
    Ok(match &config.strategy {
        StrategyConfig::List => Box::new(OperationPointList::new(points, config.dead_time(), equilibration, clock)?),
        StrategyConfig::AbsoluteEvaluation {
            substances,
            calorimeter_calibration,
        } => Box::new(AbsoluteEvaluation::new(
            points,
            config.dead_time(),
            equilibration,
            substances.clone(),
            calorimeter_calibration.clone(),
            clock,
        )?),
    })
}

/// Validate `config`, open every device and assemble the automaton.
pub fn build_automation(config: &RigConfig, ports: &mut impl PortOpener, clock: Rc<dyn Clock>) -> Result<Automation> {
    config.validate()?;
    let strategy = build_strategy(config, Rc::clone(&clock))?;
    let rig = build_rig(config, ports, Rc::clone(&clock))?;
    info!(
        "rig: {} pump(s), {} operation point(s), strategy {}",
        rig.pumps.len(),
        config.operation_points.len(),
        match config.strategy {
            StrategyConfig::List => "list",
            StrategyConfig::AbsoluteEvaluation { .. } => "absolute evaluation",
        }
    );
    let settings = RunSettings {
        thermostat_calibration: config.thermostat_calibration.clone(),
        configuration_deadline: config.timing.configuration_deadline(),
        leave_thermostat_on: config.leave_thermostat_on,
    };
    Automation::new(rig, strategy, settings, clock)
}
