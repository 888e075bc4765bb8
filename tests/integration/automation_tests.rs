//! Orchestration tests against mock instruments.
//!
//! Covers the happy path, every escalation target, operator abort and
//! the shutdown ordering that all of them share.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use calorimetry_rig::adapters::log_sink::RecordingSink;
use calorimetry_rig::adapters::time::ManualClock;
use calorimetry_rig::app::automation::{Automation, Rig, RunSettings, RunState};
use calorimetry_rig::app::events::RunEvent;
use calorimetry_rig::app::runner::{self, CancellationToken};
use calorimetry_rig::drivers::DriverPhase;
use calorimetry_rig::drivers::calibration::ThermostatCalibration;
use calorimetry_rig::strategy::{EquilibrationSettings, OperationPoint, OperationPointList};

use crate::mock_devices::{Call, Calls, MockCalorimeter, MockDriver, first_index, last_index};

// ── Fixture ───────────────────────────────────────────────────

struct Harness {
    automation: Automation,
    clock: ManualClock,
    calls: Calls,
    sink: RecordingSink,
    pump_fault: Rc<Cell<bool>>,
    bath_fault: Rc<Cell<bool>>,
    calo_fault: Rc<Cell<bool>>,
    calo_muted: Rc<Cell<bool>>,
}

fn harness(leave_thermostat_on: bool) -> Harness {
    let clock = ManualClock::new();
    let calls = Calls::default();

    let p1 = MockDriver::new("P1", &calls);
    let p2 = MockDriver::new("P2", &calls);
    let bath = MockDriver::new("Bath", &calls);
    let calo = MockCalorimeter::new(&clock, &calls);
    let pump_fault = Rc::clone(&p2.fault);
    let bath_fault = Rc::clone(&bath.fault);
    let calo_fault = Rc::clone(&calo.fault);
    let calo_muted = Rc::clone(&calo.muted);

    let rig = Rig {
        pumps: vec![Box::new(p1), Box::new(p2)],
        thermostat: Box::new(bath),
        calorimeter: Box::new(calo),
    };
    let points = vec![
        OperationPoint::new(5_000, 25.0, vec![1.0, 2.0]),
        OperationPoint::new(5_000, 25.0, vec![1.5, 0.0]),
    ];
    let equilibration = EquilibrationSettings {
        window: 3,
        ..EquilibrationSettings::default()
    };
    let strategy = OperationPointList::new(
        points,
        Duration::from_secs(1),
        equilibration,
        Rc::new(clock.clone()),
    )
    .unwrap();
    let settings = RunSettings {
        thermostat_calibration: ThermostatCalibration::default(),
        configuration_deadline: Duration::from_secs(30),
        leave_thermostat_on,
    };
    let automation = Automation::new(rig, Box::new(strategy), settings, Rc::new(clock.clone())).unwrap();

    Harness {
        automation,
        clock,
        calls,
        sink: RecordingSink::default(),
        pump_fault,
        bath_fault,
        calo_fault,
        calo_muted,
    }
}

impl Harness {
    /// Tick with one second per step until `done` or the step limit.
    fn run_until(&mut self, done: impl Fn(&Automation) -> bool) -> bool {
        for _ in 0..500 {
            self.automation.tick(&mut self.sink);
            if done(&self.automation) {
                return true;
            }
            self.clock.advance(Duration::from_secs(1));
        }
        false
    }

    fn run_to_halt(&mut self) -> RunState {
        assert!(self.run_until(Automation::is_halted), "never halted");
        self.automation.state()
    }

    fn state_changes(&self) -> Vec<&'static str> {
        self.sink
            .events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn device_failures(&self) -> Vec<String> {
        self.sink
            .events
            .iter()
            .filter_map(|e| match e {
                RunEvent::DeviceFailed { device, .. } => Some(device.clone()),
                _ => None,
            })
            .collect()
    }

    fn assert_pumps_stopped_before_bath(&self) {
        let bath_off = last_index(&self.calls, |c| *c == Call::Deactivate("Bath".into())).expect("bath never switched off");
        let pumps_settled = ["P1", "P2"]
            .iter()
            .filter_map(|p| {
                last_index(&self.calls, |c| {
                    matches!(c, Call::Phase(name, DriverPhase::Deactivated | DriverPhase::Error) if name == p)
                })
            })
            .max()
            .expect("pumps never settled");
        assert!(pumps_settled < bath_off, "bath switched off before the pumps stopped");
    }
}

// ── Happy path ────────────────────────────────────────────────

#[test]
fn list_runs_to_finished_with_ordered_shutdown() {
    let mut h = harness(false);
    let cancel = CancellationToken::new();
    let clock = h.clock.clone();
    let mut pauses = 0;
    let outcome = runner::run(&mut h.automation, &mut h.sink, &cancel, || {
        pauses += 1;
        assert!(pauses < 500, "run did not halt");
        clock.advance(Duration::from_secs(1));
    });

    assert!(outcome.finished());
    assert_eq!(h.automation.state_name(), "Finished");
    assert_eq!(
        h.state_changes(),
        ["List_Processing", "Shutdown_Finished", "Finished"]
    );
    h.assert_pumps_stopped_before_bath();

    let rig = h.automation.rig();
    assert!(rig.pumps.iter().all(|p| p.phase() == DriverPhase::Deactivated));
    assert_eq!(rig.thermostat.phase(), DriverPhase::Deactivated);
    assert!(matches!(h.sink.events.first(), Some(RunEvent::Started { pumps: 2 })));
    assert!(matches!(h.sink.events.last(), Some(RunEvent::Halted { state: "Finished" })));
}

#[test]
fn soak_precedes_the_first_point_of_a_temperature() {
    let mut h = harness(false);
    h.run_to_halt();

    let boundaries = h.automation.point_boundaries();
    assert_eq!(boundaries.len(), 3);
    assert!(boundaries[0].soak);
    assert_eq!(boundaries[0].set_flowrates, [0.0, 0.0]);
    assert!(!boundaries[1].soak);
    assert_eq!(boundaries[1].accepted_flowrates, [1.0, 2.0]);
    assert_eq!(boundaries[2].accepted_flowrates, [1.5, 0.0]);
    // default thermostat calibration maps 25 °C onto a 26 °C bath
    assert!(boundaries.iter().all(|b| b.bath_temperature == 26.0));
    assert!(h.calls.borrow().contains(&Call::SetTemperature("Calo".into(), 25.0)));

    // a zero flow switches the pump off instead of activating it
    let last_p2_flow = last_index(&h.calls, |c| *c == Call::SetFlow("P2".into(), 0.0)).unwrap();
    assert_eq!(h.calls.borrow()[last_p2_flow + 1], Call::Deactivate("P2".into()));
}

#[test]
fn rows_of_the_configuration_phase_stay_in_the_log() {
    let mut h = harness(false);
    h.run_to_halt();
    let rows = h.automation.rows();
    assert!(rows.len() > 10);
    assert!(rows.windows(2).all(|w| w[0].elapsed_s <= w[1].elapsed_s));
}

#[test]
fn leave_thermostat_on_skips_the_bath() {
    let mut h = harness(true);
    assert_eq!(h.run_to_halt(), RunState::Finished);
    assert_eq!(first_index(&h.calls, |c| *c == Call::Deactivate("Bath".into())), None);
    assert_eq!(h.automation.rig().thermostat.phase(), DriverPhase::Activated);
}

// ── Escalation ────────────────────────────────────────────────

#[test]
fn pump_failure_escalates_to_error_pump() {
    let mut h = harness(false);
    assert!(h.run_until(|a| a.state() == RunState::ListProcessing));
    h.pump_fault.set(true);

    assert_eq!(h.run_to_halt(), RunState::ErrorPump);
    assert_eq!(h.device_failures(), ["P2"]);
    assert!(h.state_changes().contains(&"Shutdown_Error_Pump"));
    h.assert_pumps_stopped_before_bath();
}

#[test]
fn thermostat_failure_escalates_to_error_thermostat() {
    let mut h = harness(false);
    assert!(h.run_until(|a| a.state() == RunState::ListProcessing));
    h.bath_fault.set(true);

    assert_eq!(h.run_to_halt(), RunState::ErrorThermostat);
    assert_eq!(h.device_failures(), ["Bath"]);
    assert!(h.automation.rig().pumps.iter().all(|p| p.phase() == DriverPhase::Deactivated));
}

#[test]
fn calorimeter_failure_escalates_to_error_calorimeter() {
    let mut h = harness(false);
    assert!(h.run_until(|a| a.state() == RunState::ListProcessing));
    h.calo_fault.set(true);

    assert_eq!(h.run_to_halt(), RunState::ErrorCalorimeter);
    assert_eq!(h.device_failures(), ["Calo"]);
    h.assert_pumps_stopped_before_bath();
}

#[test]
fn thermostat_failure_wins_over_pump_failure() {
    let mut h = harness(false);
    assert!(h.run_until(|a| a.state() == RunState::ListProcessing));
    h.pump_fault.set(true);
    h.bath_fault.set(true);

    assert_eq!(h.run_to_halt(), RunState::ErrorThermostat);
}

#[test]
fn failure_during_configuration_escalates_too() {
    let mut h = harness(false);
    h.pump_fault.set(true);
    assert_eq!(h.run_to_halt(), RunState::ErrorPump);
    assert!(h.automation.point_boundaries().is_empty());
}

#[test]
fn silent_calorimeter_misses_the_configuration_deadline() {
    let mut h = harness(false);
    h.calo_muted.set(true);
    assert_eq!(h.run_to_halt(), RunState::Error);
    assert!(h.clock.elapsed() >= Duration::from_secs(30));
    assert!(h.device_failures().is_empty());
}

// ── Abort ─────────────────────────────────────────────────────

#[test]
fn cancellation_runs_the_shutdown_into_aborted() {
    let mut h = harness(false);
    let cancel = CancellationToken::new();
    let clock = h.clock.clone();
    let token = cancel.clone();
    let mut pauses = 0;
    let outcome = runner::run(&mut h.automation, &mut h.sink, &cancel, || {
        pauses += 1;
        assert!(pauses < 500, "run did not halt");
        if pauses == 5 {
            token.cancel();
        }
        clock.advance(Duration::from_secs(1));
    });

    assert_eq!(outcome.state, RunState::Aborted);
    assert!(!outcome.finished());
    assert!(h.state_changes().contains(&"Shutdown_Aborted"));
    h.assert_pumps_stopped_before_bath();
}

#[test]
fn abort_is_ignored_once_shutdown_started() {
    let mut h = harness(false);
    assert!(h.run_until(|a| a.state() == RunState::ListProcessing));
    h.pump_fault.set(true);
    assert!(h.run_until(|a| a.state_name() == "Shutdown_Error_Pump"));

    h.automation.abort(&mut h.sink);
    assert_eq!(h.automation.state_name(), "Shutdown_Error_Pump");
    assert_eq!(h.run_to_halt(), RunState::ErrorPump);
}
