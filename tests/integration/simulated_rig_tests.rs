//! Complete experiments against the simulated instruments.
//!
//! Builds the rig from a JSON config through the same path the CLI uses,
//! then drives it with a hand-advanced clock.

use std::rc::Rc;
use std::time::Duration;

use calorimetry_rig::adapters::log_sink::RecordingSink;
use calorimetry_rig::adapters::sim::{Journal, SimulatedPorts};
use calorimetry_rig::adapters::time::ManualClock;
use calorimetry_rig::app::automation::{Automation, RunState};
use calorimetry_rig::app::builder::build_automation;
use calorimetry_rig::app::runner::Report;
use calorimetry_rig::config::RigConfig;
use calorimetry_rig::drivers::DriverPhase;
use calorimetry_rig::drivers::lambda::{FrameKind, parse_frame};
use calorimetry_rig::error::Error;

const TICK: Duration = Duration::from_millis(20);

fn two_lambda_config() -> RigConfig {
    RigConfig::from_json(
        r#"{
            "pumps": [
                {"kind": "Lambda", "name": "Lambda 1", "port": "sim"},
                {"kind": "Lambda", "name": "Lambda 3", "port": "sim"}
            ],
            "thermostat": {"port": "sim"},
            "calorimeter": {"port": "sim"},
            "dead_time_ms": 6000,
            "operation_points": [
                {"duration_ms": 18000, "temperature": 25.0, "flowrates": [6.1, 6.05]},
                {"duration_ms": 18000, "temperature": 25.0, "flowrates": [6.1, 6.05]}
            ]
        }"#,
    )
    .unwrap()
}

fn build(config: &RigConfig) -> (Automation, ManualClock, Journal) {
    let clock = ManualClock::new();
    let mut ports = SimulatedPorts::new(Rc::new(clock.clone()));
    let journal = ports.journal();
    let automation = build_automation(config, &mut ports, Rc::new(clock.clone())).unwrap();
    (automation, clock, journal)
}

fn run(automation: &mut Automation, clock: &ManualClock, sink: &mut RecordingSink, limit: Duration) -> bool {
    while clock.elapsed() < limit {
        automation.tick(sink);
        if automation.is_halted() {
            return true;
        }
        clock.advance(TICK);
    }
    false
}

/// Position of the last Lambda frame that set a pump to zero.
fn last_pump_stop(journal: &Journal) -> Option<usize> {
    journal.borrow().iter().rposition(|(device, command)| {
        device.starts_with("Lambda")
            && parse_frame(command.as_bytes()).is_ok_and(|f| f.kind == FrameKind::Command && f.value == Some(0))
    })
}

#[test]
fn two_point_list_finishes() {
    let config = two_lambda_config();
    let (mut automation, clock, journal) = build(&config);
    let mut sink = RecordingSink::default();

    assert!(run(&mut automation, &clock, &mut sink, Duration::from_secs(300)));
    assert_eq!(automation.state(), RunState::Finished);

    let rig = automation.rig();
    assert!(rig.pumps.iter().all(|p| p.phase() == DriverPhase::Deactivated));
    assert_eq!(rig.thermostat.phase(), DriverPhase::Deactivated);

    // soak, then both points back to back at the same temperature
    let boundaries = automation.point_boundaries();
    assert_eq!(boundaries.len(), 3);
    assert!(boundaries[0].soak);
    assert!(boundaries[1..].iter().all(|b| !b.soak && b.set_flowrates == [6.1, 6.05]));

    // at least two full holds of streamed telegrams
    assert!(automation.rows().len() >= 36);
    assert!(automation.rows().iter().any(|r| r.t_set == 25.0));

    let journal_ref = journal.borrow();
    let bath_off = journal_ref
        .iter()
        .rposition(|(device, command)| device == "Fisher" && command == "SO 0")
        .unwrap();
    drop(journal_ref);
    assert!(last_pump_stop(&journal).unwrap() < bath_off);
    assert!(journal.borrow().iter().any(|(d, c)| d == "Fisher" && c == "SS 26.0"));
    assert!(journal.borrow().iter().any(|(d, c)| d == "Calo" && c == "<1,25.00>"));
}

#[test]
fn report_serialises_the_run() {
    let (mut automation, clock, _) = build(&two_lambda_config());
    let mut sink = RecordingSink::default();
    assert!(run(&mut automation, &clock, &mut sink, Duration::from_secs(300)));

    let report = Report::collect(&automation);
    assert_eq!(report.final_state, "Finished");
    assert!(report.metrics.is_empty());
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["point_boundaries"].as_array().unwrap().len(), 3);
    assert_eq!(json["rows"].as_array().unwrap().len(), report.rows.len());
}

#[test]
fn operator_abort_stops_a_running_rig() {
    let (mut automation, clock, journal) = build(&two_lambda_config());
    let mut sink = RecordingSink::default();

    assert!(!run(&mut automation, &clock, &mut sink, Duration::from_secs(30)));
    assert_eq!(automation.state(), RunState::ListProcessing);
    automation.abort(&mut sink);
    assert_eq!(automation.state_name(), "Shutdown_Aborted");

    assert!(run(&mut automation, &clock, &mut sink, Duration::from_secs(120)));
    assert_eq!(automation.state(), RunState::Aborted);
    assert!(automation.rig().pumps.iter().all(|p| p.phase() == DriverPhase::Deactivated));
    assert!(journal.borrow().iter().any(|(d, c)| d == "Fisher" && c == "SO 0"));
}

#[test]
fn invalid_configs_fail_before_any_port_opens() {
    let mut config = two_lambda_config();
    config.operation_points[1].flowrates.pop();
    let clock = ManualClock::new();
    let mut ports = SimulatedPorts::new(Rc::new(clock.clone()));
    let err = build_automation(&config, &mut ports, Rc::new(clock)).err().unwrap();
    assert!(matches!(err, Error::Config(_)));
    assert!(ports.journal().borrow().is_empty());
}
