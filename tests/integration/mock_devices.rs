//! Mock instruments for integration tests.
//!
//! Every driver call and every phase change lands in one shared journal so
//! tests can assert on cross-device ordering (pumps off before the bath).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use calorimetry_rig::adapters::time::ManualClock;
use calorimetry_rig::drivers::{Calorimeter, Device, DriverPhase, Pump, SensorRow, Thermostat};

// ── Call record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Activate(String),
    Deactivate(String),
    SetFlow(String, f64),
    SetTemperature(String, f64),
    Phase(String, DriverPhase),
}

pub type Calls = Rc<RefCell<Vec<Call>>>;

/// Position of the last call matching `pred`.
pub fn last_index(calls: &Calls, pred: impl Fn(&Call) -> bool) -> Option<usize> {
    calls.borrow().iter().rposition(pred)
}

pub fn first_index(calls: &Calls, pred: impl Fn(&Call) -> bool) -> Option<usize> {
    calls.borrow().iter().position(pred)
}

// ── Pump / thermostat ─────────────────────────────────────────

/// One-step-per-tick driver following the shared phase table.
pub struct MockDriver {
    name: String,
    phase: DriverPhase,
    wants_on: bool,
    calls: Calls,
    /// Set to drop the driver into `Error` on its next tick.
    pub fault: Rc<Cell<bool>>,
}

impl MockDriver {
    pub fn new(name: &str, calls: &Calls) -> Self {
        Self {
            name: name.to_string(),
            phase: DriverPhase::Configuration,
            wants_on: false,
            calls: Rc::clone(calls),
            fault: Rc::new(Cell::new(false)),
        }
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn step(&mut self) {
        let next = if self.fault.get() {
            DriverPhase::Error
        } else {
            match self.phase {
                DriverPhase::Configuration => DriverPhase::Deactivated,
                DriverPhase::Deactivated if self.wants_on => DriverPhase::Activating,
                DriverPhase::Activating => DriverPhase::Activated,
                DriverPhase::Activated if !self.wants_on => DriverPhase::Deactivating,
                DriverPhase::Deactivating => DriverPhase::Deactivated,
                other => other,
            }
        };
        if next != self.phase {
            self.phase = next;
            self.record(Call::Phase(self.name.clone(), next));
        }
    }
}

impl Device for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self) {
        self.step();
    }

    fn state_name(&self) -> &'static str {
        match self.phase {
            DriverPhase::Configuration => "Configuration",
            DriverPhase::Deactivated => "Deactivated",
            DriverPhase::Activating => "Activating",
            DriverPhase::Activated => "Activated",
            DriverPhase::Deactivating => "Deactivating",
            DriverPhase::Error => "Error",
        }
    }

    fn is_error(&self) -> bool {
        self.phase == DriverPhase::Error
    }
}

impl Pump for MockDriver {
    fn phase(&self) -> DriverPhase {
        self.phase
    }

    fn activate_pump(&mut self) {
        self.wants_on = true;
        self.record(Call::Activate(self.name.clone()));
    }

    fn deactivate_pump(&mut self) {
        self.wants_on = false;
        self.record(Call::Deactivate(self.name.clone()));
    }

    fn set_target_flowrate(&mut self, ml_per_min: f64) -> f64 {
        self.record(Call::SetFlow(self.name.clone(), ml_per_min));
        ml_per_min
    }
}

impl Thermostat for MockDriver {
    fn phase(&self) -> DriverPhase {
        self.phase
    }

    fn activate_pump(&mut self) {
        Pump::activate_pump(self);
    }

    fn deactivate_pump(&mut self) {
        Pump::deactivate_pump(self);
    }

    fn set_target_temperature(&mut self, celsius: f64) -> f64 {
        self.record(Call::SetTemperature(self.name.clone(), celsius));
        celsius
    }
}

// ── Calorimeter ───────────────────────────────────────────────

/// Emits one settled row per tick at its set temperature.
pub struct MockCalorimeter {
    clock: ManualClock,
    rows: Vec<SensorRow>,
    temperature: f64,
    calls: Calls,
    pub fault: Rc<Cell<bool>>,
    /// No rows while set.
    pub muted: Rc<Cell<bool>>,
}

impl MockCalorimeter {
    pub fn new(clock: &ManualClock, calls: &Calls) -> Self {
        Self {
            clock: clock.clone(),
            rows: Vec::new(),
            temperature: 20.0,
            calls: Rc::clone(calls),
            fault: Rc::new(Cell::new(false)),
            muted: Rc::new(Cell::new(false)),
        }
    }
}

impl Device for MockCalorimeter {
    fn name(&self) -> &str {
        "Calo"
    }

    fn tick(&mut self) {
        if self.fault.get() || self.muted.get() {
            return;
        }
        let t = self.temperature;
        let elapsed = self.clock.elapsed().as_secs_f64();
        self.rows.push(SensorRow::from_fields([
            elapsed, t, t, t, t, t - 0.4, t - 0.5, t + 0.2, 0.5, 0.2, 0.2,
        ]));
    }

    fn state_name(&self) -> &'static str {
        if self.fault.get() { "Error" } else { "Read_And_Check" }
    }

    fn is_error(&self) -> bool {
        self.fault.get()
    }
}

impl Calorimeter for MockCalorimeter {
    fn rows(&self) -> &[SensorRow] {
        &self.rows
    }

    fn set_target_temperature(&mut self, celsius: f64) -> f64 {
        self.temperature = celsius;
        self.calls
            .borrow_mut()
            .push(Call::SetTemperature("Calo".into(), celsius));
        celsius
    }
}
