//! Simple periodic variants: temperature, humidity, alarm, lamp post

use super::{CommandOutcome, DeviceBehavior, DeviceCommand, Sample};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use vigia_wire::DeviceKind;

/// Ambient temperature as a bounded random walk around a base value.
pub struct TemperatureDevice {
    current: Mutex<f64>,
    base: f64,
}

impl TemperatureDevice {
    pub fn new(base: f64) -> Self {
        Self {
            current: Mutex::new(base),
            base,
        }
    }
}

impl DeviceBehavior for TemperatureDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Temperature
    }

    fn sample(&self) -> Sample {
        let mut current = self.current.lock().unwrap();
        let step = rand::thread_rng().gen_range(-0.5..=0.5);
        *current = (*current + step).clamp(self.base - 5.0, self.base + 5.0);
        Sample {
            value: (*current * 10.0).round() / 10.0,
            unit: "C".into(),
        }
    }

    fn apply(&self, command: &DeviceCommand) -> CommandOutcome {
        CommandOutcome::unrecognized(command)
    }
}

/// Relative humidity, random walk between 30% and 90%.
pub struct HumidityDevice {
    current: Mutex<f64>,
}

impl HumidityDevice {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(60.0),
        }
    }
}

impl Default for HumidityDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBehavior for HumidityDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Humidity
    }

    fn sample(&self) -> Sample {
        let mut current = self.current.lock().unwrap();
        let step = rand::thread_rng().gen_range(-2.0..=2.0);
        *current = (*current + step).clamp(30.0, 90.0);
        Sample {
            value: (*current * 10.0).round() / 10.0,
            unit: "%".into(),
        }
    }

    fn apply(&self, command: &DeviceCommand) -> CommandOutcome {
        CommandOutcome::unrecognized(command)
    }
}

/// PIR-style intrusion alarm. While armed, each sample may trip.
pub struct AlarmDevice {
    armed: AtomicBool,
    trip_chance: f64,
}

impl AlarmDevice {
    pub fn new(trip_chance: f64) -> Self {
        Self {
            armed: AtomicBool::new(true),
            trip_chance,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl DeviceBehavior for AlarmDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Alarm
    }

    fn sample(&self) -> Sample {
        let tripped = self.is_armed() && rand::thread_rng().gen_bool(self.trip_chance);
        Sample {
            value: if tripped { 1.0 } else { 0.0 },
            unit: "trigger".into(),
        }
    }

    fn apply(&self, command: &DeviceCommand) -> CommandOutcome {
        match command {
            DeviceCommand::Arm => {
                self.armed.store(true, Ordering::SeqCst);
                CommandOutcome::Applied("alarm armed".into())
            }
            DeviceCommand::Disarm => {
                self.armed.store(false, Ordering::SeqCst);
                CommandOutcome::Applied("alarm disarmed".into())
            }
            other => CommandOutcome::unrecognized(other),
        }
    }
}

/// Street lamp, remotely switchable.
pub struct LampDevice {
    lit: AtomicBool,
}

impl LampDevice {
    pub fn new() -> Self {
        Self {
            lit: AtomicBool::new(false),
        }
    }
}

impl Default for LampDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBehavior for LampDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::LampPost
    }

    fn sample(&self) -> Sample {
        Sample {
            value: if self.lit.load(Ordering::SeqCst) { 1.0 } else { 0.0 },
            unit: "state".into(),
        }
    }

    fn apply(&self, command: &DeviceCommand) -> CommandOutcome {
        match command {
            DeviceCommand::LampOn => {
                self.lit.store(true, Ordering::SeqCst);
                CommandOutcome::Applied("lamp on".into())
            }
            DeviceCommand::LampOff => {
                self.lit.store(false, Ordering::SeqCst);
                CommandOutcome::Applied("lamp off".into())
            }
            other => CommandOutcome::unrecognized(other),
        }
    }
}
