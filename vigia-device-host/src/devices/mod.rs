//! Device variants
//!
//! Every simulated device implements [`DeviceBehavior`]: produce a reading
//! on demand, react to tagged commands, and optionally drive its own
//! transmit timing (the semaphore does). Commands arrive as strings on the
//! wire and are parsed once into [`DeviceCommand`]; each variant dispatches
//! on the tag with an explicit default for anything it does not recognize.

pub mod semaphore;
pub mod variants;

pub use semaphore::{SemaphoreDevice, SignalColor, SignalCycle};
pub use variants::{AlarmDevice, HumidityDevice, LampDevice, TemperatureDevice};

use std::time::Duration;
use tokio::sync::Notify;
use vigia_wire::DeviceKind;

/// One sampled measurement, before it is wrapped into a wire reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub unit: String,
}

/// Tagged form of the command strings devices receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Transmit the latest reading now; every device understands this.
    Send,
    SetSignal(SignalColor),
    Arm,
    Disarm,
    LampOn,
    LampOff,
    Other(String),
}

impl DeviceCommand {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "send" => DeviceCommand::Send,
            "red" => DeviceCommand::SetSignal(SignalColor::Red),
            "yellow" => DeviceCommand::SetSignal(SignalColor::Yellow),
            "green" => DeviceCommand::SetSignal(SignalColor::Green),
            "arm" => DeviceCommand::Arm,
            "disarm" => DeviceCommand::Disarm,
            "on" => DeviceCommand::LampOn,
            "off" => DeviceCommand::LampOff,
            other => DeviceCommand::Other(other.to_string()),
        }
    }
}

/// Result of applying a command to a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied(String),
    Unsupported(String),
}

impl CommandOutcome {
    pub fn unrecognized(raw: &DeviceCommand) -> Self {
        CommandOutcome::Unsupported(format!("unrecognized command: {raw:?}"))
    }
}

/// Capability contract shared by every device variant.
pub trait DeviceBehavior: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Current measurement.
    fn sample(&self) -> Sample;

    /// React to a command. `Send` is handled by the runtime before this is
    /// called; variants only see the rest.
    fn apply(&self, command: &DeviceCommand) -> CommandOutcome;

    /// Time until the next periodic transmission. Variants with their own
    /// cycle (the semaphore) override this.
    fn dwell(&self, base: Duration) -> Duration {
        base
    }

    /// Advance periodic state when the dwell timer expires.
    fn tick(&self) {}

    /// Fires when a command changed the transmit timing and the active
    /// timer must be reset.
    fn timing_changed(&self) -> Option<&Notify> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_strings_parse_to_tags() {
        assert_eq!(DeviceCommand::parse("send"), DeviceCommand::Send);
        assert_eq!(
            DeviceCommand::parse("red"),
            DeviceCommand::SetSignal(SignalColor::Red)
        );
        assert_eq!(DeviceCommand::parse("arm"), DeviceCommand::Arm);
        assert_eq!(DeviceCommand::parse("off"), DeviceCommand::LampOff);
        assert_eq!(
            DeviceCommand::parse("warp"),
            DeviceCommand::Other("warp".into())
        );
    }
}
