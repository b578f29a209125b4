//! Traffic signal device
//!
//! The signal cycles red → yellow → green → red with asymmetric dwell
//! times: red and green hold for the configured interval, yellow is a
//! fixed short phase. An external command can force any color; forcing
//! resets the active phase timer.

use super::{CommandOutcome, DeviceBehavior, DeviceCommand, Sample};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use vigia_wire::DeviceKind;

pub const YELLOW_DWELL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalColor {
    Red,
    Yellow,
    Green,
}

impl SignalColor {
    pub fn code(&self) -> f64 {
        match self {
            SignalColor::Red => 0.0,
            SignalColor::Yellow => 1.0,
            SignalColor::Green => 2.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalColor::Red => "red",
            SignalColor::Yellow => "yellow",
            SignalColor::Green => "green",
        }
    }
}

/// The state machine proper: current color plus per-color dwell times.
#[derive(Debug, Clone)]
pub struct SignalCycle {
    state: SignalColor,
    red: Duration,
    yellow: Duration,
    green: Duration,
}

impl SignalCycle {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: SignalColor::Red,
            red: interval,
            yellow: YELLOW_DWELL,
            green: interval,
        }
    }

    pub fn state(&self) -> SignalColor {
        self.state
    }

    /// Natural transition: red → yellow → green → red.
    pub fn advance(&mut self) -> SignalColor {
        self.state = match self.state {
            SignalColor::Red => SignalColor::Yellow,
            SignalColor::Yellow => SignalColor::Green,
            SignalColor::Green => SignalColor::Red,
        };
        self.state
    }

    /// External override entry point.
    pub fn force(&mut self, color: SignalColor) {
        self.state = color;
    }

    /// How long the current color holds.
    pub fn dwell(&self) -> Duration {
        match self.state {
            SignalColor::Red => self.red,
            SignalColor::Yellow => self.yellow,
            SignalColor::Green => self.green,
        }
    }
}

pub struct SemaphoreDevice {
    cycle: Mutex<SignalCycle>,
    timing_changed: Notify,
}

impl SemaphoreDevice {
    pub fn new(interval: Duration) -> Self {
        Self {
            cycle: Mutex::new(SignalCycle::new(interval)),
            timing_changed: Notify::new(),
        }
    }

    pub fn state(&self) -> SignalColor {
        self.cycle.lock().unwrap().state()
    }
}

impl DeviceBehavior for SemaphoreDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Semaphore
    }

    fn sample(&self) -> Sample {
        let state = self.state();
        Sample {
            value: state.code(),
            unit: state.name().to_string(),
        }
    }

    fn apply(&self, command: &DeviceCommand) -> CommandOutcome {
        match command {
            DeviceCommand::SetSignal(color) => {
                self.cycle.lock().unwrap().force(*color);
                // The runtime watches this to reset the active phase timer.
                self.timing_changed.notify_one();
                CommandOutcome::Applied(format!("signal forced to {}", color.name()))
            }
            other => CommandOutcome::unrecognized(other),
        }
    }

    fn dwell(&self, _base: Duration) -> Duration {
        self.cycle.lock().unwrap().dwell()
    }

    fn tick(&self) {
        let next = self.cycle.lock().unwrap().advance();
        tracing::info!("signal changed to {}", next.name());
    }

    fn timing_changed(&self) -> Option<&Notify> {
        Some(&self.timing_changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_runs_red_yellow_green_red() {
        let mut cycle = SignalCycle::new(Duration::from_secs(10));
        assert_eq!(cycle.state(), SignalColor::Red);
        assert_eq!(cycle.advance(), SignalColor::Yellow);
        assert_eq!(cycle.advance(), SignalColor::Green);
        assert_eq!(cycle.advance(), SignalColor::Red);
    }

    #[test]
    fn dwell_times_are_asymmetric() {
        let mut cycle = SignalCycle::new(Duration::from_secs(10));
        assert_eq!(cycle.dwell(), Duration::from_secs(10)); // red
        cycle.advance();
        assert_eq!(cycle.dwell(), YELLOW_DWELL); // yellow
        cycle.advance();
        assert_eq!(cycle.dwell(), Duration::from_secs(10)); // green
    }

    #[test]
    fn force_overrides_from_any_state() {
        let mut cycle = SignalCycle::new(Duration::from_secs(10));
        cycle.advance(); // yellow
        cycle.force(SignalColor::Red);
        assert_eq!(cycle.state(), SignalColor::Red);
        // The natural order resumes from the forced color.
        assert_eq!(cycle.advance(), SignalColor::Yellow);
    }

    #[tokio::test]
    async fn set_signal_command_notifies_the_timer() {
        let device = SemaphoreDevice::new(Duration::from_secs(10));
        let outcome = device.apply(&DeviceCommand::SetSignal(SignalColor::Green));
        assert_eq!(
            outcome,
            CommandOutcome::Applied("signal forced to green".into())
        );
        assert_eq!(device.state(), SignalColor::Green);

        // The permit left by notify_one wakes the runtime's reset branch.
        let notify = device.timing_changed().unwrap();
        tokio::time::timeout(Duration::from_millis(50), notify.notified())
            .await
            .expect("timer reset notification");
    }

    #[test]
    fn unknown_commands_are_reported_not_applied() {
        let device = SemaphoreDevice::new(Duration::from_secs(10));
        let outcome = device.apply(&DeviceCommand::Other("sparkle".into()));
        assert!(matches!(outcome, CommandOutcome::Unsupported(_)));
        assert_eq!(device.state(), SignalColor::Red);
    }
}
