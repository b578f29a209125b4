/*!
Builders for wire messages used across tests and examples
*/

use vigia_wire::{Command, DeviceKind, Reading, META_CONTROL_PORT, META_SOURCE_ADDRESS};

/// Fluent builder for test readings.
pub struct ReadingBuilder {
    reading: Reading,
}

impl ReadingBuilder {
    pub fn new<S: Into<String>>(device_id: S) -> Self {
        Self {
            reading: Reading {
                device_id: device_id.into(),
                location: "Test Yard".into(),
                kind: DeviceKind::Temperature as i32,
                value: 0.0,
                unit: String::new(),
                timestamp: 0,
                metadata: Default::default(),
            },
        }
    }

    pub fn location<S: Into<String>>(mut self, location: S) -> Self {
        self.reading.location = location.into();
        self
    }

    pub fn kind(mut self, kind: DeviceKind) -> Self {
        self.reading.kind = kind as i32;
        self
    }

    pub fn value<S: Into<String>>(mut self, value: f64, unit: S) -> Self {
        self.reading.value = value;
        self.reading.unit = unit.into();
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.reading.timestamp = timestamp;
        self
    }

    pub fn meta<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.reading.metadata.insert(key.into(), value.into());
        self
    }

    pub fn control_port(self, port: u16) -> Self {
        self.meta(META_CONTROL_PORT, port.to_string())
    }

    pub fn source_address<S: Into<String>>(self, address: S) -> Self {
        self.meta(META_SOURCE_ADDRESS, address)
    }

    pub fn build(self) -> Reading {
        self.reading
    }
}

/// A minimal command for queue/poll tests.
pub fn command<S: Into<String>, C: Into<String>>(device_id: S, name: C) -> Command {
    Command {
        device_id: device_id.into(),
        command: name.into(),
        params: Default::default(),
        command_id: "test-command".into(),
        enqueued_at: 0,
    }
}
