/*!
# Vigia DevKit - Stubs and Utilities for Development

Helpers for developing and testing Vigia components without a full network:
- Mock bus client for bus-ingestion tests without a broker
- Builders for wire readings and commands
- Protocol-level clients for the gateway's TCP/UDP surfaces
- A recording control endpoint that counts calls (push-mode test double)
*/

pub mod bus_stub;
pub mod net;
pub mod readings;

pub use bus_stub::MockBusClient;
pub use net::RecordingControlServer;
pub use readings::ReadingBuilder;

/// Initialize logging for tests and examples; safe to call repeatedly.
pub fn init_test_logging() {
    env_logger::try_init().ok();
}
