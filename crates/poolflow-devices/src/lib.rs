/*!
 * PoolFlow Devices
 *
 * This crate speaks to pool controllers: the line protocol, the control
 * connection, network discovery and persistence of the paired address.
 */

#![warn(missing_docs)]

// Re-export core types
pub use poolflow_core::prelude;

pub mod connector;
pub mod discovery;
pub mod error;
pub mod pairing;
pub mod protocol;
pub mod simulator;
pub mod transport;

pub use connector::{BoxedStream, Connector, DeviceStream, SharedConnector, TcpConnector};
pub use discovery::{candidate_queue, DiscoveryScanner, ProbeOutcome, ScanEvent, ScanOptions};
pub use error::{DeviceError, Result};
pub use pairing::{load_or_unpaired, FilePairingStore, MemoryPairingStore, PairingStore};
pub use protocol::{DecodeError, Message, Request};
pub use simulator::{SimulatedController, SimulatorConnector};
pub use transport::{ConnectionId, Transport, TransportEvent, TransportNotice, TransportOptions};

/// PoolFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> std::result::Result<(), poolflow_core::error::Error> {
    tracing::info!("PoolFlow Devices {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
