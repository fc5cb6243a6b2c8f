/*!
 * Prelude module for PoolFlow Core.
 *
 * This module re-exports commonly used types and functions from the PoolFlow Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{
    ConnectionState, DeviceAddress, DiscoveredPool, DiscoveryProgress, ErrorFlags, LinkPhase,
    PumpMode, SignalEstimate, SlotIndex, TemperatureReading, TimeSlots, MAX_SLOT_HOURS, SLOT_COUNT,
};

// Re-export event types
pub use crate::event::{EventBus, PoolEvent, ScanOutcome, SharedEventBus};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::spawn_and_log;

pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
