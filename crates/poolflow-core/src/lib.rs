/*!
 * PoolFlow Core
 *
 * This crate provides the shared foundation for the PoolFlow pool controller
 * client: domain types, configuration, logging and the event bus.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// PoolFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with the default log filter
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("PoolFlow Core {} initialized", VERSION);
    Ok(())
}
