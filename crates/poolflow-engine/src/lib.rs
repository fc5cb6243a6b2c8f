/*!
 * PoolFlow Engine
 *
 * This crate runs the device session: the state machine that owns all pool
 * state, the timers it arms, the driver task that carries out its effects and
 * the client handle used to observe and command it.
 */

#![warn(missing_docs)]

// Re-export core types
pub use poolflow_core::prelude;

pub mod client;
pub mod error;
pub mod session;
pub mod state_machine;
pub mod timers;

// Re-export main types for convenience
pub use client::PoolClient;
pub use error::{Error, Result};
pub use session::PoolService;
pub use state_machine::{Command, Effect, Input, MachineSettings, PoolSnapshot, PoolStateMachine};
pub use timers::{TimerId, Timers};

/// PoolFlow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("PoolFlow Engine {} initialized", VERSION);
    Ok(())
}
