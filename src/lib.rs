//! Software emulator of a Room Control Unit (RCU) on a heat pump's two-wire
//! differential serial bus: a passive slave that answers the master's
//! polling, decodes parameter telegrams, and optionally originates write
//! requests.

pub mod cli;
pub mod rcu;
pub mod utils;
