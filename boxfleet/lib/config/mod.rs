//! Configuration types and defaults.

mod boxspec;
mod defaults;
mod env_pair;
mod machine;
mod port_forward;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use boxspec::*;
pub use defaults::*;
pub use env_pair::*;
pub use machine::*;
pub use port_forward::*;
