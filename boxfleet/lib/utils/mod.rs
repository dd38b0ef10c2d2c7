//! Utility functions and types.

mod cmd;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cmd::*;
pub use path::*;
