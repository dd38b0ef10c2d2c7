//! Machine and sandbox lifecycle management.

mod workdir;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod machine;
pub mod sandbox;

pub use workdir::*;
