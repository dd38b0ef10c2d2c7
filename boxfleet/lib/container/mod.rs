//! The sandbox container: OCI configuration, runtime driver and lifecycle.

mod lifecycle;
mod runtime;
mod spec;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use lifecycle::*;
pub use runtime::*;
pub use spec::*;
