//! Sandbox network isolation: namespaces, veth links, NAT and port-forward
//! rules, host route mirroring and DNS proxying.

mod cidrpool;
mod dns;
mod iptables;
mod naming;
mod netns;
mod portfwd;
mod routes;
mod veth;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cidrpool::*;
pub use dns::*;
pub use iptables::*;
pub use naming::*;
pub use netns::*;
pub use portfwd::*;
pub use routes::*;
pub use veth::*;
