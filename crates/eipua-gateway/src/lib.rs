//! Process shell of the EtherNet/IP to OPC UA bridge: flag parsing,
//! logging, the status endpoint, the audit trail and signal handling around
//! the engine in `eipua-io`.

pub mod infra;
pub mod runtime;
