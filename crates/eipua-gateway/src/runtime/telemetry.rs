use eipua_core::StatusExchange;
use eipua_io::{init_metrics, serve_status, StatusServer};
use std::sync::Arc;
use tracing::{info, warn};

pub fn init() {
    init_metrics();
}

/// A status server that fails to bind is logged and skipped; the bridge
/// keeps running without it.
pub fn start_status_server(
    addr: Option<&str>,
    exchange: Arc<StatusExchange>,
) -> Option<StatusServer> {
    let addr = addr?;
    info!(addr = %addr, "Starting status server");
    match serve_status(addr, exchange) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!(addr = %addr, error = %e, "Status server failed to start");
            None
        }
    }
}
