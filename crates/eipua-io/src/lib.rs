pub mod connection;
#[cfg(feature = "enip")]
pub mod enip;
pub mod events;
mod link;
pub mod metrics;
#[cfg(feature = "opcua")]
pub mod opcua_client;
pub mod orchestrator;
pub mod poller;
pub mod publisher;
pub mod sim;
pub mod transport;

pub use connection::ConnectionManager;
pub use events::{EngineEvent, EventSink, NullSink};
pub use link::LinkConfig;
pub use metrics::{init_metrics, serve_status, StatusServer};
pub use orchestrator::{load_profile, validate_endpoint, EngineConfig, Orchestrator};
pub use poller::TagPoller;
pub use publisher::{BadQualityPolicy, OpcUaPublisher, PublishOutcome, PublisherConfig};
pub use sim::{SimDevice, SimServer};
pub use transport::{DeviceTransport, EnsureOutcome, NodeSpec, NodeWrite, ServerTransport};
