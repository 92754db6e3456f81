pub mod backoff;
pub mod error;
pub mod health;
pub mod point;
pub mod profile;
pub mod session;
pub mod sync;
pub mod timebase;
pub mod translate;

pub use backoff::BackoffPolicy;
pub use error::{
    ConfigError, GatewayError, ProtocolError, Result, TranslationError, TransportError,
};
pub use health::{EngineCounters, EngineState, HealthStatus, HealthView};
pub use point::{DataPoint, PollCycle, Quality, ReadErrorKind, ReadResult, Value};
pub use profile::{DataKind, DeviceProfile, TagDescriptor, ValueRange};
pub use session::{Session, SessionSide, SessionSnapshot, SessionState, SessionView};
pub use sync::{PointTable, StatusExchange};
pub use timebase::TimeBase;
pub use translate::{StaleMode, StalenessPolicy, Translator};
