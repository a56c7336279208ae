pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod relay;
pub mod session;
pub mod upstream;

pub use broker::{Broker, InboundMessage, NatsBroker};
pub use codec::{AudioFragment, EncodingMode, FragmentKind, FrameBuilder};
pub use config::Config;
pub use error::{RelayError, RelayResult};
pub use http::{create_router, AppState};
pub use relay::{HealthStatus, Publisher, RelayEngine, RelaySettings};
pub use session::{Session, SessionLimits, SessionRegistry, SessionState, SessionStats};
pub use upstream::{factory_from_config, UpstreamEvent, UpstreamFactory, UpstreamStream};
