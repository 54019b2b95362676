pub mod config;
pub mod error;
pub mod fairness;
pub mod link;
pub mod message;
pub mod metrics;
pub mod network;
pub mod telemetry;
pub mod trace;

pub use config::{
    DriverConfig, EstimatorConfig, ForwarderConfig, MeridianConfig, ObjectQueueConfig,
    ObjectQueueKind, PacingConfig,
};
pub use error::{ConfigError, FlowError, FlowResult, LinkError, LinkResult, PushError};
pub use fairness::{
    FairObjectMessageQueue, FairQueue, FairServerMessageQueue, FairServerMessageReceiver,
    FifoObjectMessageQueue, ForwarderServiceQueue, ObjectMessageQueue, QueueInfo,
    ServerMessageQueue, ServerMessageReceiver, ServerRoutingAdapter, ServiceOutcome,
};
pub use link::{Direction, Link, LinkHandle, LinkParts, LinkReport};
pub use message::{ObjectId, ObjectMessage, QueueMessage, ServerId, ServerMessage, ServiceTag};
pub use metrics::Metrics;
pub use network::{MemoryNetwork, Network, NetworkListener, ServerMessageListener};
pub use trace::{Hooks, LogTrace, MessageTrace, NoTrace};
