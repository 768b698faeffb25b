pub mod config;
pub mod heartbeat;
pub mod hub;
pub mod registry;
pub mod routes;

pub use config::{HubConfig, McpConflictPolicy, DEFAULT_PORT};
pub use heartbeat::{HeartbeatConfig, LivenessClock};
pub use hub::{router, run, serve, HubState};
pub use registry::{CloseReason, ConnectionRegistry, RegistryError};
pub use routes::{MessageClass, RouteBinding, RouteDecision, RouteResolver, RouteTable};
