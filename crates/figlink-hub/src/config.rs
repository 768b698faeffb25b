use crate::{heartbeat::HeartbeatConfig, routes::RouteTable};
use clap::ValueEnum;
use figlink_core::DEFAULT_MAX_FRAME_BYTES;
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

pub const DEFAULT_PORT: u16 = 3055;

/// What happens when a second `mcp` peer dials in for a token that already
/// has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum McpConflictPolicy {
    /// Close the connected peer and admit the newcomer.
    #[default]
    EvictIncumbent,
    /// Keep the connected peer and close the newcomer.
    RejectNewcomer,
}

impl McpConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpConflictPolicy::EvictIncumbent => "evict-incumbent",
            McpConflictPolicy::RejectNewcomer => "reject-newcomer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub addr: SocketAddr,
    pub allow_remote: bool,
    pub heartbeat: HeartbeatConfig,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_message_bytes: usize,
    pub mcp_policy: McpConflictPolicy,
    pub routes: RouteTable,
    pub debug: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            allow_remote: false,
            heartbeat: HeartbeatConfig::default(),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_message_bytes: DEFAULT_MAX_FRAME_BYTES,
            mcp_policy: McpConflictPolicy::default(),
            routes: RouteTable::default(),
            debug: false,
        }
    }
}
