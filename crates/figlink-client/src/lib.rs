pub mod command;
pub mod link;
pub mod pending;
pub mod pool;
pub mod rpc;

#[cfg(test)]
mod test_support;

pub use command::{CommandClient, CommandClientConfig, ConnectionState};
pub use link::endpoint_url;
pub use pending::PendingTable;
pub use pool::RpcClientPool;
pub use rpc::{RpcClient, RpcClientConfig, DEFAULT_HUB_URL};
