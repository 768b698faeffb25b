use figlink_hub::{HubConfig, HubState};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use url::Url;

/// Serves a hub on an ephemeral loopback port until the returned sender is
/// dropped or flipped.
pub(crate) async fn launch_hub(config: HubConfig) -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(figlink_hub::serve(listener, Arc::new(HubState::new(config)), rx));
    (addr, shutdown)
}

pub(crate) fn hub_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{addr}")).expect("url")
}
