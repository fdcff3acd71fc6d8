use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use busrelay::error::LinkError;
use busrelay::fetch::ReqwestClient;
use busrelay::link::{self, Inbound, read_frame};
use busrelay::location::StaticLocation;
use busrelay::logging::init_logging;
use busrelay::status::status_route;
use busrelay::{Coordinator, RelayConfig, RelayState};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging and configuration
    init_logging();
    let config = RelayConfig::from_env()?;
    let state = Arc::new(RelayState::new());

    // 2. Status endpoint
    tokio::spawn(warp::serve(status_route(state.clone())).run(([0, 0, 0, 0], config.status_port)));
    info!(port = config.status_port, "Status server running");

    // 3. Upstream API client and position source, shared across connections
    let http = ReqwestClient::new()?;
    let location = StaticLocation::new(config.fixed_position);

    // 4. Peer link, reconnecting whenever it drops
    loop {
        info!(host = %config.peer_host, port = config.peer_port, "Connecting to peer bridge...");
        match connect_and_listen(&config, &state, &http, &location).await {
            Ok(()) => warn!("Peer connection closed."),
            Err(e) => error!(error = %e, "Peer link error"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_listen(
    config: &RelayConfig,
    state: &Arc<RelayState>,
    http: &ReqwestClient,
    location: &StaticLocation,
) -> Result<()> {
    let (link, mut reader) =
        link::connect(&config.peer_host, config.peer_port, config.link_ack_timeout).await?;
    info!("Connected to peer bridge.");

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        link.clone(),
        http.clone(),
        location.clone(),
        state.clone(),
    ));

    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(LinkError::Closed) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        match link.handle_frame(frame) {
            Some(Inbound::Ready) => {
                coordinator.on_ready();
            }
            Some(Inbound::Request(dict)) => {
                coordinator.dispatch(&dict);
            }
            None => {}
        }
    };

    // Anything still waiting on a receipt will never get one.
    link.close();
    result
}
