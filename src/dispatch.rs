//! Request coordination: routes inbound peer requests to the streamers and
//! reports transaction-ending failures back to the peer.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::arrivals::{ArrivalStreamer, StreamOutcome};
use crate::backoff::{BackoffSender, Delivery};
use crate::config::RelayConfig;
use crate::error::{LocationError, RelayError, RequestError};
use crate::fetch::{HttpClient, ObaEndpoints, ResilientFetcher};
use crate::link::PeerLink;
use crate::location::{LocationProvider, Position};
use crate::message::{BusRef, Dictionary, PeerMessage, PeerRequest, RouteStream};
use crate::oba_types::{parse_stop_routes, parse_stops_for_location};
use crate::state::{RelayState, TransactionId, bump};
use crate::stops::{CrossReference, StopRouteStreamer};

pub struct Coordinator<L, H, G> {
    config: RelayConfig,
    endpoints: ObaEndpoints,
    sender: BackoffSender<L>,
    fetcher: ResilientFetcher<H>,
    location: G,
    state: Arc<RelayState>,
}

impl<L, H, G> Coordinator<L, H, G>
where
    L: PeerLink,
    H: HttpClient,
    G: LocationProvider,
{
    pub fn new(config: RelayConfig, link: L, http: H, location: G, state: Arc<RelayState>) -> Self {
        let sender = BackoffSender::new(
            link,
            config.link_max_attempts,
            config.link_retry_base,
            state.clone(),
        );
        let fetcher = ResilientFetcher::new(http, &config, state.clone());
        Self {
            endpoints: ObaEndpoints::new(&config),
            config,
            sender,
            fetcher,
            location,
            state,
        }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn link(&self) -> &L {
        self.sender.link()
    }

    pub fn http(&self) -> &H {
        self.fetcher.client()
    }

    /// Decode an inbound dictionary, claim its transaction and run the
    /// handler in the background. Undecodable and unknown requests are
    /// logged and dropped without a reply.
    pub fn dispatch(self: &Arc<Self>, dict: &Dictionary) -> Option<JoinHandle<()>> {
        let request = match PeerRequest::from_dictionary(dict) {
            Ok(request) => request,
            Err(RequestError::UnknownType(tag)) => {
                warn!(message_type = tag, "Unknown messageType");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request");
                return None;
            }
        };

        self.begin(&request);
        let this = self.clone();
        Some(tokio::spawn(async move { this.handle(request).await }))
    }

    /// The peer signalled it is ready: push the current location. Counted
    /// like an explicit location request.
    pub fn on_ready(self: &Arc<Self>) -> JoinHandle<()> {
        info!("Peer ready");
        let this = self.clone();
        tokio::spawn(async move { this.process(PeerRequest::Location).await })
    }

    /// Claim the transaction and run the request to completion in place.
    pub async fn process(&self, request: PeerRequest) {
        self.begin(&request);
        self.handle(request).await;
    }

    fn begin(&self, request: &PeerRequest) {
        bump(&self.state.requests_handled);
        if let Some(transaction_id) = request.transaction_id() {
            let superseded = self.state.transactions.set_current(transaction_id);
            info!(transaction_id, ?superseded, "Initiated transaction");
        }
    }

    async fn handle(&self, request: PeerRequest) {
        let result = match request {
            PeerRequest::Arrivals {
                transaction_id,
                buses,
            } => self.arrivals(transaction_id, buses).await,
            PeerRequest::NearbyStops { transaction_id } => self.nearby_stops(transaction_id).await,
            PeerRequest::Location => self.send_location().await,
            PeerRequest::RoutesForStop {
                transaction_id,
                stop_id,
            } => self.routes_for_stop(transaction_id, &stop_id).await,
        };

        if let Err(e) = result {
            self.report(e).await;
        }
    }

    async fn arrivals(
        &self,
        transaction_id: TransactionId,
        buses: Vec<BusRef>,
    ) -> Result<(), RelayError> {
        let streamer = ArrivalStreamer {
            sender: &self.sender,
            fetcher: &self.fetcher,
            authority: &self.state.transactions,
            endpoints: &self.endpoints,
            timezone: self.config.timezone,
        };
        streamer.stream(buses, transaction_id).await?;
        Ok(())
    }

    async fn nearby_stops(&self, transaction_id: TransactionId) -> Result<(), RelayError> {
        let position = self
            .acquire_position()
            .await
            .map_err(RelayError::NearbyLocationUnavailable)?;

        let url = self.endpoints.stops_for_location(position);
        let body = self
            .fetcher
            .fetch(&url)
            .await
            .map_err(RelayError::FetchExhausted)?;
        let data = parse_stops_for_location(&body)?;

        let xref = CrossReference::build(&data.list, &data.references.routes);
        info!(
            transaction_id,
            stops = data.list.len(),
            routes = data.references.routes.len(),
            "Fetched nearby stops"
        );
        self.stop_route_streamer()
            .stream_stops(data.list, data.references.routes, &xref, transaction_id)
            .await;
        Ok(())
    }

    async fn routes_for_stop(
        &self,
        transaction_id: TransactionId,
        stop_id: &str,
    ) -> Result<(), RelayError> {
        let body = self
            .fetcher
            .fetch(&self.endpoints.stop(stop_id))
            .await
            .map_err(RelayError::FetchExhausted)?;
        let routes = parse_stop_routes(&body)?;

        let xref = CrossReference::for_single_stop(stop_id, &routes);
        let outcome = self
            .stop_route_streamer()
            .stream_routes(routes, &xref.stops_by_route, transaction_id, RouteStream::ForStop)
            .await;
        if outcome == StreamOutcome::Superseded {
            info!(transaction_id, stop_id, "Routes for stop superseded");
        }
        Ok(())
    }

    async fn send_location(&self) -> Result<(), RelayError> {
        let position = self
            .acquire_position()
            .await
            .map_err(RelayError::LocationUnavailable)?;
        info!(lat = position.lat, lon = position.lon, "Sending location");
        if self.sender.send(&PeerMessage::Location(position)).await == Delivery::Dropped {
            warn!("Location was not delivered");
        }
        Ok(())
    }

    async fn acquire_position(&self) -> Result<Position, LocationError> {
        let timeout = self.config.gps_timeout;
        match tokio::time::timeout(
            timeout,
            self.location.current_position(timeout, self.config.gps_max_age),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LocationError::Timeout(timeout)),
        }
    }

    fn stop_route_streamer(&self) -> StopRouteStreamer<'_, L> {
        StopRouteStreamer {
            sender: &self.sender,
            authority: &self.state.transactions,
            max_stops: self.config.max_stops,
        }
    }

    /// Surface a transaction-ending failure on the peer.
    async fn report(&self, err: RelayError) {
        error!(code = err.diagnostic_code(), error = %err, "Reporting error to peer");
        let message = PeerMessage::Error {
            description: Some(err.dialog()),
        };
        self.sender.send(&message).await;
    }
}
