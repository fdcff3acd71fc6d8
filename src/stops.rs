//! Stop and route streaming for the nearby-stops and routes-for-stop
//! requests.

use compact_str::CompactString;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::arrivals::StreamOutcome;
use crate::backoff::BackoffSender;
use crate::link::PeerLink;
use crate::location::Position;
use crate::message::{PeerMessage, RouteItem, RouteStream, StopItem};
use crate::oba_types::{Route, Stop};
use crate::state::{TransactionAuthority, TransactionId};

/// Per-fetch lookup tables relating stops and routes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CrossReference {
    /// stop id -> comma-joined route display names
    pub routes_by_stop: HashMap<CompactString, String>,
    /// route id -> comma-terminated stop ids
    pub stops_by_route: HashMap<CompactString, String>,
}

impl CrossReference {
    pub fn build(stops: &[Stop], routes: &[Route]) -> Self {
        let names: HashMap<&str, String> = routes
            .iter()
            .filter_map(|r| r.id.as_deref().map(|id| (id, r.display_name())))
            .collect();

        let mut xref = CrossReference::default();
        for stop in stops {
            let (Some(stop_id), Some(route_ids)) = (&stop.id, &stop.route_ids) else {
                continue;
            };

            let route_names: Vec<&str> = route_ids
                .iter()
                .filter_map(|id| names.get(id.as_str()).map(String::as_str))
                .collect();
            xref.routes_by_stop
                .insert(stop_id.clone(), route_names.join(","));

            for route_id in route_ids {
                let entry = xref.stops_by_route.entry(route_id.clone()).or_default();
                entry.push_str(stop_id);
                entry.push(',');
            }
        }
        xref
    }

    /// Every route maps to the single queried stop.
    pub fn for_single_stop(stop_id: &str, routes: &[Route]) -> Self {
        let stops_by_route = routes
            .iter()
            .filter_map(|r| r.id.clone())
            .map(|id| (id, format!("{},", stop_id)))
            .collect();
        Self {
            routes_by_stop: HashMap::new(),
            stops_by_route,
        }
    }
}

/// Drop stops past `max` from the tail.
pub fn cap_stops(mut stops: Vec<Stop>, max: usize) -> Vec<Stop> {
    if stops.len() > max {
        warn!(from = stops.len(), to = max, "Cutting stop list");
        stops.truncate(max);
    }
    stops
}

pub struct StopRouteStreamer<'a, L> {
    pub sender: &'a BackoffSender<L>,
    pub authority: &'a TransactionAuthority,
    pub max_stops: usize,
}

impl<L: PeerLink> StopRouteStreamer<'_, L> {
    /// Stream stops, then the routes of the same fetch.
    pub async fn stream_stops(
        &self,
        stops: Vec<Stop>,
        routes: Vec<Route>,
        xref: &CrossReference,
        transaction_id: TransactionId,
    ) -> StreamOutcome {
        let stops = cap_stops(stops, self.max_stops);
        let mut superseded = false;

        for stop in stops {
            if !self.authority.is_current(transaction_id) {
                superseded = true;
                break;
            }
            let id = stop.id.filter(|id| !id.is_empty());
            let name = stop.name.filter(|name| !name.is_empty());
            let (Some(id), Some(name), Some(_)) = (id, name, stop.route_ids) else {
                warn!(transaction_id, "Stop missing id, name or routes. Ending stop list.");
                break;
            };

            let route_list = xref.routes_by_stop.get(&id).cloned().unwrap_or_default();
            debug!(transaction_id, stop_id = %id, %name, %route_list, "Sending stop");
            let message = PeerMessage::Stop {
                transaction_id,
                item: StopItem {
                    stop_id: id,
                    name,
                    position: Position {
                        lat: stop.lat,
                        lon: stop.lon,
                    },
                    route_list,
                    direction: stop.direction,
                },
            };
            if !self.sender.send(&message).await.is_delivered() {
                warn!(transaction_id, "Stop stream stalled");
                return StreamOutcome::Stalled;
            }
        }

        if !self
            .sender
            .send(&PeerMessage::StopsEnd { transaction_id })
            .await
            .is_delivered()
        {
            warn!(transaction_id, "Lost stops terminator");
        }
        info!(transaction_id, superseded, "Stops done. Starting routes.");

        self.stream_routes(routes, &xref.stops_by_route, transaction_id, RouteStream::Nearby)
            .await
    }

    pub async fn stream_routes(
        &self,
        routes: Vec<Route>,
        stops_by_route: &HashMap<CompactString, String>,
        transaction_id: TransactionId,
        stream: RouteStream,
    ) -> StreamOutcome {
        let mut outcome = StreamOutcome::Completed;

        for route in routes {
            if !self.authority.is_current(transaction_id) {
                outcome = StreamOutcome::Superseded;
                break;
            }
            let Some(id) = route.id.clone().filter(|id| !id.is_empty()) else {
                warn!(transaction_id, "Route missing id. Ending route list.");
                break;
            };

            let name = route.display_name();
            let stop_id_list = stops_by_route.get(&id).cloned().unwrap_or_default();
            debug!(transaction_id, route_id = %id, %name, %stop_id_list, "Sending route");
            let message = PeerMessage::Route {
                transaction_id,
                stream,
                item: RouteItem {
                    route_id: id,
                    name,
                    stop_id_list,
                    description: route.description,
                },
            };
            if !self.sender.send(&message).await.is_delivered() {
                warn!(transaction_id, "Route stream stalled");
                return StreamOutcome::Stalled;
            }
        }

        if !self
            .sender
            .send(&PeerMessage::RoutesEnd {
                transaction_id,
                stream,
            })
            .await
            .is_delivered()
        {
            warn!(transaction_id, "Lost routes terminator");
        }
        info!(transaction_id, ?outcome, "Routes done");
        outcome
    }
}
