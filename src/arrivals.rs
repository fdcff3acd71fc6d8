//! Arrival streaming.
//!
//! Walks the requested buses in order. For each bus the stop's arrivals are
//! resolved (once per stop per transaction), filtered to the bus's route and
//! sent one message at a time, each send gated on the previous delivery.
//! Every bus ends with a terminator message.

use chrono::DateTime;
use chrono_tz::Tz;
use compact_str::CompactString;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backoff::BackoffSender;
use crate::error::RelayError;
use crate::fetch::{HttpClient, ObaEndpoints, ResilientFetcher};
use crate::link::PeerLink;
use crate::message::{ArrivalItem, BusRef, PeerMessage};
use crate::oba_types::{ArrivalAndDeparture, ArrivalBoard, parse_arrivals};
use crate::state::{TransactionAuthority, TransactionId};

const SCHEDULE_TOLERANCE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalStatus {
    ScheduledOnly,
    Late,
    Early,
    OnTime,
}

impl ArrivalStatus {
    pub fn code(self) -> char {
        match self {
            ArrivalStatus::ScheduledOnly => 's',
            ArrivalStatus::Late => 'l',
            ArrivalStatus::Early => 'e',
            ArrivalStatus::OnTime => 'o',
        }
    }

    pub fn classify(scheduled: i64, predicted: i64) -> Self {
        if predicted == 0 {
            return ArrivalStatus::ScheduledOnly;
        }
        let drift = predicted - scheduled;
        if drift > SCHEDULE_TOLERANCE_MS {
            ArrivalStatus::Late
        } else if drift < -SCHEDULE_TOLERANCE_MS {
            ArrivalStatus::Early
        } else {
            ArrivalStatus::OnTime
        }
    }
}

/// `[-]m:ss`, or "Now" while less than a minute away either side.
pub fn format_delta(delta_ms: i64) -> String {
    let magnitude = delta_ms.unsigned_abs();
    let mut minutes = magnitude / 60_000;
    if minutes == 0 {
        return "Now".to_string();
    }
    let mut seconds = (magnitude % 60_000 + 500) / 1_000;
    if seconds == 60 {
        minutes += 1;
        seconds = 0;
    }
    let sign = if delta_ms < 0 { "-" } else { "" };
    format!("{}{}:{:02}", sign, minutes, seconds)
}

/// Wall-clock rendering such as "3:05 PM".
pub fn clock_string(epoch_ms: i64, tz: Tz) -> String {
    match DateTime::from_timestamp_millis(epoch_ms) {
        Some(t) => t.with_timezone(&tz).format("%-I:%M %p").to_string(),
        None => "n/a".to_string(),
    }
}

/// Derive the peer-facing fields for one arrival.
pub fn render_arrival(
    bus: &BusRef,
    arrival: &ArrivalAndDeparture,
    current_time: i64,
    tz: Tz,
) -> ArrivalItem {
    let scheduled = arrival.scheduled_arrival_time;
    let predicted = arrival.predicted_arrival_time;
    let status = ArrivalStatus::classify(scheduled, predicted);

    let (effective, predicted_string) = match status {
        ArrivalStatus::ScheduledOnly => (scheduled, "n/a".to_string()),
        _ => (predicted, clock_string(predicted, tz)),
    };
    let arrival_delta = effective - current_time;

    ArrivalItem {
        stop_id: bus.stop_id.clone(),
        route_id: bus.route_id.clone(),
        trip_id: arrival.trip_id.clone(),
        arrival_delta,
        arrival_delta_string: format_delta(arrival_delta),
        status,
        scheduled: clock_string(scheduled, tz),
        predicted: predicted_string,
    }
}

/// Raw arrivals payloads for one transaction, keyed by stop id.
#[derive(Debug, Default)]
pub struct ResponseCache {
    bodies: HashMap<CompactString, Arc<str>>,
}

impl ResponseCache {
    pub fn get(&self, stop_id: &str) -> Option<Arc<str>> {
        self.bodies.get(stop_id).cloned()
    }

    pub fn insert(&mut self, stop_id: CompactString, body: String) -> Arc<str> {
        let body: Arc<str> = Arc::from(body);
        self.bodies.insert(stop_id, body.clone());
        body
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

/// Destructive, left-to-right view of one stop's arrivals.
#[derive(Debug)]
pub struct ArrivalCursor {
    current_time: i64,
    remaining: VecDeque<ArrivalAndDeparture>,
}

impl ArrivalCursor {
    pub fn new(board: ArrivalBoard) -> Self {
        Self {
            current_time: board.current_time,
            remaining: board.arrivals.into(),
        }
    }

    /// Pop entries until one for `route_id` turns up.
    pub fn next_for_route(&mut self, route_id: &str) -> Option<ArrivalAndDeparture> {
        while let Some(arrival) = self.remaining.pop_front() {
            if arrival.route_id.as_deref() == Some(route_id) {
                return Some(arrival);
            }
        }
        None
    }
}

/// How an arrivals transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Superseded,
    Stalled,
}

enum Phase {
    Fetching(BusRef),
    Streaming { bus: BusRef, cursor: ArrivalCursor },
    Done(StreamOutcome),
}

pub struct ArrivalStreamer<'a, L, H> {
    pub sender: &'a BackoffSender<L>,
    pub fetcher: &'a ResilientFetcher<H>,
    pub authority: &'a TransactionAuthority,
    pub endpoints: &'a ObaEndpoints,
    pub timezone: Tz,
}

impl<L: PeerLink, H: HttpClient> ArrivalStreamer<'_, L, H> {
    /// Stream arrivals for `buses`. Fetch and parse failures abandon the
    /// transaction and are returned for reporting.
    pub async fn stream(
        &self,
        buses: Vec<BusRef>,
        transaction_id: TransactionId,
    ) -> Result<StreamOutcome, RelayError> {
        let mut cache = ResponseCache::default();
        let mut queue = buses.into_iter();
        let mut phase = match queue.next() {
            Some(bus) => Phase::Fetching(bus),
            None => Phase::Done(StreamOutcome::Completed),
        };

        loop {
            phase = match phase {
                Phase::Fetching(bus) => {
                    if !self.authority.is_current(transaction_id) {
                        self.finish_bus(&bus, transaction_id).await;
                        Phase::Done(StreamOutcome::Superseded)
                    } else {
                        let body = self.resolve(&mut cache, &bus.stop_id).await?;
                        let board = parse_arrivals(&body)?;
                        debug!(
                            stop_id = %bus.stop_id,
                            route_id = %bus.route_id,
                            arrivals = board.arrivals.len(),
                            "Streaming arrivals"
                        );
                        Phase::Streaming {
                            bus,
                            cursor: ArrivalCursor::new(board),
                        }
                    }
                }
                Phase::Streaming { bus, mut cursor } => {
                    let next = cursor.next_for_route(&bus.route_id);
                    let current = self.authority.is_current(transaction_id);
                    match next {
                        Some(arrival) if current => {
                            let item =
                                render_arrival(&bus, &arrival, cursor.current_time, self.timezone);
                            let message = PeerMessage::Arrival {
                                transaction_id,
                                item,
                            };
                            if self.sender.send(&message).await.is_delivered() {
                                Phase::Streaming { bus, cursor }
                            } else {
                                warn!(transaction_id, stop_id = %bus.stop_id, "Arrival stream stalled");
                                Phase::Done(StreamOutcome::Stalled)
                            }
                        }
                        _ => {
                            self.finish_bus(&bus, transaction_id).await;
                            if !current {
                                Phase::Done(StreamOutcome::Superseded)
                            } else {
                                match queue.next() {
                                    Some(bus) => Phase::Fetching(bus),
                                    None => Phase::Done(StreamOutcome::Completed),
                                }
                            }
                        }
                    }
                }
                Phase::Done(outcome) => {
                    info!(transaction_id, ?outcome, stops_fetched = cache.len(), "Arrivals done");
                    return Ok(outcome);
                }
            };
        }
    }

    async fn resolve(
        &self,
        cache: &mut ResponseCache,
        stop_id: &CompactString,
    ) -> Result<Arc<str>, RelayError> {
        if let Some(body) = cache.get(stop_id) {
            debug!(stop_id = %stop_id, "Reusing cached arrivals");
            return Ok(body);
        }
        let url = self.endpoints.arrivals_for_stop(stop_id);
        let body = self
            .fetcher
            .fetch(&url)
            .await
            .map_err(RelayError::FetchExhausted)?;
        Ok(cache.insert(stop_id.clone(), body))
    }

    async fn finish_bus(&self, bus: &BusRef, transaction_id: TransactionId) {
        let end = PeerMessage::ArrivalsEnd { transaction_id };
        if !self.sender.send(&end).await.is_delivered() {
            warn!(transaction_id, stop_id = %bus.stop_id, "Lost arrivals terminator");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrival(route: &str, scheduled: i64, predicted: i64) -> ArrivalAndDeparture {
        ArrivalAndDeparture {
            route_id: Some(route.into()),
            trip_id: "1_trip".into(),
            scheduled_arrival_time: scheduled,
            predicted_arrival_time: predicted,
        }
    }

    #[test]
    fn status_thresholds() {
        let t = 1_700_000_000_000;
        assert_eq!(ArrivalStatus::classify(t, 0), ArrivalStatus::ScheduledOnly);
        assert_eq!(ArrivalStatus::classify(t, t + 60_000), ArrivalStatus::OnTime);
        assert_eq!(ArrivalStatus::classify(t, t + 60_001), ArrivalStatus::Late);
        assert_eq!(ArrivalStatus::classify(t, t - 60_000), ArrivalStatus::OnTime);
        assert_eq!(ArrivalStatus::classify(t, t - 60_001), ArrivalStatus::Early);
        assert_eq!(ArrivalStatus::classify(t, t), ArrivalStatus::OnTime);
    }

    #[test]
    fn status_codes() {
        let codes: String = [
            ArrivalStatus::ScheduledOnly,
            ArrivalStatus::Late,
            ArrivalStatus::Early,
            ArrivalStatus::OnTime,
        ]
        .iter()
        .map(|s| s.code())
        .collect();
        assert_eq!(codes, "sleo");
    }

    #[test]
    fn delta_rendering() {
        assert_eq!(format_delta(0), "Now");
        assert_eq!(format_delta(59_999), "Now");
        assert_eq!(format_delta(-59_999), "Now");
        assert_eq!(format_delta(60_000), "1:00");
        assert_eq!(format_delta(125_000), "2:05");
        assert_eq!(format_delta(-125_000), "-2:05");
        assert_eq!(format_delta(600_400), "10:00");
        assert_eq!(format_delta(119_600), "2:00");
    }

    #[test]
    fn clock_in_configured_zone() {
        // 2023-11-14T22:13:20Z
        let t = 1_700_000_000_000;
        assert_eq!(clock_string(t, chrono_tz::America::Los_Angeles), "2:13 PM");
        assert_eq!(clock_string(t, chrono_tz::UTC), "10:13 PM");
    }

    #[test]
    fn scheduled_only_uses_schedule_for_delta() {
        let bus = BusRef {
            stop_id: "1_1".into(),
            route_id: "1_100".into(),
        };
        let now = 1_700_000_000_000;
        let item = render_arrival(
            &bus,
            &arrival("1_100", now + 300_000, 0),
            now,
            chrono_tz::UTC,
        );
        assert_eq!(item.status, ArrivalStatus::ScheduledOnly);
        assert_eq!(item.arrival_delta, 300_000);
        assert_eq!(item.arrival_delta_string, "5:00");
        assert_eq!(item.predicted, "n/a");
    }

    #[test]
    fn predicted_drives_delta_and_may_be_negative() {
        let bus = BusRef {
            stop_id: "1_1".into(),
            route_id: "1_100".into(),
        };
        let now = 1_700_000_000_000;
        let item = render_arrival(
            &bus,
            &arrival("1_100", now, now - 90_000),
            now,
            chrono_tz::UTC,
        );
        assert_eq!(item.status, ArrivalStatus::Early);
        assert_eq!(item.arrival_delta, -90_000);
        assert_eq!(item.arrival_delta_string, "-1:30");
        assert_eq!(item.predicted, "10:11 PM");
    }

    #[test]
    fn cursor_skips_other_routes_destructively() {
        let mut cursor = ArrivalCursor::new(ArrivalBoard {
            current_time: 1,
            arrivals: vec![
                arrival("1_8", 10, 0),
                arrival("1_100", 20, 0),
                arrival("1_8", 30, 0),
                arrival("1_100", 40, 0),
            ],
        });
        assert_eq!(
            cursor.next_for_route("1_100").map(|a| a.scheduled_arrival_time),
            Some(20)
        );
        assert_eq!(
            cursor.next_for_route("1_100").map(|a| a.scheduled_arrival_time),
            Some(40)
        );
        assert!(cursor.next_for_route("1_100").is_none());
        assert!(cursor.next_for_route("1_8").is_none());
    }

    #[test]
    fn cache_shares_bodies() {
        let mut cache = ResponseCache::default();
        assert!(cache.is_empty());
        cache.insert("1_1".into(), "{}".into());
        assert_eq!(cache.get("1_1").as_deref(), Some("{}"));
        assert!(cache.get("1_2").is_none());
        assert_eq!(cache.len(), 1);
    }
}
