//! Messages exchanged with the peer device.
//!
//! The link carries flat key-value dictionaries. Inbound dictionaries become
//! [`PeerRequest`]s, outbound [`PeerMessage`]s are rendered back into
//! dictionaries right before delivery.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::arrivals::ArrivalStatus;
use crate::error::RequestError;
use crate::location::Position;
use crate::state::TransactionId;

/// Message-type tags shared by both directions of the link.
pub mod tags {
    pub const ARRIVALS: i64 = 0;
    pub const NEARBY_STOPS: i64 = 1;
    pub const NEARBY_ROUTES: i64 = 2;
    pub const LOCATION: i64 = 3;
    pub const ERROR: i64 = 4;
    pub const ROUTES_FOR_STOP: i64 = 5;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&CompactString> for Value {
    fn from(v: &CompactString) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Flat key-value message as carried by the link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dictionary(BTreeMap<String, Value>);

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        match self.0.get(key) {
            Some(Value::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn message_type(&self) -> Option<i64> {
        self.int("messageType")
    }

    pub fn transaction_id(&self) -> Option<i64> {
        self.int("transactionId")
    }

    pub fn items_remaining(&self) -> Option<i64> {
        self.int("itemsRemaining")
    }
}

/// One unit of work in an arrivals request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRef {
    pub stop_id: CompactString,
    pub route_id: CompactString,
}

/// Parse the tab-separated `stopId,routeId` list sent by the peer.
pub fn parse_bus_list(list: &str) -> Vec<BusRef> {
    list.split('\t')
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| match segment.split_once(',') {
            Some((stop, route)) => Some(BusRef {
                stop_id: CompactString::from(stop),
                route_id: CompactString::from(route),
            }),
            None => {
                warn!(segment, "Skipping bus list entry without a route");
                None
            }
        })
        .collect()
}

/// 8-byte little-endian IEEE-754 rendering used for coordinates.
pub fn double_bytes(value: f64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerRequest {
    Arrivals {
        transaction_id: TransactionId,
        buses: Vec<BusRef>,
    },
    NearbyStops {
        transaction_id: TransactionId,
    },
    Location,
    RoutesForStop {
        transaction_id: TransactionId,
        stop_id: CompactString,
    },
}

impl PeerRequest {
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self, RequestError> {
        let tag = dict
            .message_type()
            .ok_or(RequestError::MissingField("messageType"))?;

        let request = match tag {
            tags::ARRIVALS => PeerRequest::Arrivals {
                transaction_id: transaction_field(dict)?,
                buses: parse_bus_list(str_field(dict, "busList")?),
            },
            tags::NEARBY_STOPS => PeerRequest::NearbyStops {
                transaction_id: transaction_field(dict)?,
            },
            tags::LOCATION => PeerRequest::Location,
            tags::ROUTES_FOR_STOP => PeerRequest::RoutesForStop {
                transaction_id: transaction_field(dict)?,
                stop_id: CompactString::from(str_field(dict, "stopId")?),
            },
            other => return Err(RequestError::UnknownType(other)),
        };
        Ok(request)
    }

    /// Transaction claimed by this request, if it takes part in cancellation.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            PeerRequest::Arrivals { transaction_id, .. }
            | PeerRequest::NearbyStops { transaction_id }
            | PeerRequest::RoutesForStop { transaction_id, .. } => Some(*transaction_id),
            PeerRequest::Location => None,
        }
    }
}

fn transaction_field(dict: &Dictionary) -> Result<TransactionId, RequestError> {
    let raw = dict
        .transaction_id()
        .ok_or(RequestError::MissingField("transactionId"))?;
    TransactionId::try_from(raw).map_err(|_| RequestError::WrongType("transactionId"))
}

fn str_field<'a>(dict: &'a Dictionary, key: &'static str) -> Result<&'a str, RequestError> {
    match dict.get(key) {
        Some(Value::Str(v)) => Ok(v.as_str()),
        Some(_) => Err(RequestError::WrongType(key)),
        None => Err(RequestError::MissingField(key)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalItem {
    pub stop_id: CompactString,
    pub route_id: CompactString,
    pub trip_id: CompactString,
    pub arrival_delta: i64,
    pub arrival_delta_string: String,
    pub status: ArrivalStatus,
    pub scheduled: String,
    pub predicted: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopItem {
    pub stop_id: CompactString,
    pub name: String,
    pub position: Position,
    pub route_list: String,
    pub direction: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteItem {
    pub route_id: CompactString,
    pub name: String,
    pub stop_id_list: String,
    pub description: String,
}

/// Which of the two route streams a route message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStream {
    Nearby,
    ForStop,
}

impl RouteStream {
    pub fn tag(self) -> i64 {
        match self {
            RouteStream::Nearby => tags::NEARBY_ROUTES,
            RouteStream::ForStop => tags::ROUTES_FOR_STOP,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Arrival {
        transaction_id: TransactionId,
        item: ArrivalItem,
    },
    ArrivalsEnd {
        transaction_id: TransactionId,
    },
    Stop {
        transaction_id: TransactionId,
        item: StopItem,
    },
    StopsEnd {
        transaction_id: TransactionId,
    },
    Route {
        transaction_id: TransactionId,
        stream: RouteStream,
        item: RouteItem,
    },
    RoutesEnd {
        transaction_id: TransactionId,
        stream: RouteStream,
    },
    Location(Position),
    Error {
        description: Option<String>,
    },
}

impl PeerMessage {
    pub fn to_dictionary(&self) -> Dictionary {
        match self {
            PeerMessage::Arrival {
                transaction_id,
                item,
            } => Dictionary::new()
                .with("stopId", &item.stop_id)
                .with("routeId", &item.route_id)
                .with("tripId", &item.trip_id)
                .with("arrivalDelta", item.arrival_delta)
                .with("arrivalDeltaString", item.arrival_delta_string.as_str())
                .with("itemsRemaining", 1i64)
                .with("transactionId", *transaction_id)
                .with("arrivalCode", item.status.code().to_string())
                .with("scheduled", item.scheduled.as_str())
                .with("predicted", item.predicted.as_str())
                .with("messageType", tags::ARRIVALS),
            PeerMessage::ArrivalsEnd { transaction_id } => Dictionary::new()
                .with("stopId", "")
                .with("routeId", "")
                .with("tripId", "")
                .with("arrivalDelta", 0i64)
                .with("arrivalDeltaString", "")
                .with("itemsRemaining", 0i64)
                .with("transactionId", *transaction_id)
                .with("arrivalCode", ArrivalStatus::ScheduledOnly.code().to_string())
                .with("scheduled", "")
                .with("predicted", "")
                .with("messageType", tags::ARRIVALS),
            PeerMessage::Stop {
                transaction_id,
                item,
            } => Dictionary::new()
                .with("stopId", &item.stop_id)
                .with("stopName", item.name.as_str())
                .with("lat", double_bytes(item.position.lat))
                .with("lon", double_bytes(item.position.lon))
                .with("itemsRemaining", 1i64)
                .with("routeListString", item.route_list.as_str())
                .with("direction", item.direction.as_str())
                .with("transactionId", *transaction_id)
                .with("messageType", tags::NEARBY_STOPS),
            PeerMessage::StopsEnd { transaction_id } => Dictionary::new()
                .with("stopId", "")
                .with("stopName", "")
                .with("itemsRemaining", 0i64)
                .with("routeListString", "")
                .with("direction", "")
                .with("transactionId", *transaction_id)
                .with("messageType", tags::NEARBY_STOPS),
            PeerMessage::Route {
                transaction_id,
                stream,
                item,
            } => Dictionary::new()
                .with("routeId", &item.route_id)
                .with("routeName", item.name.as_str())
                .with("itemsRemaining", 1i64)
                .with("stopIdList", item.stop_id_list.as_str())
                .with("description", item.description.as_str())
                .with("transactionId", *transaction_id)
                .with("messageType", stream.tag()),
            PeerMessage::RoutesEnd {
                transaction_id,
                stream,
            } => Dictionary::new()
                .with("routeId", "")
                .with("routeName", "")
                .with("itemsRemaining", 0i64)
                .with("stopIdList", "")
                .with("description", "")
                .with("transactionId", *transaction_id)
                .with("messageType", stream.tag()),
            PeerMessage::Location(position) => Dictionary::new()
                .with("lat", double_bytes(position.lat))
                .with("lon", double_bytes(position.lon))
                .with("messageType", tags::LOCATION),
            PeerMessage::Error { description } => {
                let dict = Dictionary::new().with("messageType", tags::ERROR);
                match description {
                    Some(text) => dict.with("description", text.as_str()),
                    None => dict,
                }
            }
        }
    }

    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Arrival { .. } => "arrival",
            PeerMessage::ArrivalsEnd { .. } => "arrivals-end",
            PeerMessage::Stop { .. } => "stop",
            PeerMessage::StopsEnd { .. } => "stops-end",
            PeerMessage::Route { .. } => "route",
            PeerMessage::RoutesEnd { .. } => "routes-end",
            PeerMessage::Location(_) => "location",
            PeerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_list_parses_in_order() {
        let buses = parse_bus_list("100,10\t200,20");
        assert_eq!(
            buses,
            vec![
                BusRef {
                    stop_id: "100".into(),
                    route_id: "10".into()
                },
                BusRef {
                    stop_id: "200".into(),
                    route_id: "20".into()
                },
            ]
        );
    }

    #[test]
    fn empty_bus_list_is_empty() {
        assert!(parse_bus_list("").is_empty());
        assert!(parse_bus_list("\t\t").is_empty());
    }

    #[test]
    fn bus_list_skips_entries_without_route() {
        let buses = parse_bus_list("1_100\t1_200,1_44");
        assert_eq!(buses.len(), 1);
        assert_eq!(buses[0].stop_id, "1_200");
        assert_eq!(buses[0].route_id, "1_44");
    }

    #[test]
    fn doubles_are_eight_little_endian_bytes() {
        let bytes = double_bytes(47.6062);
        assert_eq!(bytes.len(), 8);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        assert_eq!(f64::from_le_bytes(raw), 47.6062);
        assert_eq!(double_bytes(1.0), vec![0, 0, 0, 0, 0, 0, 0xf0, 0x3f]);
    }

    #[test]
    fn arrivals_request_from_dictionary() {
        let dict = Dictionary::new()
            .with("messageType", tags::ARRIVALS)
            .with("transactionId", 42i64)
            .with("busList", "1_75403,1_100264");
        let request = PeerRequest::from_dictionary(&dict).unwrap();
        assert_eq!(
            request,
            PeerRequest::Arrivals {
                transaction_id: 42,
                buses: vec![BusRef {
                    stop_id: "1_75403".into(),
                    route_id: "1_100264".into()
                }],
            }
        );
    }

    #[test]
    fn routes_for_stop_requires_stop_id() {
        let dict = Dictionary::new()
            .with("messageType", tags::ROUTES_FOR_STOP)
            .with("transactionId", 3i64);
        assert!(matches!(
            PeerRequest::from_dictionary(&dict),
            Err(RequestError::MissingField("stopId"))
        ));
    }

    #[test]
    fn negative_transaction_id_is_rejected() {
        let dict = Dictionary::new()
            .with("messageType", tags::NEARBY_STOPS)
            .with("transactionId", -1i64);
        assert!(matches!(
            PeerRequest::from_dictionary(&dict),
            Err(RequestError::WrongType("transactionId"))
        ));
    }

    #[test]
    fn unknown_tag_is_reported() {
        let dict = Dictionary::new().with("messageType", 9i64);
        assert!(matches!(
            PeerRequest::from_dictionary(&dict),
            Err(RequestError::UnknownType(9))
        ));
    }

    #[test]
    fn error_message_omits_missing_description() {
        let dict = PeerMessage::Error { description: None }.to_dictionary();
        assert_eq!(dict.message_type(), Some(tags::ERROR));
        assert!(dict.get("description").is_none());
    }

    #[test]
    fn dictionary_json_keeps_value_kinds() {
        let dict = PeerMessage::Location(Position { lat: 1.0, lon: 2.0 }).to_dictionary();
        let json = serde_json::to_string(&dict).unwrap();
        let back: Dictionary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dict);
        assert_eq!(back.bytes("lat").map(|b| b.len()), Some(8));
    }
}
