use compact_str::CompactString;
use serde::{Deserialize, Deserializer};

use crate::error::RelayError;

/// Treat an explicit `null` like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// arrivals-and-departures-for-stop

#[derive(Debug, Deserialize)]
pub struct ArrivalsResponse {
    #[serde(rename = "currentTime")]
    pub current_time: Option<i64>,
    pub data: Option<ArrivalsData>,
}

#[derive(Debug, Deserialize)]
pub struct ArrivalsData {
    pub entry: Option<ArrivalsEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ArrivalsEntry {
    #[serde(rename = "arrivalsAndDepartures", default, deserialize_with = "null_as_default")]
    pub arrivals_and_departures: Vec<ArrivalAndDeparture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArrivalAndDeparture {
    #[serde(rename = "routeId")]
    pub route_id: Option<CompactString>,
    #[serde(rename = "tripId", default, deserialize_with = "null_as_default")]
    pub trip_id: CompactString,
    #[serde(rename = "scheduledArrivalTime", default, deserialize_with = "null_as_default")]
    pub scheduled_arrival_time: i64,
    // 0 when the agency has no realtime prediction
    #[serde(rename = "predictedArrivalTime", default, deserialize_with = "null_as_default")]
    pub predicted_arrival_time: i64,
}

// stops-for-location and stop/{id}

#[derive(Debug, Deserialize)]
pub struct StopsForLocationResponse {
    pub data: Option<StopsForLocationData>,
}

#[derive(Debug, Deserialize)]
pub struct StopsForLocationData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub list: Vec<Stop>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub references: References,
}

#[derive(Debug, Deserialize)]
pub struct StopDetailResponse {
    pub data: Option<StopDetailData>,
}

#[derive(Debug, Deserialize)]
pub struct StopDetailData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub references: References,
}

#[derive(Debug, Default, Deserialize)]
pub struct References {
    #[serde(default, deserialize_with = "null_as_default")]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Stop {
    pub id: Option<CompactString>,
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub lat: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub lon: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub direction: String,
    #[serde(rename = "routeIds")]
    pub route_ids: Option<Vec<CompactString>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Route {
    pub id: Option<CompactString>,
    #[serde(rename = "shortName", default, deserialize_with = "null_as_default")]
    pub short_name: String,
    #[serde(rename = "longName", default, deserialize_with = "null_as_default")]
    pub long_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

impl Route {
    /// Short name if present, else long name, uppercased. "Unknown" if both
    /// are empty.
    pub fn display_name(&self) -> String {
        let name = if self.short_name.is_empty() {
            &self.long_name
        } else {
            &self.short_name
        };
        if name.is_empty() {
            "Unknown".to_string()
        } else {
            name.to_uppercase()
        }
    }
}

/// Arrivals for one stop with the server clock used as the delta baseline.
#[derive(Debug, Clone)]
pub struct ArrivalBoard {
    pub current_time: i64,
    pub arrivals: Vec<ArrivalAndDeparture>,
}

pub fn parse_arrivals(body: &str) -> Result<ArrivalBoard, RelayError> {
    let response: ArrivalsResponse = serde_json::from_str(body).map_err(|e| malformed("arrivals", e))?;
    let current_time = match response.current_time {
        Some(t) if t != 0 => t,
        _ => return Err(malformed("arrivals", "missing currentTime")),
    };
    let entry = response
        .data
        .and_then(|d| d.entry)
        .ok_or_else(|| malformed("arrivals", "missing data.entry"))?;
    Ok(ArrivalBoard {
        current_time,
        arrivals: entry.arrivals_and_departures,
    })
}

pub fn parse_stops_for_location(body: &str) -> Result<StopsForLocationData, RelayError> {
    let response: StopsForLocationResponse =
        serde_json::from_str(body).map_err(|e| malformed("stops-for-location", e))?;
    response
        .data
        .ok_or_else(|| malformed("stops-for-location", "missing data"))
}

pub fn parse_stop_routes(body: &str) -> Result<Vec<Route>, RelayError> {
    let response: StopDetailResponse = serde_json::from_str(body).map_err(|e| malformed("stop", e))?;
    response
        .data
        .map(|d| d.references.routes)
        .ok_or_else(|| malformed("stop", "missing data"))
}

fn malformed(resource: &'static str, reason: impl ToString) -> RelayError {
    RelayError::MalformedResponse {
        resource,
        reason: reason.to_string(),
    }
}
