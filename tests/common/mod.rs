//! In-memory stand-ins for the peer link, the upstream API and the position
//! source.

#![allow(dead_code)]

use serde_json::{Value as Json, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use busrelay::error::{FetchError, LinkError, LocationError};
use busrelay::fetch::HttpClient;
use busrelay::link::PeerLink;
use busrelay::location::{LocationProvider, Position};
use busrelay::message::Dictionary;
use busrelay::{Coordinator, RelayConfig, RelayState};

type Hook = Box<dyn FnOnce() + Send>;
type Filter = Arc<dyn Fn(&Dictionary) -> bool + Send + Sync>;

#[derive(Default)]
struct LinkInner {
    sent: Mutex<Vec<Dictionary>>,
    attempts: Mutex<usize>,
    reject_all: AtomicBool,
    reject_if: Mutex<Option<Filter>>,
    hooks: Mutex<Vec<(usize, Hook)>>,
}

/// Accepts every message and records it, unless told to reject.
#[derive(Clone, Default)]
pub struct RecordingLink {
    inner: Arc<LinkInner>,
}

impl RecordingLink {
    pub fn sent(&self) -> Vec<Dictionary> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.inner.attempts.lock().unwrap()
    }

    pub fn reject_all(&self) {
        self.inner.reject_all.store(true, Ordering::SeqCst);
    }

    /// Reject every attempt at a message matching `filter`.
    pub fn reject_if(&self, filter: impl Fn(&Dictionary) -> bool + Send + Sync + 'static) {
        *self.inner.reject_if.lock().unwrap() = Some(Arc::new(filter));
    }

    /// Run `hook` right after the `n`-th message is accepted.
    pub fn after_delivery(&self, n: usize, hook: impl FnOnce() + Send + 'static) {
        self.inner.hooks.lock().unwrap().push((n, Box::new(hook)));
    }
}

impl PeerLink for RecordingLink {
    async fn deliver(&self, dict: &Dictionary) -> Result<(), LinkError> {
        *self.inner.attempts.lock().unwrap() += 1;
        let filter = self.inner.reject_if.lock().unwrap().clone();
        let rejected = filter.is_some_and(|f| (*f)(dict));
        if rejected || self.inner.reject_all.load(Ordering::SeqCst) {
            return Err(LinkError::Rejected {
                receipt: 0,
                reason: "not connected".into(),
            });
        }

        let delivered = {
            let mut sent = self.inner.sent.lock().unwrap();
            sent.push(dict.clone());
            sent.len()
        };
        let due: Vec<Hook> = {
            let mut hooks = self.inner.hooks.lock().unwrap();
            let (due, keep): (Vec<_>, Vec<_>) =
                hooks.drain(..).partition(|(n, _)| *n == delivered);
            *hooks = keep;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        for hook in due {
            hook();
        }
        Ok(())
    }
}

#[derive(Default)]
struct HttpInner {
    routes: Mutex<Vec<(String, String)>>,
    calls: Mutex<Vec<String>>,
}

/// Serves canned bodies for URLs containing a registered fragment; every
/// other URL answers 503.
#[derive(Clone, Default)]
pub struct FakeHttp {
    inner: Arc<HttpInner>,
}

impl FakeHttp {
    pub fn respond(&self, fragment: impl Into<String>, body: impl Into<String>) {
        self.inner
            .routes
            .lock()
            .unwrap()
            .push((fragment.into(), body.into()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, fragment: &str) -> usize {
        self.calls().iter().filter(|u| u.contains(fragment)).count()
    }
}

impl HttpClient for FakeHttp {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        self.inner.calls.lock().unwrap().push(url.to_string());
        let routes = self.inner.routes.lock().unwrap();
        routes
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, body)| body.clone())
            .ok_or(FetchError::Status(503))
    }
}

#[derive(Clone, Default)]
pub struct FakeLocation {
    pub fix: Option<Position>,
    /// Never answer, leaving the relay's own timeout to fire.
    pub hang: bool,
}

impl LocationProvider for FakeLocation {
    async fn current_position(
        &self,
        _timeout: Duration,
        _max_age: Duration,
    ) -> Result<Position, LocationError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.fix.ok_or(LocationError::Unavailable)
    }
}

pub type TestRelay = Coordinator<RecordingLink, FakeHttp, FakeLocation>;

pub struct Harness {
    pub relay: Arc<TestRelay>,
    pub link: RecordingLink,
    pub http: FakeHttp,
    pub state: Arc<RelayState>,
}

pub fn harness(fix: Option<Position>) -> Harness {
    harness_with(FakeLocation { fix, hang: false })
}

pub fn harness_with(location: FakeLocation) -> Harness {
    let link = RecordingLink::default();
    let http = FakeHttp::default();
    let state = Arc::new(RelayState::new());
    let config = RelayConfig {
        api_key: "TEST".into(),
        timezone: chrono_tz::UTC,
        ..RelayConfig::default()
    };
    let relay = Arc::new(Coordinator::new(
        config,
        link.clone(),
        http.clone(),
        location,
        state.clone(),
    ));
    Harness {
        relay,
        link,
        http,
        state,
    }
}

pub const NOW: i64 = 1_700_000_000_000;

pub fn arrivals_url(stop_id: &str) -> String {
    format!("arrivals-and-departures-for-stop/{}.json", stop_id)
}

pub fn stop_url(stop_id: &str) -> String {
    format!("/stop/{}.json", stop_id)
}

pub const NEARBY_URL: &str = "stops-for-location.json";

/// (route id, trip id, scheduled, predicted)
pub fn arrivals_body(entries: &[(&str, &str, i64, i64)]) -> String {
    let list: Vec<Json> = entries
        .iter()
        .map(|(route, trip, scheduled, predicted)| {
            json!({
                "routeId": route,
                "tripId": trip,
                "scheduledArrivalTime": scheduled,
                "predictedArrivalTime": predicted,
            })
        })
        .collect();
    json!({
        "currentTime": NOW,
        "data": {"entry": {"arrivalsAndDepartures": list}}
    })
    .to_string()
}

pub fn stop_json(id: &str, name: &str, routes: &[&str]) -> Json {
    json!({
        "id": id,
        "name": name,
        "lat": 47.6097,
        "lon": -122.3331,
        "direction": "N",
        "routeIds": routes,
    })
}

pub fn route_json(id: &str, short: &str, long: &str) -> Json {
    json!({
        "id": id,
        "shortName": short,
        "longName": long,
        "description": format!("{} description", id),
    })
}

pub fn nearby_body(stops: Vec<Json>, routes: Vec<Json>) -> String {
    json!({"data": {"list": stops, "references": {"routes": routes}}}).to_string()
}

pub fn stop_detail_body(routes: Vec<Json>) -> String {
    json!({"data": {"references": {"routes": routes}}}).to_string()
}

pub fn of_type(sent: &[Dictionary], message_type: i64) -> Vec<Dictionary> {
    sent.iter()
        .filter(|d| d.message_type() == Some(message_type))
        .cloned()
        .collect()
}

pub fn is_terminator(dict: &Dictionary) -> bool {
    dict.items_remaining() == Some(0)
}
