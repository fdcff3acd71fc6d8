use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use crate::state::RelayState;

/// GET /status
pub fn status_route(
    state: Arc<RelayState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());

    warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(state_filter)
        .map(|state: Arc<RelayState>| warp::reply::json(&state.snapshot()))
}
