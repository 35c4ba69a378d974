use crate::metrics::get_metric_contents;
use crate::runtime::Event;
use loopcast_core::control::StatusSnapshot;
use loopcast_core::track::TrackChange;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::{mpsc, watch};
use warp::http::StatusCode;
use warp::{reply, Filter};

pub fn routes(
    events: mpsc::Sender<Event>,
    status: watch::Receiver<StatusSnapshot>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    metrics().or(track_change(events)).or(status_get(status))
}

/// GET /metrics
pub fn metrics() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .map(get_metric_contents)
}

/// POST /v1/track-change
pub fn track_change(
    events: mpsc::Sender<Event>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("v1" / "track-change")
        .and(warp::post())
        .and(json_body())
        .and(with_events(events))
        .and_then(queue_track_change)
}

/// GET /v1/status
pub fn status_get(
    status: watch::Receiver<StatusSnapshot>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("v1" / "status")
        .and(warp::get())
        .and(with_status(status))
        .map(|status: watch::Receiver<StatusSnapshot>| {
            let snapshot = status.borrow().clone();
            reply::json(&snapshot)
        })
}

async fn queue_track_change(
    change: TrackChange,
    events: mpsc::Sender<Event>,
) -> Result<impl warp::Reply, Infallible> {
    let key = change.key();
    match events.send(Event::TrackChanged(change)).await {
        Ok(()) => Ok(reply::with_status(
            reply::json(&json!({ "queued": key })),
            StatusCode::ACCEPTED,
        )),
        Err(_) => Ok(reply::with_status(
            reply::json(&json!({ "message": "engine is not running" })),
            StatusCode::SERVICE_UNAVAILABLE,
        )),
    }
}

fn with_events(
    events: mpsc::Sender<Event>,
) -> impl Filter<Extract = (mpsc::Sender<Event>,), Error = Infallible> + Clone {
    warp::any().map(move || events.clone())
}

fn with_status(
    status: watch::Receiver<StatusSnapshot>,
) -> impl Filter<Extract = (watch::Receiver<StatusSnapshot>,), Error = Infallible> + Clone {
    warp::any().map(move || status.clone())
}

fn json_body() -> impl Filter<Extract = (TrackChange,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(1024 * 16).and(warp::body::json())
}
