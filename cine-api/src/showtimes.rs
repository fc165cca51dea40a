use std::convert::Infallible;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures_util::stream::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/showtimes/{showtime_id}/stream", get(seat_stream))
}

/// Seat-map changes for one showtime; clients re-render on each event.
async fn seat_stream(
    State(state): State<AppState>,
    Path(showtime_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.ctx.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result| async move {
        match result {
            Ok(event) if event.showtime_id() == Some(showtime_id) => {
                match serde_json::to_string(&event) {
                    Ok(data) => Some(Ok(Event::default().event(event.name()).data(data))),
                    Err(e) => {
                        tracing::warn!("Dropping unserializable {} event: {}", event.name(), e);
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => {
                // Lagged receiver; the client resyncs from availability
                tracing::debug!("Seat stream for {} skipped events: {}", showtime_id, e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
