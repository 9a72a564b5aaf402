//! Server-sent event stream of state changes.
//!
//! Each connection subscribes to the state store. The first event is the
//! current record, then one `status` event per committed change and one
//! `payload` event per captured advertisement. The subscription is dropped
//! with the connection.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use beaconsync_core::StateEvent;
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::state::SharedState;

/// SSE event name for `event`.
#[must_use]
pub const fn event_name(event: &StateEvent) -> &'static str {
    match event {
        StateEvent::StatusChanged(_) => "status",
        StateEvent::PayloadReceived { .. } => "payload",
    }
}

fn to_sse(event: &StateEvent) -> Event {
    let sse = Event::default().event(event_name(event));
    match sse.json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(error = %e, "Could not encode state event");
            Event::default().event("error").data(e.to_string())
        }
    }
}

/// Stream state events.
#[utoipa::path(
    get,
    path = "/api/events",
    tag = "relay",
    operation_id = "streamEvents",
    summary = "Stream state changes",
    description = "Server-sent events. Starts with a `status` event carrying the \
        current cycle record, then one `status` event per committed change and \
        one `payload` event (lowercase hex) per captured advertisement.",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String)
    )
)]
pub async fn stream_events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let store = state.cycle_state();
    let subscription = store.subscribe();
    debug!(id = subscription.id(), subscribers = store.subscriber_count(), "Event stream opened");

    let initial = StateEvent::StatusChanged(store.current());
    let updates = UnboundedReceiverStream::new(subscription.into_receiver());
    let events = stream::once(async move { initial })
        .chain(updates)
        .map(|event| Ok(to_sse(&event)));

    Sse::new(events).keep_alive(KeepAlive::default())
}
