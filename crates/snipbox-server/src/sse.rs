//! Server-Sent Events for execution progress

use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use futures_util::stream;
use snipbox::{ExecutionEvent, SequencedEvent, Subscription};

/// Convert a logged event into an SSE frame. The frame id is the event's
/// sequence number so a client can resume with `Last-Event-ID`.
pub fn to_sse_event(event: &SequencedEvent) -> Result<Event, axum::Error> {
    let frame = Event::default()
        .event(event.event.kind())
        .id(event.seq.to_string());
    match &event.event {
        ExecutionEvent::Finished(result) => frame.json_data(result),
        other => frame.json_data(other),
    }
}

/// Stream every remaining event of a request, ending after the `result` frame
pub fn stream_events(
    subscription: Subscription,
    keep_alive: Duration,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next().await?;
        Some((to_sse_event(&event), subscription))
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(keep_alive))
}

