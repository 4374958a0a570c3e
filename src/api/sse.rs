//! Server-Sent Events for streamed chat replies

use crate::router::TurnEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{SecondsFormat, Utc};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Stream a turn's events as `{content, timestamp, is_final}` records
pub fn turn_stream(
    events: mpsc::Receiver<TurnEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let records = ReceiverStream::new(events).map(|event| Ok(turn_event_to_axum(event)));

    Sse::new(records).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn turn_event_to_axum(event: TurnEvent) -> Event {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let data = match event {
        TurnEvent::Delta(content) => json!({
            "content": content,
            "timestamp": timestamp,
            "is_final": false
        }),
        TurnEvent::Fallback {
            text,
            replaces_previous: true,
        } => json!({
            "content": text,
            "timestamp": timestamp,
            "is_final": false,
            "replaces_previous": true
        }),
        TurnEvent::Fallback { text, .. } => json!({
            "content": text,
            "timestamp": timestamp,
            "is_final": false
        }),
        TurnEvent::Finished => json!({
            "content": "",
            "timestamp": timestamp,
            "is_final": true
        }),
    };

    Event::default().data(data.to_string())
}
