use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::job::{ProgressEvent, INTERRUPTED_MESSAGE};

/// Yield events from `rx` up to and including the first terminal one. If the
/// sender side goes away first, a synthetic failure closes the stream so a
/// client never waits on a stream without an ending.
pub fn progress_stream(rx: mpsc::Receiver<ProgressEvent>) -> impl Stream<Item = ProgressEvent> {
    stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Some(event) if event.is_terminal() => Some((event, None)),
            Some(event) => Some((event, Some(rx))),
            None => {
                warn!("Progress channel closed without a terminal event");
                Some((ProgressEvent::failure(INTERRUPTED_MESSAGE), None))
            }
        }
    })
}

fn to_sse_event(event: &ProgressEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(sse) => sse,
        Err(err) => {
            warn!(error = %err, "Failed to encode progress event");
            Event::default().comment("unencodable progress event")
        }
    }
}

pub fn progress_sse(
    rx: mpsc::Receiver<ProgressEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = progress_stream(rx).map(|event| Ok(to_sse_event(&event)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// A stream carrying exactly one terminal event.
pub fn single_event_sse(event: ProgressEvent) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::once(async move { Ok(to_sse_event(&event)) });
    Sse::new(events)
}
