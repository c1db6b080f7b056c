//! Server-Sent Events stream
//!
//! Each status kind replays its latest value to a new client and then sends
//! only changes. Download progress is diffed per owner so one owner's update
//! does not resend the others. Engine events from the [`EventBus`] are
//! interleaved under their own event names.
//!
//! [`EventBus`]: fleetbox_common::events::EventBus

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, warn};

use crate::api::server::AppContext;
use fleetbox_common::control::{DownloadProgress, StatusMessage};
use fleetbox_common::events::FleetEvent;

/// GET /events - SSE stream of outbound status and engine events
pub async fn event_stream(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("New SSE client connected");
    let status = ctx.node.status();

    let device = WatchStream::new(status.subscribe_device())
        .filter_map(|s| async move { s.map(StatusMessage::DeviceStatus) })
        .boxed();

    let playback = WatchStream::new(status.subscribe_playback())
        .filter_map(|s| async move { s.map(StatusMessage::PlaybackStatus) })
        .boxed();

    let downloads = WatchStream::new(status.subscribe_downloads())
        .scan(BTreeMap::new(), |previous, current| {
            let changed = changed_downloads(previous, &current);
            *previous = current;
            futures::future::ready(Some(changed))
        })
        .flat_map(|changed| stream::iter(changed.into_iter().map(StatusMessage::DownloadProgress)))
        .boxed();

    let statuses: BoxStream<'static, Event> = stream::select_all([device, playback, downloads])
        .filter_map(|message| async move { status_event(&message) })
        .boxed();

    let events: BoxStream<'static, Event> = BroadcastStream::new(ctx.node.events().subscribe())
        .filter_map(|result| async move {
            match result {
                Ok(event) => fleet_event(&event),
                Err(e) => {
                    warn!("SSE stream error: {:?}", e);
                    None
                }
            }
        })
        .boxed();

    let stream = stream::select(statuses, events).map(Ok);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn changed_downloads(
    previous: &BTreeMap<String, DownloadProgress>,
    current: &BTreeMap<String, DownloadProgress>,
) -> Vec<DownloadProgress> {
    current
        .iter()
        .filter(|(owner, progress)| previous.get(*owner) != Some(*progress))
        .map(|(_, progress)| progress.clone())
        .collect()
}

fn status_event(message: &StatusMessage) -> Option<Event> {
    match Event::default().event(message.kind()).json_data(message) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Failed to serialize status: {}", e);
            None
        }
    }
}

fn fleet_event(event: &FleetEvent) -> Option<Event> {
    match Event::default().event(event.event_type()).json_data(event) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbox_common::model::DownloadStatus;

    fn progress(id: &str, percent: f64) -> DownloadProgress {
        DownloadProgress {
            token: "dev".to_string(),
            playlist_id: id.to_string(),
            progress: percent,
            download_speed: 0,
            downloaded_songs: 0,
            total_songs: 1,
            estimated_time_remaining: 0,
            status: DownloadStatus::Downloading,
            retry_count: 0,
        }
    }

    #[test]
    fn test_only_changed_owners_are_sent() {
        let mut previous = BTreeMap::new();
        previous.insert("playlist:a".to_string(), progress("a", 10.0));
        previous.insert("schedule:b".to_string(), progress("b", 50.0));

        let mut current = previous.clone();
        current.insert("schedule:b".to_string(), progress("b", 60.0));

        let changed = changed_downloads(&previous, &current);
        assert_eq!(changed, vec![progress("b", 60.0)]);
    }

    #[test]
    fn test_first_snapshot_sends_everything() {
        let mut current = BTreeMap::new();
        current.insert("playlist:a".to_string(), progress("a", 10.0));
        assert_eq!(changed_downloads(&BTreeMap::new(), &current).len(), 1);
    }
}
