//! Outbound status
//!
//! The latest `deviceStatus`, `playbackStatus` and per-owner
//! `downloadProgress` are kept in `watch` channels: a slow reader only ever
//! sees the most recent value, never a backlog.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use fleetbox_common::control::{DeviceStatus, DownloadProgress, PlaybackStatus, StatusMessage};

struct Channels {
    device: watch::Sender<Option<DeviceStatus>>,
    playback: watch::Sender<Option<PlaybackStatus>>,
    /// Keyed by owner (`playlist:<id>`, `schedule:<id>`)
    downloads: watch::Sender<BTreeMap<String, DownloadProgress>>,
}

/// Last-write-wins status publisher shared by the engine and the API
#[derive(Clone)]
pub struct StatusPublisher {
    inner: Arc<Channels>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (device, _) = watch::channel(None);
        let (playback, _) = watch::channel(None);
        let (downloads, _) = watch::channel(BTreeMap::new());
        Self {
            inner: Arc::new(Channels {
                device,
                playback,
                downloads,
            }),
        }
    }

    /// Returns false when the value did not change
    pub fn publish_device(&self, status: DeviceStatus) -> bool {
        replace_if_changed(&self.inner.device, status)
    }

    pub fn publish_playback(&self, status: PlaybackStatus) -> bool {
        replace_if_changed(&self.inner.playback, status)
    }

    pub fn publish_download(&self, key: String, progress: DownloadProgress) -> bool {
        self.inner.downloads.send_if_modified(|map| {
            if map.get(&key) == Some(&progress) {
                return false;
            }
            map.insert(key, progress);
            true
        })
    }

    pub fn remove_download(&self, key: &str) {
        self.inner
            .downloads
            .send_if_modified(|map| map.remove(key).is_some());
    }

    pub fn device(&self) -> Option<DeviceStatus> {
        self.inner.device.borrow().clone()
    }

    pub fn playback(&self) -> Option<PlaybackStatus> {
        self.inner.playback.borrow().clone()
    }

    pub fn downloads(&self) -> Vec<DownloadProgress> {
        self.inner.downloads.borrow().values().cloned().collect()
    }

    pub fn subscribe_device(&self) -> watch::Receiver<Option<DeviceStatus>> {
        self.inner.device.subscribe()
    }

    pub fn subscribe_playback(&self) -> watch::Receiver<Option<PlaybackStatus>> {
        self.inner.playback.subscribe()
    }

    pub fn subscribe_downloads(&self) -> watch::Receiver<BTreeMap<String, DownloadProgress>> {
        self.inner.downloads.subscribe()
    }

    /// Latest value of every status kind, as wire messages
    pub fn snapshot(&self) -> Vec<StatusMessage> {
        let mut messages = Vec::new();
        if let Some(device) = self.device() {
            messages.push(StatusMessage::DeviceStatus(device));
        }
        if let Some(playback) = self.playback() {
            messages.push(StatusMessage::PlaybackStatus(playback));
        }
        messages.extend(self.downloads().into_iter().map(StatusMessage::DownloadProgress));
        messages
    }
}

fn replace_if_changed<T: PartialEq>(tx: &watch::Sender<Option<T>>, value: T) -> bool {
    tx.send_if_modified(|current| {
        if current.as_ref() == Some(&value) {
            return false;
        }
        *current = Some(value);
        true
    })
}
