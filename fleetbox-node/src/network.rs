//! Media library reachability
//!
//! [`NetworkMonitor`] pings the media library on a fixed interval and
//! publishes the result on a watch channel. The engine reports it as
//! `isOnline` and releases backed-off downloads when the link comes back.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::download::MediaSource;
use crate::task::TaskHandle;

pub struct NetworkMonitor {
    source: Arc<dyn MediaSource>,
    interval: Duration,
    timeout: Duration,
    online: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Starts out online so nothing is held back before the first ping
    pub fn new(source: Arc<dyn MediaSource>, config: &NetworkConfig) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            source,
            interval: config.check_interval(),
            timeout: config.timeout(),
            online,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Ping once and publish the result; returns the new state
    pub async fn check(&self) -> bool {
        let online = match tokio::time::timeout(self.timeout, self.source.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Media library ping failed: {}", e);
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "Media library ping timed out");
                false
            }
        };
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("Media library reachable again");
            } else {
                warn!("Media library unreachable");
            }
        }
        online
    }

    pub fn start(self, parent: &CancellationToken) -> TaskHandle {
        TaskHandle::spawn("network-monitor", parent, move |token| async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        self.check().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::ChunkData;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Link {
        up: AtomicBool,
    }

    #[async_trait]
    impl MediaSource for Link {
        async fn content_length(&self, _remote_path: &str) -> Result<Option<u64>> {
            Ok(None)
        }

        async fn fetch_range(&self, _remote_path: &str, _start: u64, _len: u64) -> Result<ChunkData> {
            Err(Error::InvalidState("not used".to_string()))
        }

        async fn ping(&self) -> Result<()> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Network("connection refused".to_string()))
            }
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            check_interval_ms: 10,
            timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_state_follows_ping_results() {
        let link = Arc::new(Link {
            up: AtomicBool::new(false),
        });
        let monitor = NetworkMonitor::new(link.clone(), &config());
        let mut rx = monitor.subscribe();
        assert!(monitor.is_online());

        assert!(!monitor.check().await);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());

        // Same result twice: no change notification
        monitor.check().await;
        assert!(!rx.has_changed().unwrap());

        link.up.store(true, Ordering::SeqCst);
        assert!(monitor.check().await);
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_background_task_publishes_changes() {
        let link = Arc::new(Link {
            up: AtomicBool::new(false),
        });
        let monitor = NetworkMonitor::new(link.clone(), &config());
        let mut rx = monitor.subscribe();
        let root = CancellationToken::new();
        let task = monitor.start(&root);

        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| !*online))
            .await
            .expect("offline should be reported")
            .unwrap();
        link.up.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| *online))
            .await
            .expect("recovery should be reported")
            .unwrap();
        task.shutdown().await;
    }
}
