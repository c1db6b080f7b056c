//! End-to-end node tests
//!
//! Drive a full [`Node`] (downloads, engine, arbitration) through control
//! messages and observe it via status, the event bus and the simulated
//! output. Track durations are real seconds, so these tests are kept short.
//!
//! [`Node`]: fleetbox_node::Node

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

use fleetbox_common::control::{CommandKind, ControlMessage, PlaylistStatus};
use fleetbox_common::events::{FallbackReason, FleetEvent};
use fleetbox_common::model::{
    Announcement, AnnouncementTrigger, Playlist, RepeatType, Schedule, SourceKind, Targets, Track,
};
use fleetbox_node::download::Owner;
use fleetbox_node::Error;
use helpers::{node_config, wait_until, NodeFixture, ScriptedSource, TOKEN};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(15);

fn playlist(id: &str, tracks: Vec<Track>) -> Playlist {
    Playlist {
        id: id.to_string(),
        name: None,
        tracks,
        looping: true,
    }
}

/// Plays once; a single track runs to its natural end
fn one_shot(id: &str, tracks: Vec<Track>) -> Playlist {
    Playlist {
        looping: false,
        ..playlist(id, tracks)
    }
}

fn command(kind: CommandKind, value: Option<f64>) -> ControlMessage {
    ControlMessage::Command {
        command: kind,
        value,
        schedule_id: None,
    }
}

fn under(path: &Path, area: &str) -> bool {
    path.components().any(|c| c.as_os_str() == area)
}

fn playlist_status(fx: &NodeFixture) -> Option<PlaylistStatus> {
    fx.node.status().device().map(|d| d.playlist_status)
}

async fn next_event<F>(rx: &mut broadcast::Receiver<FleetEvent>, mut matches: F) -> FleetEvent
where
    F: FnMut(&FleetEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn start_playing(fx: &NodeFixture) -> Track {
    let a = fx.serve("song-a", 60.0);
    let b = fx.serve("song-b", 60.0);
    fx.node
        .handle_control(ControlMessage::PlaylistPush {
            playlist: playlist("base", vec![a.clone(), b]),
        })
        .await
        .unwrap();
    assert!(
        wait_until(WAIT, || playlist_status(fx) == Some(PlaylistStatus::Playing)).await,
        "playlist never started"
    );
    a
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_playlist_push_downloads_and_plays() {
    let fx = NodeFixture::start().await;
    let first = start_playing(&fx).await;

    let playback = fx.node.status().playback().unwrap();
    assert!(playback.is_playing);
    assert_eq!(playback.song_id.as_deref(), Some("song-a"));
    assert_eq!(playback.duration, 60.0);

    let device = fx.node.status().device().unwrap();
    assert_eq!(device.token, TOKEN);
    assert!(device.is_online);

    let owner = fleetbox_node::download::Owner::Playlist("base".to_string());
    let expected = vec![fx.media_path(&first, &owner)];
    assert!(wait_until(WAIT, || fx.audible_paths() == expected).await);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_announcement_preempts_then_playlist_resumes() {
    let fx = NodeFixture::start().await;
    start_playing(&fx).await;
    let mut events = fx.node.events().subscribe();

    let ann = fx.serve("ann-1", 1.5);
    fx.node
        .handle_control(ControlMessage::Announcement {
            announcement: Announcement::immediate("ann-1", ann),
        })
        .await
        .unwrap();

    // Sample the output until the announcement has finished: an announcement
    // and the playlist are never audible together
    let mut saw_announcement = false;
    let finished = tokio::time::timeout(WAIT, async {
        loop {
            let paths = fx.audible_paths();
            let announcing = paths.iter().any(|p| under(p, "announcements"));
            let base = paths.iter().any(|p| under(p, "playlists"));
            assert!(!(announcing && base), "overlapping sources: {:?}", paths);
            saw_announcement |= announcing;
            while let Ok(event) = events.try_recv() {
                if matches!(event, FleetEvent::AnnouncementFinished { .. }) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "announcement never finished");
    assert!(saw_announcement);

    assert!(
        wait_until(WAIT, || playlist_status(&fx) == Some(PlaylistStatus::Playing)).await,
        "playlist did not resume"
    );
    // Resumed, not restarted
    assert_eq!(
        fx.node.status().playback().and_then(|p| p.song_id).as_deref(),
        Some("song-a")
    );

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_pause_silences_until_play() {
    let fx = NodeFixture::start().await;
    start_playing(&fx).await;

    fx.node.handle_control(command(CommandKind::Pause, None)).await.unwrap();
    assert_eq!(playlist_status(&fx), Some(PlaylistStatus::Paused));
    assert!(wait_until(WAIT, || fx.audible_paths().is_empty()).await);

    fx.node.handle_control(command(CommandKind::Play, None)).await.unwrap();
    assert!(wait_until(WAIT, || playlist_status(&fx) == Some(PlaylistStatus::Playing)).await);
    assert!(wait_until(WAIT, || !fx.audible_paths().is_empty()).await);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_volume_accepts_percent() {
    let fx = NodeFixture::start().await;
    let mut events = fx.node.events().subscribe();

    fx.node
        .handle_control(command(CommandKind::SetVolume, Some(40.0)))
        .await
        .unwrap();

    let event = next_event(&mut events, |e| matches!(e, FleetEvent::VolumeChanged { .. })).await;
    assert_eq!(event, FleetEvent::VolumeChanged { volume: 0.4 });
    assert!(wait_until(WAIT, || fx.node.status().device().map(|d| d.volume) == Some(40)).await);

    let missing = fx.node.handle_control(command(CommandKind::SetVolume, None)).await;
    assert!(matches!(missing, Err(Error::BadRequest(_))));

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_state_survives_restart() {
    let fx = NodeFixture::start().await;
    start_playing(&fx).await;
    fx.node
        .handle_control(command(CommandKind::SetVolume, Some(0.3)))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || fx.node.status().device().map(|d| d.volume) == Some(30)).await);

    let (dir, source) = fx.stop().await;
    let requests = source.requests();

    let fx = NodeFixture::start_in(dir, source).await;
    assert!(
        wait_until(WAIT, || playlist_status(&fx) == Some(PlaylistStatus::Playing)).await,
        "restored playlist did not play"
    );
    assert_eq!(fx.node.status().device().map(|d| d.volume), Some(30));
    // Verified files are reused, not fetched again
    assert_eq!(fx.source.requests(), requests);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_active_schedule_preempts_playlist() {
    let fx = NodeFixture::start().await;
    start_playing(&fx).await;
    let mut events = fx.node.events().subscribe();

    let now = Utc::now();
    let jingle = fx.serve("sched-1", 60.0);
    let schedule = Schedule {
        id: "morning".to_string(),
        playlist: playlist("morning-list", vec![jingle]),
        start_date: now - ChronoDuration::seconds(5),
        end_date: now + ChronoDuration::minutes(10),
        repeat_type: RepeatType::Once,
        targets: Targets::default(),
    };
    fx.node
        .handle_control(ControlMessage::ScheduleCreated { schedule })
        .await
        .unwrap();

    next_event(&mut events, |e| {
        matches!(e, FleetEvent::ScheduleStarted { schedule_id } if schedule_id == "morning")
    })
    .await;

    let switched = tokio::time::timeout(WAIT, async {
        loop {
            let paths = fx.audible_paths();
            let scheduled = paths.iter().any(|p| under(p, "schedules"));
            let base = paths.iter().any(|p| under(p, "playlists"));
            assert!(!(scheduled && base), "overlapping sources: {:?}", paths);
            if scheduled && playlist_status(&fx) == Some(PlaylistStatus::Schedule) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(switched.is_ok(), "schedule never became audible");

    fx.node
        .handle_control(ControlMessage::ScheduleDeleted {
            schedule: fleetbox_common::control::ScheduleRef {
                id: "morning".to_string(),
            },
        })
        .await
        .unwrap();
    let stopped = next_event(&mut events, |e| matches!(e, FleetEvent::ScheduleStopped { .. })).await;
    assert_eq!(
        stopped,
        FleetEvent::ScheduleStopped {
            schedule_id: "morning".to_string(),
            reason: FallbackReason::ScheduleDeleted,
        }
    );

    // The schedule fades out, and only then does the playlist come back
    let mut gains = Vec::new();
    let resumed = tokio::time::timeout(WAIT, async {
        loop {
            let audible = fx.output.audible();
            let scheduled: Vec<f32> = audible
                .iter()
                .filter(|h| under(&h.path, "schedules"))
                .map(|h| h.gain)
                .collect();
            let base = audible.iter().any(|h| under(&h.path, "playlists"));
            assert!(
                !(base && !scheduled.is_empty()),
                "overlapping sources: {:?}",
                audible
            );
            gains.extend(scheduled);
            if base {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(resumed.is_ok(), "playlist never came back");
    assert!(gains.len() >= 3, "schedule was cut instead of faded: {:?}", gains);
    assert!(
        gains.windows(2).all(|w| w[1] <= w[0] + 1e-3),
        "fade-out gain rose: {:?}",
        gains
    );
    assert!(wait_until(WAIT, || playlist_status(&fx) == Some(PlaylistStatus::Playing)).await);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_schedule_is_rejected_with_fallback() {
    let fx = NodeFixture::start().await;
    let mut events = fx.node.events().subscribe();

    let now = Utc::now();
    let schedule = Schedule {
        id: "broken".to_string(),
        playlist: playlist("p", vec![fx.serve("x", 10.0)]),
        start_date: now,
        end_date: now - ChronoDuration::hours(1),
        repeat_type: RepeatType::Daily,
        targets: Targets::default(),
    };
    let result = fx
        .node
        .handle_control(ControlMessage::ScheduleCreated { schedule })
        .await;
    assert!(matches!(result, Err(Error::ScheduleInvalid(_))));

    let event = next_event(&mut events, |e| matches!(e, FleetEvent::ScheduleFallback { .. })).await;
    assert_eq!(
        event,
        FleetEvent::ScheduleFallback {
            schedule_id: "broken".to_string(),
            reason: FallbackReason::InvalidSchedule,
            error_count: 0,
        }
    );

    fx.stop().await;
}

fn future_schedule(id: &str, tracks: Vec<Track>, starts_in_secs: i64) -> Schedule {
    let now = Utc::now();
    Schedule {
        id: id.to_string(),
        playlist: playlist(&format!("{}-list", id), tracks),
        start_date: now + ChronoDuration::seconds(starts_in_secs),
        end_date: now + ChronoDuration::minutes(10),
        repeat_type: RepeatType::Once,
        targets: Targets::default(),
    }
}

/// Collect bus events for `window`
async fn events_for(rx: &mut broadcast::Receiver<FleetEvent>, window: Duration) -> Vec<FleetEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(window, async {
        loop {
            match rx.recv().await {
                Ok(event) => seen.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return,
            }
        }
    })
    .await;
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_failed_schedule_tracks_fall_back_once() {
    let mut config = node_config();
    config.schedule.retry_delay_secs = 1;
    let fx = NodeFixture::start_with(&config, TempDir::new().unwrap(), ScriptedSource::new()).await;
    let mut events = fx.node.events().subscribe();

    let owner = Owner::Schedule("flaky".to_string());
    let tracks: Vec<Track> = (0..3).map(|i| fx.serve(&format!("flaky-{}", i), 30.0)).collect();
    for t in &tracks {
        fx.output.mark_broken(fx.media_path(t, &owner));
    }
    fx.node
        .handle_control(ControlMessage::ScheduleCreated {
            schedule: future_schedule("flaky", tracks, 2),
        })
        .await
        .unwrap();

    let mut skipped = Vec::new();
    let mut stops = 0;
    let fallback = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                FleetEvent::TrackSkipped {
                    source: SourceKind::Schedule,
                    track_id,
                    ..
                } => skipped.push(track_id),
                FleetEvent::ScheduleStopped {
                    reason: FallbackReason::PlaybackFailed,
                    ..
                } => stops += 1,
                event @ FleetEvent::ScheduleFallback { .. } => return event,
                _ => {}
            }
        }
    })
    .await
    .expect("schedule never fell back");

    assert_eq!(
        fallback,
        FleetEvent::ScheduleFallback {
            schedule_id: "flaky".to_string(),
            reason: FallbackReason::TooManyErrors,
            error_count: 3,
        }
    );
    // One error per activation, each retry one track further on
    assert_eq!(stops, 2);
    assert_eq!(skipped, vec!["flaky-0", "flaky-1", "flaky-2"]);

    // Blocked for good: no second fallback and no reactivation
    let later = events_for(&mut events, Duration::from_millis(2500)).await;
    assert!(
        !later.iter().any(|e| matches!(
            e,
            FleetEvent::ScheduleFallback { .. } | FleetEvent::ScheduleStarted { .. }
        )),
        "{:?}",
        later
    );

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_schedule_track_retries_later_at_next_index() {
    let mut config = node_config();
    config.schedule.retry_delay_secs = 1;
    let fx = NodeFixture::start_with(&config, TempDir::new().unwrap(), ScriptedSource::new()).await;
    let mut events = fx.node.events().subscribe();

    let owner = Owner::Schedule("retry".to_string());
    let bad = fx.serve("retry-bad", 30.0);
    let good = fx.serve("retry-good", 30.0);
    fx.output.mark_broken(fx.media_path(&bad, &owner));
    fx.node
        .handle_control(ControlMessage::ScheduleCreated {
            schedule: future_schedule("retry", vec![bad, good], 2),
        })
        .await
        .unwrap();

    next_event(&mut events, |e| {
        matches!(
            e,
            FleetEvent::ScheduleStopped {
                reason: FallbackReason::PlaybackFailed,
                ..
            }
        )
    })
    .await;
    let failed_at = tokio::time::Instant::now();

    next_event(&mut events, |e| {
        matches!(e, FleetEvent::ScheduleStarted { schedule_id } if schedule_id == "retry")
    })
    .await;
    assert!(
        failed_at.elapsed() >= Duration::from_millis(900),
        "retried after {:?}",
        failed_at.elapsed()
    );

    let started = next_event(&mut events, |e| {
        matches!(
            e,
            FleetEvent::TrackStarted {
                source: SourceKind::Schedule,
                ..
            }
        )
    })
    .await;
    assert_eq!(
        started,
        FleetEvent::TrackStarted {
            source: SourceKind::Schedule,
            track_id: "retry-good".to_string(),
            index: 1,
        }
    );

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_next_track_missing_at_preload_timeout_hard_cuts() {
    let mut config = node_config();
    config.playback.preload_timeout_ms = 300;
    let fx = NodeFixture::start_with(&config, TempDir::new().unwrap(), ScriptedSource::new()).await;
    let mut events = fx.node.events().subscribe();

    let first = fx.serve("short-a", 4.0);
    let never = fx.serve("short-b", 4.0);
    fx.source.stall_from(&never.remote_path, 0);
    fx.node
        .handle_control(ControlMessage::PlaylistPush {
            playlist: playlist("cut", vec![first, never]),
        })
        .await
        .unwrap();

    let seen = tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                event @ FleetEvent::HardCut { .. } => {
                    seen.push(event);
                    return seen;
                }
                event => seen.push(event),
            }
        }
    })
    .await
    .expect("no hard cut");

    assert_eq!(
        seen.last(),
        Some(&FleetEvent::HardCut {
            source: SourceKind::Playlist,
            track_id: "short-a".to_string(),
        })
    );
    assert!(!seen
        .iter()
        .any(|e| matches!(e, FleetEvent::CrossfadeStarted { .. })));

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finished_tracks_land_in_play_history() {
    let fx = NodeFixture::start().await;
    let mut events = fx.node.events().subscribe();

    let a = fx.serve("hist-a", 2.0);
    fx.node
        .handle_control(ControlMessage::PlaylistPush {
            playlist: one_shot("hist", vec![a]),
        })
        .await
        .unwrap();

    let played = next_event(&mut events, |e| {
        matches!(e, FleetEvent::TrackPlayed { track_id, .. } if track_id == "hist-a")
    })
    .await;
    assert!(matches!(
        played,
        FleetEvent::TrackPlayed {
            source: SourceKind::Playlist,
            completed: true,
            ..
        }
    ));

    let history = fx.node.history(10).await.unwrap();
    let record = history
        .iter()
        .find(|r| r.track_id == "hist-a")
        .expect("play recorded");
    assert!(record.completed);
    assert_eq!(record.token, TOKEN);
    assert_eq!(record.source, SourceKind::Playlist);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_song_interval_announcement_fires_and_can_be_deleted() {
    let fx = NodeFixture::start().await;
    let mut events = fx.node.events().subscribe();

    let jingle = fx.serve("every-song", 1.0);
    fx.node
        .handle_control(ControlMessage::Announcement {
            announcement: Announcement {
                schedule_type: AnnouncementTrigger::Songs,
                song_interval: Some(1),
                ..Announcement::immediate("every-song", jingle)
            },
        })
        .await
        .unwrap();

    let a = fx.serve("between-a", 2.0);
    fx.node
        .handle_control(ControlMessage::PlaylistPush {
            playlist: one_shot("between", vec![a]),
        })
        .await
        .unwrap();

    next_event(&mut events, |e| {
        matches!(e, FleetEvent::AnnouncementStarted { announcement_id } if announcement_id == "every-song")
    })
    .await;

    fx.node
        .handle_control(ControlMessage::DeleteAnnouncement {
            announcement_id: "every-song".to_string(),
        })
        .await
        .unwrap();
    let deleted = next_event(&mut events, |e| matches!(e, FleetEvent::AnnouncementDeleted { .. })).await;
    assert_eq!(
        deleted,
        FleetEvent::AnnouncementDeleted {
            announcement_id: "every-song".to_string(),
            success: true,
        }
    );

    fx.node
        .handle_control(ControlMessage::DeleteAnnouncement {
            announcement_id: "every-song".to_string(),
        })
        .await
        .unwrap();
    let again = next_event(&mut events, |e| matches!(e, FleetEvent::AnnouncementDeleted { .. })).await;
    assert_eq!(
        again,
        FleetEvent::AnnouncementDeleted {
            announcement_id: "every-song".to_string(),
            success: false,
        }
    );

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_scheduled_announcement_is_rejected() {
    let fx = NodeFixture::start().await;
    let result = fx
        .node
        .handle_control(ControlMessage::Announcement {
            announcement: Announcement {
                schedule_type: AnnouncementTrigger::Minutes,
                ..Announcement::immediate("no-interval", fx.serve("no-interval", 3.0))
            },
        })
        .await;
    assert!(matches!(result, Err(Error::BadRequest(_))));

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_library_outage_is_reported_in_device_status() {
    let fx = NodeFixture::start().await;
    let mut events = fx.node.events().subscribe();
    assert!(fx.node.is_online());

    fx.source.set_online(false);
    let down = next_event(&mut events, |e| matches!(e, FleetEvent::ConnectivityChanged { .. })).await;
    assert_eq!(down, FleetEvent::ConnectivityChanged { online: false });
    assert!(
        wait_until(WAIT, || fx.node.status().device().map(|d| d.is_online) == Some(false)).await
    );
    assert!(!fx.node.is_online());

    fx.source.set_online(true);
    let up = next_event(&mut events, |e| matches!(e, FleetEvent::ConnectivityChanged { .. })).await;
    assert_eq!(up, FleetEvent::ConnectivityChanged { online: true });
    assert!(
        wait_until(WAIT, || fx.node.status().device().map(|d| d.is_online) == Some(true)).await
    );

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_playlist_pushed_offline_plays_after_reconnect() {
    let fx = NodeFixture::start().await;
    fx.source.set_online(false);
    assert!(wait_until(WAIT, || !fx.node.is_online()).await);

    let a = fx.serve("offline-a", 30.0);
    fx.node
        .handle_control(ControlMessage::PlaylistPush {
            playlist: playlist("offline", vec![a]),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_ne!(playlist_status(&fx), Some(PlaylistStatus::Playing));

    fx.source.set_online(true);
    assert!(
        wait_until(WAIT, || playlist_status(&fx) == Some(PlaylistStatus::Playing)).await,
        "playlist did not start after reconnect"
    );

    fx.stop().await;
}
