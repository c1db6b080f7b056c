//! Pending announcement queue
//!
//! Announcements are de-duplicated by id (against both the queue and the one
//! playing) and play in priority order, lower value first, ties by arrival.

use std::collections::VecDeque;

use fleetbox_common::model::Announcement;

#[derive(Debug, Default)]
pub struct AnnouncementQueue {
    pending: VecDeque<Announcement>,
    current: Option<String>,
}

impl AnnouncementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `announcement`; returns false for a duplicate id
    pub fn push(&mut self, announcement: Announcement) -> bool {
        if self.contains(&announcement.id) {
            return false;
        }
        // Insert after every entry of equal or more urgent priority
        let position = self
            .pending
            .iter()
            .position(|queued| queued.priority > announcement.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, announcement);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current.as_deref() == Some(id) || self.pending.iter().any(|a| a.id == id)
    }

    /// Take the next announcement and mark it as playing
    pub fn start_next(&mut self) -> Option<Announcement> {
        let next = self.pending.pop_front()?;
        self.current = Some(next.id.clone());
        Some(next)
    }

    /// Clear the playing announcement
    pub fn finish(&mut self) -> Option<String> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Drop a pending announcement
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|a| a.id != id);
        self.pending.len() != before
    }

    pub fn pending(&self) -> impl Iterator<Item = &Announcement> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbox_common::model::Track;

    fn announcement(id: &str, priority: i32) -> Announcement {
        let track = Track {
            id: format!("{}-track", id),
            remote_path: format!("/ann/{}.mp3", id),
            local_path: None,
            duration: 8.0,
            size: 0,
            checksum: String::new(),
            name: None,
            artist: None,
        };
        Announcement {
            priority,
            ..Announcement::immediate(id, track)
        }
    }

    #[test]
    fn test_priority_then_arrival_order() {
        let mut queue = AnnouncementQueue::new();
        queue.push(announcement("late-normal", 5));
        queue.push(announcement("urgent", 1));
        queue.push(announcement("later-normal", 5));
        queue.push(announcement("also-urgent", 1));

        let order: Vec<String> = std::iter::from_fn(|| {
            let next = queue.start_next()?;
            queue.finish();
            Some(next.id)
        })
        .collect();
        assert_eq!(order, vec!["urgent", "also-urgent", "late-normal", "later-normal"]);
    }

    #[test]
    fn test_duplicates_rejected_while_queued_or_playing() {
        let mut queue = AnnouncementQueue::new();
        assert!(queue.push(announcement("a", 1)));
        assert!(!queue.push(announcement("a", 0)));

        let playing = queue.start_next().unwrap();
        assert_eq!(queue.current(), Some("a"));
        assert!(!queue.push(announcement(&playing.id, 1)));

        assert_eq!(queue.finish(), Some("a".to_string()));
        assert!(queue.push(announcement("a", 1)), "same id may play again later");
    }

    #[test]
    fn test_remove_pending() {
        let mut queue = AnnouncementQueue::new();
        queue.push(announcement("a", 1));
        queue.push(announcement("b", 1));
        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert_eq!(queue.len(), 1);
    }
}
