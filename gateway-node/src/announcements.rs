use std::sync::Mutex;
use tracing::info;

use voicemesh_common::Announcement;

/// In-memory announcement board. Lives and dies with the gateway process.
#[derive(Default)]
pub struct AnnouncementBoard {
    items: Mutex<Vec<Announcement>>,
}

impl AnnouncementBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, announcement: Announcement) -> Announcement {
        let mut items = self.items.lock().expect("announcement lock poisoned");
        info!(id = %announcement.id, title = %announcement.title, "Announcement created");
        items.push(announcement.clone());
        announcement
    }

    /// Non-expired announcements, oldest first.
    pub fn active(&self) -> Vec<Announcement> {
        let items = self.items.lock().expect("announcement lock poisoned");
        items.iter().filter(|a| !a.is_expired()).cloned().collect()
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut items = self.items.lock().expect("announcement lock poisoned");
        let before = items.len();
        items.retain(|a| a.id != id);
        before != items.len()
    }
}
