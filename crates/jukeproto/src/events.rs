//! The closed set of events carried by the in-process bus.
//!
//! Payloads are plain records; handlers must not mutate them. Every emit is
//! tagged with a monotonic sequence number by the bus itself, so the event
//! types here carry only domain data.

use crate::domain::{PlaylistId, SongId, SongStatus};
use serde::{Deserialize, Serialize};

/// Event kind, used for subscription filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SongCreated,
    SongStatusChanged,
    SongDeleted,
    SongMetadataUpdated,
    SongReordered,
    PlaylistCreated,
    PlaylistSteered,
    PlaylistStatusChanged,
    PlaylistUpdated,
    PlaylistHeartbeat,
    PlaylistDeleted,
    SettingsChanged,
}

impl EventKind {
    /// Dotted wire name, as seen in logs and observer envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SongCreated => "song.created",
            EventKind::SongStatusChanged => "song.status_changed",
            EventKind::SongDeleted => "song.deleted",
            EventKind::SongMetadataUpdated => "song.metadata_updated",
            EventKind::SongReordered => "song.reordered",
            EventKind::PlaylistCreated => "playlist.created",
            EventKind::PlaylistSteered => "playlist.steered",
            EventKind::PlaylistStatusChanged => "playlist.status_changed",
            EventKind::PlaylistUpdated => "playlist.updated",
            EventKind::PlaylistHeartbeat => "playlist.heartbeat",
            EventKind::PlaylistDeleted => "playlist.deleted",
            EventKind::SettingsChanged => "settings.changed",
        }
    }

    /// All kinds, in declaration order. Handy for subscribe-to-everything.
    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::SongCreated,
            EventKind::SongStatusChanged,
            EventKind::SongDeleted,
            EventKind::SongMetadataUpdated,
            EventKind::SongReordered,
            EventKind::PlaylistCreated,
            EventKind::PlaylistSteered,
            EventKind::PlaylistStatusChanged,
            EventKind::PlaylistUpdated,
            EventKind::PlaylistHeartbeat,
            EventKind::PlaylistDeleted,
            EventKind::SettingsChanged,
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bus event with its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename = "song.created")]
    SongCreated {
        song_id: SongId,
        playlist_id: PlaylistId,
    },
    #[serde(rename = "song.status_changed")]
    SongStatusChanged {
        song_id: SongId,
        playlist_id: PlaylistId,
        status: SongStatus,
    },
    #[serde(rename = "song.deleted")]
    SongDeleted {
        song_id: SongId,
        playlist_id: PlaylistId,
    },
    #[serde(rename = "song.metadata_updated")]
    SongMetadataUpdated {
        song_id: SongId,
        playlist_id: PlaylistId,
    },
    #[serde(rename = "song.reordered")]
    SongReordered { playlist_id: PlaylistId },
    #[serde(rename = "playlist.created")]
    PlaylistCreated { playlist_id: PlaylistId },
    #[serde(rename = "playlist.steered")]
    PlaylistSteered {
        playlist_id: PlaylistId,
        prompt_epoch: i64,
    },
    #[serde(rename = "playlist.status_changed")]
    PlaylistStatusChanged {
        playlist_id: PlaylistId,
        status: String,
    },
    #[serde(rename = "playlist.updated")]
    PlaylistUpdated { playlist_id: PlaylistId },
    #[serde(rename = "playlist.heartbeat")]
    PlaylistHeartbeat { playlist_id: PlaylistId },
    #[serde(rename = "playlist.deleted")]
    PlaylistDeleted { playlist_id: PlaylistId },
    #[serde(rename = "settings.changed")]
    SettingsChanged,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SongCreated { .. } => EventKind::SongCreated,
            Event::SongStatusChanged { .. } => EventKind::SongStatusChanged,
            Event::SongDeleted { .. } => EventKind::SongDeleted,
            Event::SongMetadataUpdated { .. } => EventKind::SongMetadataUpdated,
            Event::SongReordered { .. } => EventKind::SongReordered,
            Event::PlaylistCreated { .. } => EventKind::PlaylistCreated,
            Event::PlaylistSteered { .. } => EventKind::PlaylistSteered,
            Event::PlaylistStatusChanged { .. } => EventKind::PlaylistStatusChanged,
            Event::PlaylistUpdated { .. } => EventKind::PlaylistUpdated,
            Event::PlaylistHeartbeat { .. } => EventKind::PlaylistHeartbeat,
            Event::PlaylistDeleted { .. } => EventKind::PlaylistDeleted,
            Event::SettingsChanged => EventKind::SettingsChanged,
        }
    }

    /// The playlist this event concerns, if any.
    pub fn playlist_id(&self) -> Option<&PlaylistId> {
        match self {
            Event::SongCreated { playlist_id, .. }
            | Event::SongStatusChanged { playlist_id, .. }
            | Event::SongDeleted { playlist_id, .. }
            | Event::SongMetadataUpdated { playlist_id, .. }
            | Event::SongReordered { playlist_id }
            | Event::PlaylistCreated { playlist_id }
            | Event::PlaylistSteered { playlist_id, .. }
            | Event::PlaylistStatusChanged { playlist_id, .. }
            | Event::PlaylistUpdated { playlist_id }
            | Event::PlaylistHeartbeat { playlist_id }
            | Event::PlaylistDeleted { playlist_id } => Some(playlist_id),
            Event::SettingsChanged => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_strings_are_dotted() {
        assert_eq!(EventKind::SongStatusChanged.as_str(), "song.status_changed");
        assert_eq!(EventKind::PlaylistHeartbeat.as_str(), "playlist.heartbeat");
    }

    #[test]
    fn test_event_serde_uses_kind_tag() {
        let event = Event::SongCreated {
            song_id: SongId::new("s1"),
            playlist_id: PlaylistId::new("pl1"),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "song.created");
        assert_eq!(json["song_id"], "s1");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_all_kinds_covered() {
        assert_eq!(EventKind::all().len(), 12);
    }
}
