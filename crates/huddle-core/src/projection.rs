//! Render-ready view of the session.
//!
//! `project` is a pure function of its input. `Projector` adds memoisation so
//! the rendering layer can compare tiles by pointer: an unchanged input yields
//! the same model, and unchanged tiles keep their `Arc` across updates.

use std::sync::Arc;

use crate::media::DeviceNotice;
use crate::participants::Participant;
use crate::types::{ConnectionState, LocalStream, MediaFlags, ParticipantId, RemoteStream};

/// Grid sizing by number of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridLayout {
    Single,
    TwoUp,
    Grid2x2,
    Grid2x3,
    Columns { columns: u32, rows: u32 },
}

impl GridLayout {
    pub const MAX_COLUMNS: u32 = 4;

    pub fn for_count(tiles: usize) -> Self {
        match tiles {
            0 | 1 => GridLayout::Single,
            2 => GridLayout::TwoUp,
            3 | 4 => GridLayout::Grid2x2,
            5 | 6 => GridLayout::Grid2x3,
            n => GridLayout::Columns {
                columns: Self::MAX_COLUMNS,
                rows: (n as u32).div_ceil(Self::MAX_COLUMNS),
            },
        }
    }

    pub fn columns(&self) -> u32 {
        match self {
            GridLayout::Single => 1,
            GridLayout::TwoUp | GridLayout::Grid2x2 => 2,
            GridLayout::Grid2x3 => 3,
            GridLayout::Columns { columns, .. } => *columns,
        }
    }

    pub fn rows(&self) -> u32 {
        match self {
            GridLayout::Single | GridLayout::TwoUp => 1,
            GridLayout::Grid2x2 | GridLayout::Grid2x3 => 2,
            GridLayout::Columns { rows, .. } => *rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileMedia {
    Local(LocalStream),
    Remote(RemoteStream),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub participant_id: ParticipantId,
    pub name: String,
    /// Shown instead of video when the camera is off or no stream arrived.
    pub initials: String,
    pub is_local: bool,
    pub media: TileMedia,
    pub flags: MediaFlags,
    pub connection_state: ConnectionState,
    /// 1-based place in the raised-hand queue.
    pub hand_raise_position: Option<u32>,
}

impl Tile {
    pub fn label(&self) -> String {
        if self.is_local {
            format!("{} (You)", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn show_video(&self) -> bool {
        match &self.media {
            TileMedia::Local(stream) => {
                stream.screen.is_some() || (!self.flags.camera_off && stream.video.is_some())
            }
            TileMedia::Remote(_) => !self.flags.camera_off || self.flags.screen_sharing,
            TileMedia::None => false,
        }
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        match &self.media {
            TileMedia::Remote(stream) => Some(stream),
            _ => None,
        }
    }
}

/// First letter of each word, upper-cased.
pub fn initials(name: &str) -> String {
    let initials: String = name
        .split_whitespace()
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .collect();
    if initials.is_empty() {
        "?".to_string()
    } else {
        initials
    }
}

/// What the UI shows around the grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub signaling: ConnectionState,
    pub notices: Vec<DeviceNotice>,
}

impl SessionStatus {
    pub fn banner(&self) -> Option<String> {
        match self.signaling {
            ConnectionState::Reconnecting { .. } => Some("Reconnecting...".to_string()),
            ConnectionState::Disconnected => Some("Disconnected".to_string()),
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.notices.first().map(DeviceNotice::message)
            }
        }
    }
}

/// Row of the rendering boundary: one remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipantView {
    pub id: ParticipantId,
    pub stream: Option<RemoteStream>,
    pub name: String,
    pub flags: MediaFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderModel {
    pub local: Arc<Tile>,
    /// Remote tiles in join order.
    pub remote: Vec<Arc<Tile>>,
    pub layout: GridLayout,
    pub status: SessionStatus,
}

impl RenderModel {
    pub fn local_stream(&self) -> Option<&LocalStream> {
        match &self.local.media {
            TileMedia::Local(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn local_flags(&self) -> MediaFlags {
        self.local.flags
    }

    pub fn remote_participants(&self) -> Vec<RemoteParticipantView> {
        self.remote
            .iter()
            .map(|tile| RemoteParticipantView {
                id: tile.participant_id.clone(),
                stream: tile.remote_stream().cloned(),
                name: tile.name.clone(),
                flags: tile.flags,
            })
            .collect()
    }

    pub fn tiles(&self) -> impl Iterator<Item = &Arc<Tile>> {
        std::iter::once(&self.local).chain(self.remote.iter())
    }

    pub fn remote_tile(&self, id: &ParticipantId) -> Option<&Arc<Tile>> {
        self.remote.iter().find(|t| &t.participant_id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionInput {
    pub local_id: ParticipantId,
    pub local_name: String,
    pub local_flags: MediaFlags,
    pub local_stream: LocalStream,
    /// Store snapshot, join order.
    pub participants: Vec<Participant>,
    pub hand_raise: Vec<(ParticipantId, u32)>,
    pub signaling: ConnectionState,
    pub notices: Vec<DeviceNotice>,
}

impl ProjectionInput {
    fn hand_position(&self, id: &ParticipantId) -> Option<u32> {
        self.hand_raise
            .iter()
            .find(|(raised, _)| raised == id)
            .map(|(_, pos)| *pos)
    }
}

pub fn project(input: &ProjectionInput) -> RenderModel {
    let local = Tile {
        participant_id: input.local_id.clone(),
        name: input.local_name.clone(),
        initials: initials(&input.local_name),
        is_local: true,
        media: TileMedia::Local(input.local_stream.clone()),
        flags: input.local_flags,
        connection_state: input.signaling,
        hand_raise_position: input.hand_position(&input.local_id),
    };

    let mut participants: Vec<&Participant> = input.participants.iter().collect();
    participants.sort_by_key(|p| p.joined_seq);
    let remote: Vec<Arc<Tile>> = participants
        .into_iter()
        .map(|p| {
            Arc::new(Tile {
                participant_id: p.id.clone(),
                name: p.display_name.clone(),
                initials: initials(&p.display_name),
                is_local: false,
                media: match &p.remote_stream {
                    Some(stream) => TileMedia::Remote(stream.clone()),
                    None => TileMedia::None,
                },
                flags: p.flags,
                connection_state: p.connection_state,
                hand_raise_position: input.hand_position(&p.id),
            })
        })
        .collect();

    RenderModel {
        local: Arc::new(local),
        layout: GridLayout::for_count(remote.len() + 1),
        remote,
        status: SessionStatus {
            signaling: input.signaling,
            notices: input.notices.clone(),
        },
    }
}

/// Memoising wrapper around [`project`].
#[derive(Debug, Default)]
pub struct Projector {
    last_input: Option<ProjectionInput>,
    last: Option<Arc<RenderModel>>,
}

impl Projector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(&mut self, input: ProjectionInput) -> Arc<RenderModel> {
        if let (Some(last_input), Some(last)) = (&self.last_input, &self.last) {
            if last_input == &input {
                return last.clone();
            }
        }

        let mut model = project(&input);
        if let Some(last) = &self.last {
            if *model.local == *last.local {
                model.local = last.local.clone();
            }
            for tile in model.remote.iter_mut() {
                if let Some(previous) = last.remote_tile(&tile.participant_id) {
                    if **previous == **tile {
                        *tile = previous.clone();
                    }
                }
            }
        }

        let model = Arc::new(model);
        self.last_input = Some(input);
        self.last = Some(model.clone());
        model
    }

    pub fn current(&self) -> Option<Arc<RenderModel>> {
        self.last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeviceError;
    use crate::types::{RemoteStreamInfo, TrackSource};

    fn participant(id: &str, name: &str, seq: u64) -> Participant {
        Participant {
            id: id.into(),
            display_name: name.to_string(),
            connection_state: ConnectionState::Connected,
            flags: MediaFlags::default(),
            remote_stream: Some(Arc::new(RemoteStreamInfo {
                id: format!("stream-{id}"),
                participant_id: id.into(),
            })),
            joined_seq: seq,
        }
    }

    fn input(remote: usize) -> ProjectionInput {
        ProjectionInput {
            local_id: "me".into(),
            local_name: "Ada Lovelace".into(),
            local_flags: MediaFlags::default(),
            local_stream: LocalStream::default(),
            participants: (0..remote)
                .map(|n| participant(&format!("p{n}"), &format!("Guest {n}"), n as u64))
                .collect(),
            hand_raise: Vec::new(),
            signaling: ConnectionState::Connected,
            notices: Vec::new(),
        }
    }

    #[test]
    fn grid_policy_by_participant_count() {
        let expected = [
            (1, GridLayout::Single),
            (2, GridLayout::TwoUp),
            (3, GridLayout::Grid2x2),
            (4, GridLayout::Grid2x2),
            (5, GridLayout::Grid2x3),
            (6, GridLayout::Grid2x3),
            (7, GridLayout::Columns { columns: 4, rows: 2 }),
            (8, GridLayout::Columns { columns: 4, rows: 2 }),
            (9, GridLayout::Columns { columns: 4, rows: 3 }),
        ];
        for (count, layout) in expected {
            assert_eq!(GridLayout::for_count(count), layout, "{count} tiles");
            assert_eq!(project(&input(count - 1)).layout, layout);
        }
        assert!(GridLayout::for_count(30).columns() <= 4);
    }

    #[test]
    fn local_first_then_remote_in_join_order() {
        let mut inp = input(0);
        inp.participants = vec![participant("zed", "Zed", 1), participant("amy", "Amy", 0)];
        let model = project(&inp);
        assert!(model.local.is_local);
        assert_eq!(model.local.label(), "Ada Lovelace (You)");
        let order: Vec<_> = model.remote.iter().map(|t| t.participant_id.as_str()).collect();
        assert_eq!(order, vec!["amy", "zed"]);
    }

    #[test]
    fn initials_fallback() {
        assert_eq!(initials("ada lovelace"), "AL");
        assert_eq!(initials("  Grace  "), "G");
        assert_eq!(initials(""), "?");
    }

    #[test]
    fn boundary_shape_lists_remote_participants() {
        let mut inp = input(1);
        inp.hand_raise = vec![("p0".into(), 1)];
        inp.participants[0].flags.hand_raised = true;
        let model = project(&inp);
        let remote = model.remote_participants();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "Guest 0");
        assert!(remote[0].flags.hand_raised);
        assert!(remote[0].stream.is_some());
        assert_eq!(model.remote[0].hand_raise_position, Some(1));
        assert_eq!(model.local_stream(), Some(&LocalStream::default()));
    }

    #[test]
    fn identical_input_is_referentially_stable() {
        let mut projector = Projector::new();
        let first = projector.project(input(3));
        let second = projector.project(input(3));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unchanged_tiles_keep_their_identity() {
        let mut projector = Projector::new();
        let first = projector.project(input(3));

        let mut changed = input(3);
        changed.participants[1].flags.audio_muted = true;
        let second = projector.project(changed);

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.local, &second.local));
        assert!(Arc::ptr_eq(&first.remote[0], &second.remote[0]));
        assert!(!Arc::ptr_eq(&first.remote[1], &second.remote[1]));
        assert!(Arc::ptr_eq(&first.remote[2], &second.remote[2]));
    }

    #[test]
    fn status_banner_prefers_signaling_state() {
        let notice = DeviceNotice {
            source: TrackSource::Camera,
            error: DeviceError::PermissionDenied("camera".into()),
        };
        let mut status = SessionStatus {
            signaling: ConnectionState::Connected,
            notices: vec![notice],
        };
        assert_eq!(status.banner().as_deref(), Some("Camera unavailable"));
        status.signaling = ConnectionState::Reconnecting { attempt: 2 };
        assert_eq!(status.banner().as_deref(), Some("Reconnecting..."));
        status.signaling = ConnectionState::Disconnected;
        assert_eq!(status.banner().as_deref(), Some("Disconnected"));
    }
}
