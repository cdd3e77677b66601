use std::collections::HashMap;

use crate::events::{ParticipantInfo, ParticipantState};
use crate::media::{MediaKind, MediaStream};
use crate::transport::PeerId;

/// One connected remote peer and the inbound stream it owns.
#[derive(Debug, Clone)]
pub struct Participant {
    pub peer_id: PeerId,
    pub display_name: Option<String>,
    pub state: ParticipantState,
    pub stream: Option<MediaStream>,
}

impl Participant {
    fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            display_name: None,
            state: ParticipantState::Connecting,
            stream: None,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            state: self.state,
            stream_id: self.stream.as_ref().map(|s| s.id().to_string()),
            has_video: self.stream.as_ref().is_some_and(|s| s.has_kind(MediaKind::Video)),
            has_audio: self.stream.as_ref().is_some_and(|s| s.has_kind(MediaKind::Audio)),
        }
    }

    fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }
    }
}

/// What an upsert did, so the caller knows which event to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
}

/// Remote participants keyed by peer id, in join order.
///
/// Updated by the session event tasks. Read by UI layers through snapshots.
#[derive(Debug, Default)]
pub struct ParticipantManager {
    participants: HashMap<PeerId, Participant>,
    order: Vec<PeerId>,
}

impl ParticipantManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, peer_id: &str) -> (&mut Participant, Upsert) {
        let upsert = if self.participants.contains_key(peer_id) {
            Upsert::Updated
        } else {
            self.order.push(peer_id.to_string());
            Upsert::Added
        };
        let participant = self
            .participants
            .entry(peer_id.to_string())
            .or_insert_with(|| Participant::new(peer_id));
        (participant, upsert)
    }

    /// Register a peer whose connection was accepted but has no media yet.
    pub fn add_connecting(&mut self, peer_id: &str) -> Upsert {
        self.entry(peer_id).1
    }

    /// Attach an inbound stream, last one wins for a given peer.
    ///
    /// Tracks of a replaced stream are stopped here, since the entry was their
    /// only owner. Delivering the same stream again just refreshes the
    /// reference.
    pub fn upsert_stream(&mut self, peer_id: &str, stream: MediaStream) -> Upsert {
        let (participant, upsert) = self.entry(peer_id);
        if let Some(previous) = participant.stream.take() {
            previous.stop_tracks_not_in(&stream);
        }
        participant.stream = Some(stream);
        participant.state = ParticipantState::Connected;
        upsert
    }

    pub fn set_state(&mut self, peer_id: &str, state: ParticipantState) -> bool {
        match self.participants.get_mut(peer_id) {
            Some(p) => {
                p.state = state;
                true
            }
            None => false,
        }
    }

    pub fn set_display_name(&mut self, peer_id: &str, name: Option<String>) -> bool {
        match self.participants.get_mut(peer_id) {
            Some(p) => {
                p.display_name = name;
                true
            }
            None => false,
        }
    }

    /// Drop a participant and stop its inbound stream.
    pub fn remove(&mut self, peer_id: &str) -> Option<ParticipantInfo> {
        let mut participant = self.participants.remove(peer_id)?;
        self.order.retain(|id| id != peer_id);
        participant.release_stream();
        participant.state = ParticipantState::Disconnected;
        Some(participant.info())
    }

    pub fn get(&self, peer_id: &str) -> Option<&Participant> {
        self.participants.get(peer_id)
    }

    pub fn stream_of(&self, peer_id: &str) -> Option<MediaStream> {
        self.participants.get(peer_id).and_then(|p| p.stream.clone())
    }

    /// Ordered snapshot for rendering.
    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.order
            .iter()
            .filter_map(|id| self.participants.get(id))
            .map(Participant::info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Stop every remote track, then drop every reference to it.
    pub fn clear(&mut self) {
        for participant in self.participants.values_mut() {
            participant.release_stream();
        }
        self.participants.clear();
        self.order.clear();
    }
}
