use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// A single capture or receive track handed out by the device layer or the
/// peer transport.
///
/// `stop()` releases the underlying capture. Implementations must tolerate
/// repeated calls.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn label(&self) -> &str;
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// A set of tracks with a stream id.
///
/// Cloning shares the same tracks. Whoever owns the acquisition is the only
/// one allowed to call [`MediaStream::stop_all`].
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { id: id.into(), tracks }
    }

    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Vec::new())
    }

    /// Compose a stream out of the tracks of other streams.
    pub fn merged(id: impl Into<String>, parts: &[&MediaStream]) -> Self {
        let tracks = parts
            .iter()
            .flat_map(|s| s.tracks.iter().cloned())
            .collect();
        Self::new(id, tracks)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// True while at least one track is still live.
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    /// True when both streams hold exactly the same track objects.
    pub fn same_tracks(&self, other: &MediaStream) -> bool {
        self.tracks.len() == other.tracks.len()
            && self
                .tracks
                .iter()
                .all(|t| other.tracks.iter().any(|o| Arc::ptr_eq(t, o)))
    }

    /// Stop only the tracks of `self` that `other` does not also hold.
    pub fn stop_tracks_not_in(&self, other: &MediaStream) {
        for track in &self.tracks {
            if !other.tracks.iter().any(|o| Arc::ptr_eq(track, o)) {
                track.stop();
            }
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.id().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTrack;

    #[test]
    fn merged_stream_shares_tracks() {
        let cam = LoopbackTrack::new("cam-1", MediaKind::Video, "Front camera");
        let mic = LoopbackTrack::new("mic-1", MediaKind::Audio, "Built-in mic");
        let video = MediaStream::new("v", vec![cam.clone()]);
        let audio = MediaStream::new("a", vec![mic.clone()]);

        let outbound = MediaStream::merged("out", &[&video, &audio]);
        assert_eq!(outbound.tracks().len(), 2);
        assert!(outbound.has_kind(MediaKind::Audio));
        assert!(outbound.has_kind(MediaKind::Video));

        video.stop_all();
        assert_eq!(cam.stop_count(), 1);
        assert!(outbound.is_live());

        audio.stop_all();
        assert!(!outbound.is_live());
    }

    #[test]
    fn same_tracks_compares_track_identity() {
        let cam = LoopbackTrack::new("cam-1", MediaKind::Video, "cam");
        let a = MediaStream::new("s", vec![cam.clone()]);
        let b = MediaStream::new("s", vec![cam.clone()]);
        let other = LoopbackTrack::new("cam-1", MediaKind::Video, "cam");
        let c = MediaStream::new("s", vec![other.clone()]);

        assert!(a.same_tracks(&b));
        assert!(!a.same_tracks(&c));

        a.stop_tracks_not_in(&b);
        assert_eq!(cam.stop_count(), 0);
        c.stop_tracks_not_in(&a);
        assert_eq!(other.stop_count(), 1);
    }

    #[test]
    fn empty_stream_has_no_kinds() {
        let stream = MediaStream::empty("nothing");
        assert!(stream.is_empty());
        assert!(!stream.has_kind(MediaKind::Video));
        assert!(!stream.is_live());
    }
}
