use std::sync::Arc;

use crate::chat::ChatMessage;
use crate::errors::{MeetError, Remediation};
use crate::media::MediaKind;
use crate::room_id::RoomId;
use crate::session::SessionPhase;
use crate::transport::PeerId;

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone)]
pub enum MeetEvent {
    SessionPhaseChanged(SessionPhase),
    RoomOccupancy { room_id: RoomId, occupied: bool },
    ParticipantJoined(ParticipantInfo),
    ParticipantUpdated(ParticipantInfo),
    ParticipantLeft(PeerId),
    RemoteStreamAdded { peer_id: PeerId, stream_id: String },
    LocalMediaChanged { kind: MediaKind, active: bool },
    ScreenShareChanged(bool),
    DevicesChanged,
    OutputDeviceAttached { device_id: String, outcome: SinkOutcome },
    ChatMessageReceived(ChatMessage),
    Notice(Notice),
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Connecting,
    Connected,
    Disconnected,
}

/// Render-ready view of a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub peer_id: PeerId,
    pub display_name: Option<String>,
    pub state: ParticipantState,
    pub stream_id: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    Attached,
    Unsupported,
    Failed(String),
}

/// A failure surfaced to the user together with what to do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub error: MeetError,
    pub remediation: Remediation,
}

impl From<MeetError> for Notice {
    fn from(error: MeetError) -> Self {
        let remediation = error.remediation();
        Self { error, remediation }
    }
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait MeetEventListener: Send + Sync {
    fn on_event(&self, event: MeetEvent);
}

struct FnListener<F>(F);

impl<F> MeetEventListener for FnListener<F>
where
    F: Fn(MeetEvent) + Send + Sync,
{
    fn on_event(&self, event: MeetEvent) {
        (self.0)(event)
    }
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn MeetEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MeetEventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn add_fn<F>(&self, f: F)
    where
        F: Fn(MeetEvent) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(FnListener(f)));
    }

    pub fn emit(&self, event: MeetEvent) {
        // Snapshot so a listener may register another listener.
        let listeners: Vec<_> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl MeetEventListener for CountingListener {
        fn on_event(&self, _event: MeetEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(MeetEvent::SessionPhaseChanged(SessionPhase::Probing));

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closure_listener_receives_events_in_order() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        emitter.add_fn(move |event| {
            if let MeetEvent::ParticipantLeft(peer) = event {
                sink.lock().unwrap().push(peer);
            }
        });

        emitter.emit(MeetEvent::ParticipantLeft("p1".to_string()));
        emitter.emit(MeetEvent::SessionEnded);
        emitter.emit(MeetEvent::ParticipantLeft("p2".to_string()));

        assert_eq!(*seen.lock().unwrap(), vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn notice_carries_remediation() {
        let notice = Notice::from(MeetError::Connection("gone".into()));
        assert_eq!(notice.remediation, Remediation::ReturnToSetup);
    }
}
