//! PeerMeet core: peer-to-peer meeting rooms.
//!
//! Pure Rust crate with no platform dependencies. Browser and native shells
//! plug in a [`transport::PeerTransport`] and a [`devices::MediaDevices`]
//! implementation and render from [`events::MeetEvent`]s.

pub mod chat;
pub mod controls;
pub mod devices;
pub mod errors;
pub mod events;
pub mod loopback;
pub mod media;
pub mod participants;
pub mod room_id;
pub mod session;
pub mod settings;
pub mod transport;

pub use chat::{Attachment, ChatChannel, ChatMessage};
pub use controls::{LocalMediaController, LocalSessionState};
pub use errors::{MeetError, Remediation};
pub use events::{EventEmitter, MeetEvent, MeetEventListener, ParticipantInfo};
pub use media::{MediaKind, MediaStream, MediaTrack};
pub use room_id::RoomId;
pub use session::{RoomHandle, RoomRole, RoomSession, SessionConfig, SessionPhase};
pub use settings::{Settings, SettingsError, SettingsStore};
