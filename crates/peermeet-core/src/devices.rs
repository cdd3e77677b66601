use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::MeetError;
use crate::media::MediaStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionKind {
    Camera,
    Microphone,
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionKind::Camera => f.write_str("camera"),
            PermissionKind::Microphone => f.write_str("microphone"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PermissionState {
    Granted,
    Denied,
    #[default]
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermissionSnapshot {
    pub camera: PermissionState,
    pub microphone: PermissionState,
}

impl PermissionSnapshot {
    pub fn get(&self, kind: PermissionKind) -> PermissionState {
        match kind {
            PermissionKind::Camera => self.camera,
            PermissionKind::Microphone => self.microphone,
        }
    }
}

/// Exact-device constraints for a capture request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl MediaConstraints {
    pub fn video(device_id: impl Into<String>) -> Self {
        Self { video: Some(device_id.into()), audio: None }
    }

    pub fn audio(device_id: impl Into<String>) -> Self {
        Self { video: None, audio: Some(device_id.into()) }
    }
}

/// Failures reported by the device layer, named after the browser errors
/// they stand for.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("OverconstrainedError: {0}")]
    Overconstrained(String),
    #[error("NotAllowedError")]
    NotAllowed,
    #[error("{0}")]
    Other(String),
}

impl AcquireError {
    pub fn into_meet_error(self, kind: PermissionKind) -> MeetError {
        match self {
            AcquireError::Overconstrained(c) => MeetError::ConstraintsUnsatisfiable(c),
            AcquireError::NotAllowed => MeetError::PermissionDenied { kind },
            AcquireError::Other(msg) => MeetError::Device(msg),
        }
    }
}

/// Native device and permission capabilities.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, AcquireError>;

    async fn query_permission(&self, kind: PermissionKind) -> Result<PermissionState, AcquireError>;

    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, AcquireError>;

    async fn get_display_media(&self) -> Result<MediaStream, AcquireError>;

    /// Whether the environment can route audio to a chosen output device.
    fn supports_output_selection(&self) -> bool;

    async fn set_sink_id(&self, device_id: &str) -> Result<(), AcquireError>;
}

/// Device lists shown on the setup screen.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    cameras: Vec<DeviceInfo>,
    microphones: Vec<DeviceInfo>,
    speakers: Vec<DeviceInfo>,
    default_camera: Option<String>,
    default_microphone: Option<String>,
    default_speaker: Option<String>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the lists from a fresh enumeration.
    pub async fn refresh(&mut self, devices: &dyn MediaDevices) -> Result<(), MeetError> {
        let list = devices
            .enumerate_devices()
            .await
            .map_err(|e| MeetError::Device(format!("enumerate devices: {e}")))?;
        self.populate(list);
        Ok(())
    }

    fn populate(&mut self, list: Vec<DeviceInfo>) {
        *self = Self::default();
        for device in list {
            if device.device_id.is_empty() {
                continue;
            }
            match device.kind {
                DeviceKind::AudioInput => self.microphones.push(device),
                DeviceKind::AudioOutput => self.speakers.push(device),
                DeviceKind::VideoInput => {
                    self.default_camera = Some(device.device_id.clone());
                    self.cameras.push(device);
                }
            }
        }
        self.default_microphone = Self::pick_default(&self.microphones);
        self.default_speaker = Self::pick_default(&self.speakers);
        tracing::debug!(
            cameras = self.cameras.len(),
            microphones = self.microphones.len(),
            speakers = self.speakers.len(),
            "device catalog refreshed"
        );
    }

    fn pick_default(list: &[DeviceInfo]) -> Option<String> {
        list.iter()
            .find(|d| d.device_id == "default")
            .or_else(|| list.first())
            .map(|d| d.device_id.clone())
    }

    /// Query camera and microphone permission. A failed query reads as
    /// `Prompt`.
    pub async fn check_permissions(devices: &dyn MediaDevices) -> PermissionSnapshot {
        let mut snapshot = PermissionSnapshot::default();
        for kind in [PermissionKind::Camera, PermissionKind::Microphone] {
            let state = match devices.query_permission(kind).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("error checking {kind} permission: {e}");
                    PermissionState::Prompt
                }
            };
            match kind {
                PermissionKind::Camera => snapshot.camera = state,
                PermissionKind::Microphone => snapshot.microphone = state,
            }
        }
        snapshot
    }

    pub fn cameras(&self) -> &[DeviceInfo] {
        &self.cameras
    }

    pub fn microphones(&self) -> &[DeviceInfo] {
        &self.microphones
    }

    pub fn speakers(&self) -> &[DeviceInfo] {
        &self.speakers
    }

    pub fn default_device(&self, kind: DeviceKind) -> Option<&str> {
        match kind {
            DeviceKind::VideoInput => self.default_camera.as_deref(),
            DeviceKind::AudioInput => self.default_microphone.as_deref(),
            DeviceKind::AudioOutput => self.default_speaker.as_deref(),
        }
    }

    pub fn find(&self, kind: DeviceKind, device_id: &str) -> Option<&DeviceInfo> {
        let list = match kind {
            DeviceKind::VideoInput => &self.cameras,
            DeviceKind::AudioInput => &self.microphones,
            DeviceKind::AudioOutput => &self.speakers,
        };
        list.iter().find(|d| d.device_id == device_id)
    }
}
