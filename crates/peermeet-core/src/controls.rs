use std::sync::Arc;

use tokio::sync::Mutex;

use crate::devices::{
    DeviceKind, MediaConstraints, MediaDevices, PermissionKind, PermissionSnapshot, PermissionState,
};
use crate::errors::MeetError;
use crate::events::{EventEmitter, MeetEvent, Notice, SinkOutcome};
use crate::media::{MediaKind, MediaStream};

/// Local media flags and selections. Only `LocalMediaController` writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSessionState {
    pub camera_active: bool,
    pub microphone_active: bool,
    pub screen_share_active: bool,
    pub camera_device: Option<String>,
    pub microphone_device: Option<String>,
    pub speaker_device: Option<String>,
    pub permissions: PermissionSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Camera,
    Microphone,
    Screen,
}

impl Source {
    fn permission(self) -> Option<PermissionKind> {
        match self {
            Source::Camera => Some(PermissionKind::Camera),
            Source::Microphone => Some(PermissionKind::Microphone),
            Source::Screen => None,
        }
    }

    fn event(self, active: bool) -> MeetEvent {
        match self {
            Source::Camera => MeetEvent::LocalMediaChanged { kind: MediaKind::Video, active },
            Source::Microphone => MeetEvent::LocalMediaChanged { kind: MediaKind::Audio, active },
            Source::Screen => MeetEvent::ScreenShareChanged(active),
        }
    }
}

/// One owned local stream. `epoch` moves on every stop so an acquisition
/// that started before the stop can tell it lost the race.
#[derive(Default)]
struct Slot {
    stream: Option<MediaStream>,
    pending: bool,
    epoch: u64,
}

struct Inner {
    state: LocalSessionState,
    camera: Slot,
    microphone: Slot,
    screen: Slot,
}

impl Inner {
    fn slot(&mut self, source: Source) -> &mut Slot {
        match source {
            Source::Camera => &mut self.camera,
            Source::Microphone => &mut self.microphone,
            Source::Screen => &mut self.screen,
        }
    }

    fn set_active(&mut self, source: Source, active: bool) {
        match source {
            Source::Camera => self.state.camera_active = active,
            Source::Microphone => self.state.microphone_active = active,
            Source::Screen => self.state.screen_share_active = active,
        }
    }
}

/// Controls for local media (camera, microphone, screen share, speaker).
///
/// Sole owner of the local capture streams: nothing else starts or stops
/// their tracks.
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    emitter: EventEmitter,
    outbound_id: String,
    inner: Arc<Mutex<Inner>>,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, emitter: EventEmitter) -> Self {
        Self {
            devices,
            emitter,
            outbound_id: uuid::Uuid::new_v4().to_string(),
            inner: Arc::new(Mutex::new(Inner {
                state: LocalSessionState::default(),
                camera: Slot::default(),
                microphone: Slot::default(),
                screen: Slot::default(),
            })),
        }
    }

    pub async fn start_camera(&self, device_id: &str) -> Result<(), MeetError> {
        self.start(Source::Camera, Some(device_id)).await
    }

    pub async fn stop_camera(&self) {
        self.stop(Source::Camera).await;
    }

    pub async fn start_microphone(&self, device_id: &str) -> Result<(), MeetError> {
        self.start(Source::Microphone, Some(device_id)).await
    }

    pub async fn stop_microphone(&self) {
        self.stop(Source::Microphone).await;
    }

    pub async fn start_screen_share(&self) -> Result<(), MeetError> {
        self.start(Source::Screen, None).await
    }

    pub async fn stop_screen_share(&self) {
        self.stop(Source::Screen).await;
    }

    /// Camera button: start with the selected camera, or stop.
    pub async fn toggle_camera(&self) -> Result<bool, MeetError> {
        self.toggle(Source::Camera).await
    }

    /// Microphone button: start with the selected microphone, or stop.
    pub async fn toggle_microphone(&self) -> Result<bool, MeetError> {
        self.toggle(Source::Microphone).await
    }

    async fn toggle(&self, source: Source) -> Result<bool, MeetError> {
        let (active, device) = {
            let mut inner = self.inner.lock().await;
            let active = inner.slot(source).stream.is_some();
            let device = match source {
                Source::Camera => inner.state.camera_device.clone(),
                Source::Microphone => inner.state.microphone_device.clone(),
                Source::Screen => None,
            };
            (active, device)
        };

        if active {
            self.stop(source).await;
            return Ok(false);
        }
        if source != Source::Screen && device.is_none() {
            return Err(MeetError::Device(format!("no {source:?} selected").to_lowercase()));
        }
        self.start(source, device.as_deref()).await?;
        Ok(self.inner.lock().await.slot(source).stream.is_some())
    }

    /// Change the selected input device. An active stream is stopped and
    /// re-acquired on the new device; an inactive one stays off.
    pub async fn switch_device(&self, kind: DeviceKind, device_id: &str) -> Result<(), MeetError> {
        let source = match kind {
            DeviceKind::VideoInput => Source::Camera,
            DeviceKind::AudioInput => Source::Microphone,
            DeviceKind::AudioOutput => {
                self.attach_output_device(device_id).await;
                return Ok(());
            }
        };

        let was_active = {
            let mut inner = self.inner.lock().await;
            Self::record_selection(&mut inner.state, source, device_id);
            let slot = inner.slot(source);
            slot.stream.is_some() || slot.pending
        };
        tracing::info!("switching {source:?} to {device_id} (active: {was_active})");

        if was_active {
            self.stop(source).await;
            self.start(source, Some(device_id)).await?;
        }
        Ok(())
    }

    /// Route remote audio to `speaker_id`. Best-effort: never an error.
    pub async fn attach_output_device(&self, speaker_id: &str) -> SinkOutcome {
        self.inner.lock().await.state.speaker_device = Some(speaker_id.to_string());

        let outcome = if !self.devices.supports_output_selection() {
            tracing::info!("output device selection not supported");
            SinkOutcome::Unsupported
        } else {
            match self.devices.set_sink_id(speaker_id).await {
                Ok(()) => {
                    tracing::info!("audio output device attached: {speaker_id}");
                    SinkOutcome::Attached
                }
                Err(e) => {
                    tracing::warn!("error attaching audio output device {speaker_id}: {e}");
                    SinkOutcome::Failed(e.to_string())
                }
            }
        };

        self.emitter.emit(MeetEvent::OutputDeviceAttached {
            device_id: speaker_id.to_string(),
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Currently active local tracks as one stream, for placing or answering
    /// calls. Acquisitions still in flight are not part of it.
    pub async fn outbound_stream(&self) -> MediaStream {
        let inner = self.inner.lock().await;
        let parts: Vec<&MediaStream> = [&inner.camera, &inner.microphone, &inner.screen]
            .into_iter()
            .filter_map(|slot| slot.stream.as_ref())
            .collect();
        MediaStream::merged(self.outbound_id.clone(), &parts)
    }

    /// Stop every local track, then drop every local reference.
    ///
    /// Safe from any state and idempotent. Acquisitions still in flight are
    /// invalidated and their streams stopped when they resolve.
    pub async fn release_all(&self) {
        let mut changed = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let sources = [Source::Camera, Source::Microphone, Source::Screen];

            for source in sources {
                let slot = inner.slot(source);
                slot.epoch += 1;
                slot.pending = false;
                if let Some(stream) = &slot.stream {
                    stream.stop_all();
                }
            }
            for source in sources {
                if inner.slot(source).stream.take().is_some() {
                    changed.push(source);
                }
                inner.set_active(source, false);
            }
        }

        for source in changed {
            self.emitter.emit(source.event(false));
        }
        tracing::debug!("local media released");
    }

    pub async fn set_permissions(&self, permissions: PermissionSnapshot) {
        self.inner.lock().await.state.permissions = permissions;
    }

    /// Record a device choice without touching any stream.
    pub async fn select_device(&self, kind: DeviceKind, device_id: &str) {
        let mut inner = self.inner.lock().await;
        match kind {
            DeviceKind::VideoInput => Self::record_selection(&mut inner.state, Source::Camera, device_id),
            DeviceKind::AudioInput => {
                Self::record_selection(&mut inner.state, Source::Microphone, device_id)
            }
            DeviceKind::AudioOutput => inner.state.speaker_device = Some(device_id.to_string()),
        }
    }

    pub async fn state(&self) -> LocalSessionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_camera_active(&self) -> bool {
        self.inner.lock().await.state.camera_active
    }

    pub async fn is_microphone_active(&self) -> bool {
        self.inner.lock().await.state.microphone_active
    }

    pub async fn is_screen_sharing(&self) -> bool {
        self.inner.lock().await.state.screen_share_active
    }

    fn record_selection(state: &mut LocalSessionState, source: Source, device_id: &str) {
        match source {
            Source::Camera => state.camera_device = Some(device_id.to_string()),
            Source::Microphone => state.microphone_device = Some(device_id.to_string()),
            Source::Screen => {}
        }
    }

    async fn start(&self, source: Source, device_id: Option<&str>) -> Result<(), MeetError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            let slot = inner.slot(source);
            if slot.stream.is_some() || slot.pending {
                tracing::debug!("{source:?} already active, start ignored");
                return Ok(());
            }

            if let Some(kind) = source.permission() {
                if inner.state.permissions.get(kind) == PermissionState::Denied {
                    drop(inner);
                    return Err(self.surface(MeetError::PermissionDenied { kind }));
                }
            }

            if let Some(id) = device_id {
                Self::record_selection(&mut inner.state, source, id);
            }
            let slot = inner.slot(source);
            slot.pending = true;
            slot.epoch
        };

        let result = match (source, device_id) {
            (Source::Screen, _) => self.devices.get_display_media().await,
            (Source::Camera, Some(id)) => self.devices.get_user_media(MediaConstraints::video(id)).await,
            (Source::Microphone, Some(id)) => {
                self.devices.get_user_media(MediaConstraints::audio(id)).await
            }
            (_, None) => Ok(MediaStream::empty(uuid::Uuid::new_v4().to_string())),
        };

        let mut inner = self.inner.lock().await;
        let slot = inner.slot(source);
        if slot.epoch != epoch {
            // Stopped or released while the device layer was working.
            if let Ok(stream) = result {
                tracing::info!("{source:?} acquisition resolved after stop, discarding");
                stream.stop_all();
            }
            return Ok(());
        }
        slot.pending = false;

        match result {
            Ok(stream) => {
                tracing::info!("{source:?} started (stream {})", stream.id());
                slot.stream = Some(stream);
                inner.set_active(source, true);
                drop(inner);
                self.emitter.emit(source.event(true));
                Ok(())
            }
            Err(e) => {
                drop(inner);
                let error = match source.permission() {
                    Some(kind) => e.into_meet_error(kind),
                    None => MeetError::Device(format!("screen capture: {e}")),
                };
                Err(self.surface(error))
            }
        }
    }

    async fn stop(&self, source: Source) {
        let stopped = {
            let mut inner = self.inner.lock().await;
            let slot = inner.slot(source);
            slot.epoch += 1;
            slot.pending = false;
            let stream = slot.stream.take();
            inner.set_active(source, false);
            stream
        };

        if let Some(stream) = stopped {
            stream.stop_all();
            tracing::info!("{source:?} stopped (stream {})", stream.id());
            self.emitter.emit(source.event(false));
        }
    }

    fn surface(&self, error: MeetError) -> MeetError {
        tracing::warn!("local media: {error}");
        self.emitter.emit(MeetEvent::Notice(Notice::from(error.clone())));
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::AcquireError;
    use crate::loopback::LoopbackDevices;

    fn controller() -> (LocalMediaController, Arc<LoopbackDevices>) {
        let devices = Arc::new(LoopbackDevices::new());
        (LocalMediaController::new(devices.clone(), EventEmitter::new()), devices)
    }

    #[tokio::test]
    async fn start_stop_sequence_matches_collapsed_parity() {
        let (ctl, devices) = controller();
        // start, start (no-op), stop, stop (no-op), start
        ctl.start_camera("camera-1").await.unwrap();
        ctl.start_camera("camera-1").await.unwrap();
        assert!(ctl.is_camera_active().await);
        ctl.stop_camera().await;
        ctl.stop_camera().await;
        assert!(!ctl.is_camera_active().await);
        ctl.start_camera("camera-1").await.unwrap();
        assert!(ctl.is_camera_active().await);

        assert_eq!(devices.acquisitions(), 2);
        assert_eq!(devices.live_tracks(), 1);
    }

    #[tokio::test]
    async fn stop_from_idle_is_harmless() {
        let (ctl, _) = controller();
        ctl.stop_camera().await;
        ctl.stop_microphone().await;
        ctl.stop_screen_share().await;
        assert!(!ctl.state().await.camera_active);
    }

    #[tokio::test]
    async fn switching_active_microphone_stops_old_tracks_once() {
        let devices = Arc::new(LoopbackDevices::new());
        devices.add_device(crate::devices::DeviceInfo {
            device_id: "usb-mic".into(),
            label: "USB Microphone".into(),
            kind: DeviceKind::AudioInput,
        });
        let ctl = LocalMediaController::new(devices.clone(), EventEmitter::new());

        ctl.start_microphone("default").await.unwrap();
        let old = devices.issued_tracks();
        assert_eq!(old.len(), 1);

        ctl.switch_device(DeviceKind::AudioInput, "usb-mic").await.unwrap();

        assert_eq!(old[0].stop_count(), 1);
        assert!(ctl.is_microphone_active().await);
        let outbound = ctl.outbound_stream().await;
        assert_eq!(outbound.tracks().len(), 1);
        assert!(outbound.tracks()[0].id().starts_with("usb-mic"));
        assert_eq!(ctl.state().await.microphone_device.as_deref(), Some("usb-mic"));
    }

    #[tokio::test]
    async fn switching_inactive_camera_only_records_selection() {
        let (ctl, devices) = controller();
        ctl.switch_device(DeviceKind::VideoInput, "camera-1").await.unwrap();
        assert!(!ctl.is_camera_active().await);
        assert_eq!(devices.acquisitions(), 0);
        assert_eq!(ctl.state().await.camera_device.as_deref(), Some("camera-1"));
    }

    #[tokio::test]
    async fn denied_permission_never_reaches_device_layer() {
        let (ctl, devices) = controller();
        let notices = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = notices.clone();
        ctl.emitter.add_fn(move |event| {
            if let MeetEvent::Notice(n) = event {
                sink.lock().unwrap().push(n);
            }
        });
        ctl.set_permissions(PermissionSnapshot {
            camera: PermissionState::Denied,
            microphone: PermissionState::Granted,
        })
        .await;

        let err = ctl.start_camera("camera-1").await.unwrap_err();
        assert_eq!(err, MeetError::PermissionDenied { kind: PermissionKind::Camera });
        assert_eq!(devices.acquisitions(), 0);
        assert_eq!(notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsatisfiable_device_surfaces_constraint_error() {
        let (ctl, devices) = controller();
        devices.fail_device("camera-1", AcquireError::Overconstrained("1080p".into()));
        let err = ctl.start_camera("camera-1").await.unwrap_err();
        assert!(matches!(err, MeetError::ConstraintsUnsatisfiable(_)));
        assert!(!ctl.is_camera_active().await);
        // The microphone is unaffected.
        ctl.start_microphone("default").await.unwrap();
        assert!(ctl.is_microphone_active().await);
    }

    #[tokio::test]
    async fn acquisition_resolving_after_release_is_stopped() {
        let (ctl, devices) = controller();
        let ctl = Arc::new(ctl);
        devices.hold_acquisitions();

        let pending = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.start_camera("camera-1").await })
        };
        while devices.pending_acquisitions() == 0 {
            tokio::task::yield_now().await;
        }

        ctl.release_all().await;
        devices.release_acquisitions();
        pending.await.unwrap().unwrap();

        let issued = devices.issued_tracks();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].stop_count(), 1);
        assert!(!ctl.is_camera_active().await);
        assert!(ctl.outbound_stream().await.is_empty());
    }

    #[tokio::test]
    async fn release_all_is_idempotent() {
        let (ctl, devices) = controller();
        ctl.start_camera("camera-1").await.unwrap();
        ctl.start_microphone("default").await.unwrap();
        ctl.start_screen_share().await.unwrap();
        assert_eq!(ctl.outbound_stream().await.tracks().len(), 3);

        ctl.release_all().await;
        ctl.release_all().await;

        assert_eq!(devices.live_tracks(), 0);
        assert!(devices.issued_tracks().iter().all(|t| t.stop_count() == 1));
        let state = ctl.state().await;
        assert!(!state.camera_active && !state.microphone_active && !state.screen_share_active);
    }

    #[tokio::test]
    async fn toggles_use_selected_devices() {
        let (ctl, _) = controller();
        assert!(ctl.toggle_camera().await.is_err());

        ctl.select_device(DeviceKind::VideoInput, "camera-1").await;
        assert!(ctl.toggle_camera().await.unwrap());
        assert!(!ctl.toggle_camera().await.unwrap());
    }

    #[tokio::test]
    async fn output_device_is_best_effort() {
        let (ctl, devices) = controller();
        assert_eq!(ctl.attach_output_device("default").await, SinkOutcome::Attached);
        assert_eq!(devices.sink().as_deref(), Some("default"));

        assert!(matches!(ctl.attach_output_device("hdmi").await, SinkOutcome::Failed(_)));

        devices.set_output_selection(false);
        assert_eq!(ctl.attach_output_device("default").await, SinkOutcome::Unsupported);
        assert_eq!(ctl.state().await.speaker_device.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn screen_share_failure_is_reported() {
        let (ctl, devices) = controller();
        devices.fail_display(AcquireError::NotAllowed);
        assert!(ctl.start_screen_share().await.is_err());
        assert!(!ctl.is_screen_sharing().await);
    }
}
