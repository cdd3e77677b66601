//! In-process transport and device layer.
//!
//! `LoopbackNetwork` behaves like a signaling broker plus peer library living
//! in one process: peers register under ids, connect and call each other, and
//! every object reports through the same event channels a real transport
//! would use. `LoopbackDevices` hands out counted fake tracks. Together they
//! let a shell or a test run whole meetings without a browser.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;

use crate::devices::{
    AcquireError, DeviceInfo, DeviceKind, MediaConstraints, MediaDevices, PermissionKind,
    PermissionState,
};
use crate::media::{MediaKind, MediaStream, MediaTrack};
use crate::transport::{
    CallEvent, CallEvents, DataConnection, DataEvent, DataEvents, MediaCall, Peer, PeerEvent,
    PeerEvents, PeerId, PeerTransport, TransportError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

/// Fake capture track that counts how often it was stopped.
pub struct LoopbackTrack {
    id: String,
    kind: MediaKind,
    label: String,
    live: AtomicBool,
    stops: AtomicUsize,
}

impl LoopbackTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            label: label.into(),
            live: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// What the receiving side of a call gets: fresh tracks under the sender's
/// stream id, so stopping a received stream never touches the sender's
/// capture.
fn mirror_stream(stream: &MediaStream) -> MediaStream {
    let tracks = stream
        .tracks()
        .iter()
        .map(|t| {
            let track: Arc<dyn MediaTrack> =
                LoopbackTrack::new(format!("remote-{}", t.id()), t.kind(), t.label());
            track
        })
        .collect();
    MediaStream::new(stream.id(), tracks)
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetworkInner {
    peers: Mutex<HashMap<PeerId, Arc<PeerShared>>>,
    created: AtomicUsize,
}

/// In-memory peer registry implementing [`PeerTransport`].
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers currently registered and reachable.
    pub fn live_peers(&self) -> usize {
        lock(&self.inner.peers).len()
    }

    /// Peers ever created on this network, including failed registrations.
    pub fn created_peers(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.inner.peers).contains_key(id)
    }

    fn lookup(&self, id: &str) -> Option<Arc<PeerShared>> {
        lock(&self.inner.peers)
            .get(id)
            .filter(|p| !p.destroyed.load(Ordering::SeqCst))
            .cloned()
    }

    fn unregister(&self, shared: &Arc<PeerShared>) {
        let mut peers = lock(&self.inner.peers);
        if peers.get(&shared.id).is_some_and(|p| Arc::ptr_eq(p, shared)) {
            peers.remove(&shared.id);
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackNetwork {
    async fn create_peer(&self, id: Option<&str>) -> Result<(Arc<dyn Peer>, PeerEvents), TransportError> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared {
            id: id.clone(),
            events: tx,
            destroyed: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        });
        self.inner.created.fetch_add(1, Ordering::SeqCst);

        let registered = {
            let mut peers = lock(&self.inner.peers);
            if peers.contains_key(&id) {
                false
            } else {
                peers.insert(id.clone(), shared.clone());
                true
            }
        };

        if registered {
            let _ = shared.events.send(PeerEvent::Open(id));
        } else {
            shared.destroyed.store(true, Ordering::SeqCst);
            let _ = shared.events.send(PeerEvent::Error(TransportError::UnavailableId(id)));
        }

        let peer: Arc<dyn Peer> = Arc::new(LoopbackPeer { shared, network: self.clone() });
        Ok((peer, rx))
    }
}

struct PeerShared {
    id: PeerId,
    events: UnboundedSender<PeerEvent>,
    destroyed: AtomicBool,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
    calls: Mutex<Vec<Arc<LoopbackCall>>>,
}

pub struct LoopbackPeer {
    shared: Arc<PeerShared>,
    network: LoopbackNetwork,
}

#[async_trait]
impl Peer for LoopbackPeer {
    fn id(&self) -> PeerId {
        self.shared.id.clone()
    }

    async fn connect(&self, target: &str) -> Result<(Arc<dyn DataConnection>, DataEvents), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let local = LoopbackConnection::new(self.shared.id.clone(), target.to_string(), local_tx);
        lock(&self.shared.connections).push(local.clone());

        let Some(remote_peer) = self.network.lookup(target) else {
            local.open.store(false, Ordering::SeqCst);
            let _ = local.events.send(DataEvent::Error(TransportError::PeerUnavailable(
                target.to_string(),
            )));
            return Ok((local as Arc<dyn DataConnection>, local_rx));
        };

        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let remote = LoopbackConnection::new(target.to_string(), self.shared.id.clone(), remote_tx);
        *lock(&local.other) = Arc::downgrade(&remote);
        *lock(&remote.other) = Arc::downgrade(&local);
        lock(&remote_peer.connections).push(remote.clone());

        let _ = remote_peer
            .events
            .send(PeerEvent::Connection(remote.clone(), remote_rx));
        let _ = remote.events.send(DataEvent::Open);
        let _ = local.events.send(DataEvent::Open);

        Ok((local as Arc<dyn DataConnection>, local_rx))
    }

    async fn call(
        &self,
        target: &str,
        stream: MediaStream,
    ) -> Result<(Arc<dyn MediaCall>, CallEvents), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let local = LoopbackCall::new(target.to_string(), local_tx, Some(stream));
        lock(&self.shared.calls).push(local.clone());

        let Some(remote_peer) = self.network.lookup(target) else {
            let _ = local.events.send(CallEvent::Error(TransportError::PeerUnavailable(
                target.to_string(),
            )));
            return Ok((local as Arc<dyn MediaCall>, local_rx));
        };

        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let remote = LoopbackCall::new(self.shared.id.clone(), remote_tx, None);
        *lock(&local.other) = Arc::downgrade(&remote);
        *lock(&remote.other) = Arc::downgrade(&local);
        lock(&remote_peer.calls).push(remote.clone());

        let _ = remote_peer.events.send(PeerEvent::Call(remote, remote_rx));
        Ok((local as Arc<dyn MediaCall>, local_rx))
    }

    fn disconnect(&self) {
        self.network.unregister(&self.shared);
    }

    fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.unregister(&self.shared);
        let connections: Vec<_> = lock(&self.shared.connections).drain(..).collect();
        for conn in connections {
            conn.close();
        }
        let calls: Vec<_> = lock(&self.shared.calls).drain(..).collect();
        for call in calls {
            call.close();
        }
        let _ = self.shared.events.send(PeerEvent::Closed);
    }

    fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Data connections
// ---------------------------------------------------------------------------

pub struct LoopbackConnection {
    local: PeerId,
    remote: PeerId,
    events: UnboundedSender<DataEvent>,
    open: AtomicBool,
    other: Mutex<Weak<LoopbackConnection>>,
}

impl LoopbackConnection {
    fn new(local: PeerId, remote: PeerId, events: UnboundedSender<DataEvent>) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            events,
            open: AtomicBool::new(true),
            other: Mutex::new(Weak::new()),
        })
    }

    fn close_end(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(DataEvent::Closed);
        }
    }
}

impl DataConnection for LoopbackConnection {
    fn peer(&self) -> PeerId {
        self.remote.clone()
    }

    fn send(&self, payload: serde_json::Value) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Network(format!(
                "connection {} -> {} is closed",
                self.local, self.remote
            )));
        }
        let other = lock(&self.other).upgrade();
        match other {
            Some(other) if other.open.load(Ordering::SeqCst) => {
                let _ = other.events.send(DataEvent::Data(payload));
                Ok(())
            }
            _ => Err(TransportError::PeerUnavailable(self.remote.clone())),
        }
    }

    fn close(&self) {
        self.close_end();
        if let Some(other) = lock(&self.other).upgrade() {
            other.close_end();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Media calls
// ---------------------------------------------------------------------------

pub struct LoopbackCall {
    remote: PeerId,
    events: UnboundedSender<CallEvent>,
    /// Stream offered by the caller; `None` on the answering end.
    offered: Option<MediaStream>,
    open: AtomicBool,
    other: Mutex<Weak<LoopbackCall>>,
}

impl LoopbackCall {
    fn new(
        remote: PeerId,
        events: UnboundedSender<CallEvent>,
        offered: Option<MediaStream>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            events,
            offered,
            open: AtomicBool::new(true),
            other: Mutex::new(Weak::new()),
        })
    }

    fn close_end(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(CallEvent::Closed);
        }
    }
}

impl MediaCall for LoopbackCall {
    fn peer(&self) -> PeerId {
        self.remote.clone()
    }

    fn answer(&self, stream: MediaStream) {
        let Some(caller) = lock(&self.other).upgrade() else {
            let _ = self
                .events
                .send(CallEvent::Error(TransportError::PeerUnavailable(self.remote.clone())));
            return;
        };
        if !self.open.load(Ordering::SeqCst) || !caller.open.load(Ordering::SeqCst) {
            return;
        }
        if let Some(offered) = &caller.offered {
            let _ = self.events.send(CallEvent::Stream(mirror_stream(offered)));
        }
        let _ = caller.events.send(CallEvent::Stream(mirror_stream(&stream)));
    }

    fn close(&self) {
        self.close_end();
        if let Some(other) = lock(&self.other).upgrade() {
            other.close_end();
        }
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

struct DevicesState {
    devices: Vec<DeviceInfo>,
    permissions: HashMap<PermissionKind, PermissionState>,
    failures: HashMap<String, AcquireError>,
    display_failure: Option<AcquireError>,
    output_selection: bool,
    sink: Option<String>,
    issued: Vec<Arc<LoopbackTrack>>,
    acquisitions: usize,
    pending: usize,
}

/// Fake [`MediaDevices`] with a configurable device list.
///
/// Permissions start out granted. Acquisitions can be held with
/// [`LoopbackDevices::hold_acquisitions`] to exercise teardown while a
/// capture request is still in flight.
pub struct LoopbackDevices {
    state: Mutex<DevicesState>,
    gate: watch::Sender<bool>,
}

impl LoopbackDevices {
    /// One camera, a default microphone and a default speaker.
    pub fn new() -> Self {
        Self::with_devices(vec![
            DeviceInfo {
                device_id: "default".into(),
                label: "Default - Built-in Microphone".into(),
                kind: DeviceKind::AudioInput,
            },
            DeviceInfo {
                device_id: "default".into(),
                label: "Default - Built-in Speakers".into(),
                kind: DeviceKind::AudioOutput,
            },
            DeviceInfo {
                device_id: "camera-1".into(),
                label: "Integrated Camera".into(),
                kind: DeviceKind::VideoInput,
            },
        ])
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        let permissions = HashMap::from([
            (PermissionKind::Camera, PermissionState::Granted),
            (PermissionKind::Microphone, PermissionState::Granted),
        ]);
        let (gate, _) = watch::channel(false);
        Self {
            state: Mutex::new(DevicesState {
                devices,
                permissions,
                failures: HashMap::new(),
                display_failure: None,
                output_selection: true,
                sink: None,
                issued: Vec::new(),
                acquisitions: 0,
                pending: 0,
            }),
            gate,
        }
    }

    pub fn add_device(&self, device: DeviceInfo) {
        lock(&self.state).devices.push(device);
    }

    pub fn set_permission(&self, kind: PermissionKind, state: PermissionState) {
        lock(&self.state).permissions.insert(kind, state);
    }

    /// Make every capture request for `device_id` fail with `error`.
    pub fn fail_device(&self, device_id: &str, error: AcquireError) {
        lock(&self.state).failures.insert(device_id.to_string(), error);
    }

    pub fn fail_display(&self, error: AcquireError) {
        lock(&self.state).display_failure = Some(error);
    }

    pub fn set_output_selection(&self, supported: bool) {
        lock(&self.state).output_selection = supported;
    }

    pub fn sink(&self) -> Option<String> {
        lock(&self.state).sink.clone()
    }

    /// Every track handed out so far, in issue order.
    pub fn issued_tracks(&self) -> Vec<Arc<LoopbackTrack>> {
        lock(&self.state).issued.clone()
    }

    pub fn live_tracks(&self) -> usize {
        lock(&self.state).issued.iter().filter(|t| t.is_live()).count()
    }

    /// Completed capture requests (user and display media).
    pub fn acquisitions(&self) -> usize {
        lock(&self.state).acquisitions
    }

    /// Capture requests currently parked on the gate.
    pub fn pending_acquisitions(&self) -> usize {
        lock(&self.state).pending
    }

    pub fn hold_acquisitions(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_acquisitions(&self) {
        self.gate.send_replace(false);
    }

    async fn pass_gate(&self) {
        let mut rx = self.gate.subscribe();
        if *rx.borrow() {
            lock(&self.state).pending += 1;
            let _ = rx.wait_for(|held| !*held).await;
            lock(&self.state).pending -= 1;
        }
    }

    fn issue(&self, state: &mut DevicesState, device: &DeviceInfo, kind: MediaKind) -> Arc<dyn MediaTrack> {
        let track = LoopbackTrack::new(
            format!("{}-{}", device.device_id, state.issued.len()),
            kind,
            device.label.clone(),
        );
        state.issued.push(track.clone());
        track
    }

    fn resolve(
        &self,
        state: &mut DevicesState,
        device_id: &str,
        kind: DeviceKind,
        permission: PermissionKind,
    ) -> Result<DeviceInfo, AcquireError> {
        if state.permissions.get(&permission) == Some(&PermissionState::Denied) {
            return Err(AcquireError::NotAllowed);
        }
        if let Some(err) = state.failures.get(device_id) {
            return Err(err.clone());
        }
        state
            .devices
            .iter()
            .find(|d| d.kind == kind && d.device_id == device_id)
            .cloned()
            .ok_or_else(|| AcquireError::Overconstrained(format!("deviceId {device_id}")))
    }
}

impl Default for LoopbackDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, AcquireError> {
        Ok(lock(&self.state).devices.clone())
    }

    async fn query_permission(&self, kind: PermissionKind) -> Result<PermissionState, AcquireError> {
        Ok(lock(&self.state)
            .permissions
            .get(&kind)
            .copied()
            .unwrap_or_default())
    }

    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, AcquireError> {
        self.pass_gate().await;

        let mut state = lock(&self.state);
        let mut tracks = Vec::new();
        if let Some(id) = &constraints.video {
            let device = self.resolve(&mut state, id, DeviceKind::VideoInput, PermissionKind::Camera)?;
            tracks.push((device, MediaKind::Video));
        }
        if let Some(id) = &constraints.audio {
            let device =
                self.resolve(&mut state, id, DeviceKind::AudioInput, PermissionKind::Microphone)?;
            tracks.push((device, MediaKind::Audio));
        }

        let tracks = tracks
            .iter()
            .map(|(device, kind)| self.issue(&mut state, device, *kind))
            .collect();
        state.acquisitions += 1;
        Ok(MediaStream::new(uuid::Uuid::new_v4().to_string(), tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream, AcquireError> {
        self.pass_gate().await;

        let mut state = lock(&self.state);
        if let Some(err) = &state.display_failure {
            return Err(err.clone());
        }
        let screen = DeviceInfo {
            device_id: "screen".into(),
            label: "Entire screen".into(),
            kind: DeviceKind::VideoInput,
        };
        let track = self.issue(&mut state, &screen, MediaKind::Video);
        state.acquisitions += 1;
        Ok(MediaStream::new(uuid::Uuid::new_v4().to_string(), vec![track]))
    }

    fn supports_output_selection(&self) -> bool {
        lock(&self.state).output_selection
    }

    async fn set_sink_id(&self, device_id: &str) -> Result<(), AcquireError> {
        let mut state = lock(&self.state);
        if !state.output_selection {
            return Err(AcquireError::Other("output selection unsupported".into()));
        }
        let known = state
            .devices
            .iter()
            .any(|d| d.kind == DeviceKind::AudioOutput && d.device_id == device_id);
        if !known {
            return Err(AcquireError::Other(format!("unknown output device {device_id}")));
        }
        state.sink = Some(device_id.to_string());
        Ok(())
    }
}
