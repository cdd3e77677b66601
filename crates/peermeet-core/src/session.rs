use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chat::{ChatChannel, PeerMessage};
use crate::controls::LocalMediaController;
use crate::devices::{DeviceCatalog, DeviceKind, MediaDevices};
use crate::errors::MeetError;
use crate::events::{EventEmitter, MeetEvent, MeetEventListener, Notice, ParticipantInfo};
use crate::media::MediaStream;
use crate::participants::{ParticipantManager, Upsert};
use crate::room_id::RoomId;
use crate::settings::{Settings, DEFAULT_PROBE_TIMEOUT_MS};
use crate::transport::{
    CallEvent, CallEvents, DataConnection, DataEvent, DataEvents, MediaCall, Peer, PeerEvent,
    PeerEvents, PeerId, PeerTransport, TransportError,
};

/// Where the room session currently is.
///
/// `Hosting` and `Joining` cover the registration and connection steps. Once
/// the session is up it is `Connected` whatever the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Probing,
    Hosting,
    Joining,
    Connected,
    TearingDown,
}

impl SessionPhase {
    pub fn can_transition(self, to: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, to),
            (Idle, Probing)
                | (Idle, Hosting)
                | (Idle, Joining)
                | (Probing, Idle)
                | (Probing, Hosting)
                | (Probing, Joining)
                | (Hosting, Connected)
                | (Joining, Connected)
                | (Probing | Hosting | Joining | Connected, TearingDown)
                | (TearingDown, Idle)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomRole {
    /// Registered under the room id; every joiner connects to it.
    Host,
    Joiner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub display_name: String,
    pub probe_timeout: Duration,
    pub camera_on_join: bool,
    pub microphone_on_join: bool,
    pub preferred_camera: Option<String>,
    pub preferred_microphone: Option<String>,
    pub preferred_speaker: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "Guest".to_string(),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            camera_on_join: false,
            microphone_on_join: true,
            preferred_camera: None,
            preferred_microphone: None,
            preferred_speaker: None,
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            display_name: settings
                .display_name
                .clone()
                .unwrap_or_else(|| "Guest".to_string()),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            camera_on_join: settings.camera_enabled_on_join,
            microphone_on_join: settings.mic_enabled_on_join,
            preferred_camera: settings.preferred_camera.clone(),
            preferred_microphone: settings.preferred_microphone.clone(),
            preferred_speaker: settings.preferred_speaker.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Room handle
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HandleResources {
    peer: Option<Arc<dyn Peer>>,
    connections: HashMap<PeerId, Arc<dyn DataConnection>>,
    calls: HashMap<PeerId, Arc<dyn MediaCall>>,
    tasks: Vec<JoinHandle<()>>,
}

struct HandleInner {
    room_id: RoomId,
    role: RoomRole,
    local_peer_id: PeerId,
    closed: AtomicBool,
    resources: std::sync::Mutex<HandleResources>,
}

/// Everything a live room session owns on the transport side: the local
/// peer, its connections and calls, and the tasks draining their events.
#[derive(Clone)]
pub struct RoomHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.inner.room_id)
            .field("role", &self.inner.role)
            .field("local_peer_id", &self.inner.local_peer_id)
            .finish_non_exhaustive()
    }
}

impl RoomHandle {
    fn new(room_id: RoomId, role: RoomRole, peer: Arc<dyn Peer>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                room_id,
                role,
                local_peer_id: peer.id(),
                closed: AtomicBool::new(false),
                resources: std::sync::Mutex::new(HandleResources {
                    peer: Some(peer),
                    ..HandleResources::default()
                }),
            }),
        }
    }

    fn resources(&self) -> std::sync::MutexGuard<'_, HandleResources> {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    pub fn role(&self) -> RoomRole {
        self.inner.role
    }

    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn is_same(&self, other: &RoomHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn peer(&self) -> Option<Arc<dyn Peer>> {
        self.resources().peer.clone()
    }

    fn track_connection(&self, peer_id: &str, connection: Arc<dyn DataConnection>) {
        if self.is_closed() {
            connection.close();
            return;
        }
        if let Some(old) = self.resources().connections.insert(peer_id.to_string(), connection) {
            old.close();
        }
    }

    fn track_call(&self, peer_id: &str, call: Arc<dyn MediaCall>) {
        if self.is_closed() {
            call.close();
            return;
        }
        if let Some(old) = self.resources().calls.insert(peer_id.to_string(), call) {
            old.close();
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
            return;
        }
        let mut resources = self.resources();
        resources.tasks.retain(|t| !t.is_finished());
        resources.tasks.push(task);
    }

    /// Close and forget the connection and call with one remote peer.
    fn release_peer(&self, peer_id: &str) {
        let (connection, call) = {
            let mut resources = self.resources();
            (resources.connections.remove(peer_id), resources.calls.remove(peer_id))
        };
        if let Some(call) = call {
            call.close();
        }
        if let Some(connection) = connection {
            connection.close();
        }
    }

    /// Close every call and connection, then disconnect and destroy the
    /// local peer. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let resources = std::mem::take(&mut *self.resources());

        for call in resources.calls.into_values() {
            call.close();
        }
        for connection in resources.connections.into_values() {
            connection.close();
        }
        if let Some(peer) = resources.peer {
            peer.disconnect();
            peer.destroy();
        }
        for task in resources.tasks {
            task.abort();
        }
        tracing::info!("room handle for {} closed", self.inner.room_id);
    }
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

type RemoteStreamCallback = Arc<dyn Fn(&ParticipantInfo) + Send + Sync>;

/// State the spawned event tasks need. Cheap to clone.
#[derive(Clone)]
struct Shared {
    display_name: String,
    emitter: EventEmitter,
    controls: Arc<LocalMediaController>,
    participants: Arc<Mutex<ParticipantManager>>,
    chat: ChatChannel,
    phase: Arc<std::sync::Mutex<SessionPhase>>,
    /// Moves on every teardown; an entry that sees it move gives up.
    epoch: Arc<AtomicU64>,
    handle: Arc<Mutex<Option<RoomHandle>>>,
    stream_callbacks: Arc<std::sync::RwLock<Vec<RemoteStreamCallback>>>,
}

impl Shared {
    fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn transition(&self, to: SessionPhase) -> Result<(), MeetError> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !phase.can_transition(to) {
                return Err(MeetError::Room(format!("cannot go from {:?} to {to:?}", *phase)));
            }
            tracing::debug!("session phase {:?} -> {to:?}", *phase);
            *phase = to;
        }
        self.emitter.emit(MeetEvent::SessionPhaseChanged(to));
        Ok(())
    }

    async fn participant_connecting(&self, peer_id: &str) {
        let info = {
            let mut pm = self.participants.lock().await;
            match pm.add_connecting(peer_id) {
                Upsert::Added => pm.get(peer_id).map(|p| p.info()),
                Upsert::Updated => None,
            }
        };
        if let Some(info) = info {
            self.emitter.emit(MeetEvent::ParticipantJoined(info));
        }
    }

    /// Record an inbound stream for `peer_id`. Remote-stream callbacks only
    /// fire when the track set actually changed.
    async fn accept_stream(&self, peer_id: &str, stream: MediaStream) {
        let stream_id = stream.id().to_string();
        let (upsert, info, is_new) = {
            let mut pm = self.participants.lock().await;
            let is_new = pm
                .stream_of(peer_id)
                .is_none_or(|previous| !previous.same_tracks(&stream));
            let upsert = pm.upsert_stream(peer_id, stream);
            let Some(info) = pm.get(peer_id).map(|p| p.info()) else {
                return;
            };
            (upsert, info, is_new)
        };

        match upsert {
            Upsert::Added => self.emitter.emit(MeetEvent::ParticipantJoined(info.clone())),
            Upsert::Updated => self.emitter.emit(MeetEvent::ParticipantUpdated(info.clone())),
        }
        if !is_new {
            return;
        }

        tracing::info!("remote stream {stream_id} from {peer_id}");
        self.emitter.emit(MeetEvent::RemoteStreamAdded {
            peer_id: peer_id.to_string(),
            stream_id,
        });
        let callbacks: Vec<_> = match self.stream_callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for callback in callbacks {
            callback(&info);
        }
    }

    async fn drop_participant(&self, handle: &RoomHandle, peer_id: &str) {
        let removed = self.participants.lock().await.remove(peer_id);
        self.chat.detach(peer_id).await;
        handle.release_peer(peer_id);

        if removed.is_some() {
            tracing::info!("participant {peer_id} left");
            self.emitter.emit(MeetEvent::ParticipantLeft(peer_id.to_string()));
        }
        let lost_room = handle.role() == RoomRole::Joiner && peer_id == handle.room_id().as_str();
        if lost_room && !handle.is_closed() {
            self.emitter.emit(MeetEvent::Notice(Notice::from(MeetError::Connection(
                format!("lost connection to room {}", handle.room_id()),
            ))));
            // Teardown closes the handle, which aborts the task running this.
            let shared = self.clone();
            let handle = handle.clone();
            tokio::spawn(async move { shared.end_lost_session(&handle).await });
        }
    }

    async fn end_lost_session(&self, handle: &RoomHandle) {
        let current = self
            .handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.is_same(handle));
        if current {
            tracing::warn!("room {} went away, leaving", handle.room_id());
            self.teardown().await;
        }
    }

    async fn teardown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let handle = self.handle.lock().await.take();
        let phase = self.phase();
        let active_session = handle.is_some()
            || !matches!(phase, SessionPhase::Idle | SessionPhase::TearingDown);
        if active_session && phase != SessionPhase::TearingDown {
            let _ = self.transition(SessionPhase::TearingDown);
        }

        self.controls.release_all().await;

        let left: Vec<PeerId> = {
            let mut pm = self.participants.lock().await;
            let ids = pm.participants().into_iter().map(|p| p.peer_id).collect();
            pm.clear();
            ids
        };
        for peer_id in left {
            self.emitter.emit(MeetEvent::ParticipantLeft(peer_id));
        }

        if let Some(handle) = handle {
            handle.close();
        }
        self.chat.detach_all().await;

        if active_session {
            let _ = self.transition(SessionPhase::Idle);
            self.emitter.emit(MeetEvent::SessionEnded);
            tracing::info!("session ended");
        }
    }

    async fn handle_payload(&self, peer_id: &str, value: serde_json::Value) {
        match PeerMessage::from_value(value) {
            Ok(PeerMessage::Greeting { text }) => tracing::info!("{peer_id} says: {text}"),
            Ok(PeerMessage::Introduce { display_name }) => {
                let (upsert, info) = {
                    let mut pm = self.participants.lock().await;
                    let upsert = pm.add_connecting(peer_id);
                    pm.set_display_name(peer_id, Some(display_name));
                    (upsert, pm.get(peer_id).map(|p| p.info()))
                };
                match (upsert, info) {
                    (Upsert::Added, Some(info)) => {
                        tracing::info!("participant {peer_id} introduced");
                        self.emitter.emit(MeetEvent::ParticipantJoined(info));
                    }
                    (Upsert::Updated, Some(info)) => {
                        self.emitter.emit(MeetEvent::ParticipantUpdated(info))
                    }
                    (_, None) => {}
                }
            }
            Ok(PeerMessage::Chat(payload)) => {
                self.chat.receive_message(peer_id, payload).await;
            }
            Err(e) => tracing::debug!("ignoring payload from {peer_id}: {e}"),
        }
    }

    /// Link a freshly opened connection to chat and introduce ourselves.
    async fn on_connection_open(&self, handle: &RoomHandle, connection: &Arc<dyn DataConnection>) {
        let peer_id = connection.peer();
        self.chat.attach(&peer_id, connection.clone()).await;

        if handle.role() == RoomRole::Host {
            let greeting = PeerMessage::Greeting {
                text: format!("hello, you are connected to the room {}", handle.room_id()),
            };
            if let Err(e) = connection.send(greeting.to_value()) {
                tracing::debug!("greeting to {peer_id} failed: {e}");
            }
        }
        let intro = PeerMessage::Introduce { display_name: self.display_name.clone() };
        if let Err(e) = connection.send(intro.to_value()) {
            tracing::debug!("introduction to {peer_id} failed: {e}");
        }
    }

    /// Answer an inbound call with whatever local media is active right now.
    async fn answer_call(&self, handle: &RoomHandle, call: Arc<dyn MediaCall>, events: CallEvents) {
        let peer_id = call.peer();
        tracing::info!("answering call from {peer_id}");
        call.answer(self.controls.outbound_stream().await);
        handle.track_call(&peer_id, call);
        let task = tokio::spawn(call_loop(self.clone(), peer_id, events));
        handle.track_task(task);
    }
}

async fn peer_loop(shared: Shared, handle: RoomHandle, mut events: PeerEvents) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Connection(connection, data) => {
                if handle.role() == RoomRole::Joiner {
                    tracing::debug!("joiner ignoring data connection from {}", connection.peer());
                    connection.close();
                    continue;
                }
                let peer_id = connection.peer();
                tracing::info!("incoming connection from {peer_id}");
                // Occupancy checks open and drop connections without a word,
                // so the peer only becomes a participant once it introduces
                // itself or sends media.
                handle.track_connection(&peer_id, connection.clone());
                let task = tokio::spawn(data_loop(shared.clone(), handle.clone(), connection, data));
                handle.track_task(task);
            }
            PeerEvent::Call(call, call_events) => {
                shared.answer_call(&handle, call, call_events).await;
            }
            PeerEvent::Error(e) => tracing::warn!("peer error in room {}: {e}", handle.room_id()),
            PeerEvent::Open(id) => tracing::debug!("peer {id} reopened"),
            PeerEvent::Closed => {
                tracing::info!("peer for room {} closed", handle.room_id());
                break;
            }
        }
    }
}

async fn data_loop(
    shared: Shared,
    handle: RoomHandle,
    connection: Arc<dyn DataConnection>,
    mut events: DataEvents,
) {
    let peer_id = connection.peer();
    while let Some(event) = events.recv().await {
        match event {
            DataEvent::Open => shared.on_connection_open(&handle, &connection).await,
            DataEvent::Data(value) => shared.handle_payload(&peer_id, value).await,
            DataEvent::Error(e) => {
                tracing::warn!("connection with {peer_id} failed: {e}");
                shared.drop_participant(&handle, &peer_id).await;
                break;
            }
            DataEvent::Closed => {
                tracing::debug!("connection with {peer_id} closed");
                shared.drop_participant(&handle, &peer_id).await;
                break;
            }
        }
    }
}

async fn call_loop(shared: Shared, peer_id: PeerId, mut events: CallEvents) {
    while let Some(event) = events.recv().await {
        match event {
            CallEvent::Stream(stream) => shared.accept_stream(&peer_id, stream).await,
            CallEvent::Error(e) => tracing::warn!("call with {peer_id} failed: {e}"),
            CallEvent::Closed => {
                tracing::debug!("call with {peer_id} closed");
                break;
            }
        }
    }
}

async fn wait_peer_open(events: &mut PeerEvents) -> Result<PeerId, TransportError> {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Open(id) => return Ok(id),
            PeerEvent::Error(e) => return Err(e),
            PeerEvent::Closed => return Err(TransportError::Destroyed),
            other => tracing::warn!("dropping {other:?} received before open"),
        }
    }
    Err(TransportError::Destroyed)
}

async fn wait_data_open(events: &mut DataEvents) -> Result<(), TransportError> {
    while let Some(event) = events.recv().await {
        match event {
            DataEvent::Open => return Ok(()),
            DataEvent::Error(e) => return Err(e),
            DataEvent::Closed => return Err(TransportError::Destroyed),
            DataEvent::Data(_) => tracing::debug!("dropping data received before open"),
        }
    }
    Err(TransportError::Destroyed)
}

// ---------------------------------------------------------------------------
// Room session
// ---------------------------------------------------------------------------

fn cancelled_entry(room_id: &RoomId) -> MeetError {
    MeetError::Room(format!("entering {room_id} was cancelled by teardown"))
}

/// Coordinates one room session: occupancy probe, host or join, remote
/// participants, and ordered teardown.
pub struct RoomSession {
    config: SessionConfig,
    transport: Arc<dyn PeerTransport>,
    devices: Arc<dyn MediaDevices>,
    shared: Shared,
    catalog: Mutex<DeviceCatalog>,
}

impl RoomSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn PeerTransport>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let emitter = EventEmitter::new();
        let controls = Arc::new(LocalMediaController::new(devices.clone(), emitter.clone()));
        let chat = ChatChannel::new(config.display_name.clone(), emitter.clone());
        Self {
            shared: Shared {
                display_name: config.display_name.clone(),
                emitter,
                controls,
                participants: Arc::new(Mutex::new(ParticipantManager::new())),
                chat,
                phase: Arc::new(std::sync::Mutex::new(SessionPhase::Idle)),
                epoch: Arc::new(AtomicU64::new(0)),
                handle: Arc::new(Mutex::new(None)),
                stream_callbacks: Arc::new(std::sync::RwLock::new(Vec::new())),
            },
            config,
            transport,
            devices,
            catalog: Mutex::new(DeviceCatalog::new()),
        }
    }

    /// Register a listener for session events.
    pub fn add_listener(&self, listener: Arc<dyn MeetEventListener>) {
        self.shared.emitter.add_listener(listener);
    }

    pub fn add_fn<F>(&self, f: F)
    where
        F: Fn(MeetEvent) + Send + Sync + 'static,
    {
        self.shared.emitter.add_fn(f);
    }

    /// Run `callback` once for every newly established inbound stream.
    pub fn on_remote_stream<F>(&self, callback: F)
    where
        F: Fn(&ParticipantInfo) + Send + Sync + 'static,
    {
        let callback: RemoteStreamCallback = Arc::new(callback);
        match self.shared.stream_callbacks.write() {
            Ok(mut callbacks) => callbacks.push(callback),
            Err(poisoned) => poisoned.into_inner().push(callback),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    pub fn controls(&self) -> Arc<LocalMediaController> {
        self.shared.controls.clone()
    }

    pub fn chat(&self) -> ChatChannel {
        self.shared.chat.clone()
    }

    pub async fn handle(&self) -> Option<RoomHandle> {
        self.shared.handle.lock().await.clone()
    }

    /// Snapshot of remote participants, in join order.
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.shared.participants.lock().await.participants()
    }

    pub async fn devices(&self) -> DeviceCatalog {
        self.catalog.lock().await.clone()
    }

    /// Re-enumerate devices and permissions, and settle device selections.
    ///
    /// Preferred devices from the config win when they are still present,
    /// otherwise the catalog default is used. Existing selections are kept.
    pub async fn refresh_devices(&self) -> Result<(), MeetError> {
        let permissions = DeviceCatalog::check_permissions(self.devices.as_ref()).await;
        self.shared.controls.set_permissions(permissions).await;

        let catalog = {
            let mut catalog = self.catalog.lock().await;
            catalog.refresh(self.devices.as_ref()).await?;
            catalog.clone()
        };

        let state = self.shared.controls.state().await;
        let selections = [
            (DeviceKind::VideoInput, &state.camera_device, &self.config.preferred_camera),
            (DeviceKind::AudioInput, &state.microphone_device, &self.config.preferred_microphone),
            (DeviceKind::AudioOutput, &state.speaker_device, &self.config.preferred_speaker),
        ];
        for (kind, current, preferred) in selections {
            let still_present = current
                .as_deref()
                .is_some_and(|id| catalog.find(kind, id).is_some());
            if still_present {
                continue;
            }
            let pick = preferred
                .as_deref()
                .filter(|id| catalog.find(kind, id).is_some())
                .or_else(|| catalog.default_device(kind));
            if let Some(device_id) = pick {
                self.shared.controls.select_device(kind, device_id).await;
            }
        }

        self.shared.emitter.emit(MeetEvent::DevicesChanged);
        Ok(())
    }

    /// Whether some peer is already registered under `room_id`.
    ///
    /// Opens a throwaway peer, tries to connect, and destroys it whatever the
    /// outcome. Failure and timeout both read as vacant.
    pub async fn check_room_occupancy(&self, room_id: &RoomId) -> bool {
        let moved = self.phase() == SessionPhase::Idle
            && self.shared.transition(SessionPhase::Probing).is_ok();
        let occupied = self.probe(room_id).await;
        if moved {
            let _ = self.shared.transition(SessionPhase::Idle);
        }
        occupied
    }

    async fn probe(&self, room_id: &RoomId) -> bool {
        let occupied = match self.transport.create_peer(None).await {
            Ok((peer, mut events)) => {
                let attempt = async {
                    wait_peer_open(&mut events).await?;
                    let (_connection, mut data) = peer.connect(room_id.as_str()).await?;
                    wait_data_open(&mut data).await
                };
                let outcome = tokio::time::timeout(self.config.probe_timeout, attempt).await;
                peer.destroy();
                match outcome {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::debug!("{}", MeetError::RoomProbeFailure(e.to_string()));
                        false
                    }
                    Err(_) => {
                        tracing::debug!("{}", MeetError::RoomProbeFailure("timed out".into()));
                        false
                    }
                }
            }
            Err(e) => {
                tracing::debug!("{}", MeetError::RoomProbeFailure(e.to_string()));
                false
            }
        };

        tracing::info!("room {room_id} occupied: {occupied}");
        self.shared.emitter.emit(MeetEvent::RoomOccupancy {
            room_id: room_id.clone(),
            occupied,
        });
        occupied
    }

    /// Probe the room, acquire local media, then join it if someone is there
    /// or host it if not.
    ///
    /// A `teardown` while this is in flight cancels it: nothing gets
    /// registered and `MeetError::Room` comes back.
    pub async fn enter(&self, room_id: &RoomId) -> Result<RoomHandle, MeetError> {
        let epoch = self.shared.epoch();
        self.shared.transition(SessionPhase::Probing)?;
        let occupied = self.probe(room_id).await;
        if self.cancelled(epoch) {
            return Err(cancelled_entry(room_id));
        }

        let outbound = match self.prepare_outbound().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.shared.transition(SessionPhase::Idle);
                return Err(e);
            }
        };
        if self.cancelled(epoch) {
            // A later start may have slipped past the teardown's release.
            self.shared.controls.release_all().await;
            return Err(cancelled_entry(room_id));
        }

        if occupied {
            self.join(room_id, outbound, epoch).await
        } else {
            self.host(room_id, epoch).await
        }
    }

    fn cancelled(&self, epoch: u64) -> bool {
        self.shared.epoch() != epoch
    }

    /// Make `handle` the session's handle unless a teardown got there first.
    async fn install(&self, handle: &RoomHandle, epoch: u64) -> Result<(), MeetError> {
        let mut slot = self.shared.handle.lock().await;
        if self.cancelled(epoch) {
            drop(slot);
            handle.close();
            return Err(cancelled_entry(handle.room_id()));
        }
        *slot = Some(handle.clone());
        Ok(())
    }

    /// Start the local media the config asks for on join.
    async fn prepare_outbound(&self) -> Result<MediaStream, MeetError> {
        let controls = &self.shared.controls;
        let state = controls.state().await;
        let catalog = self.catalog.lock().await.clone();

        if self.config.microphone_on_join {
            let device = state
                .microphone_device
                .clone()
                .or_else(|| catalog.default_device(DeviceKind::AudioInput).map(str::to_string));
            match device {
                Some(id) => controls.start_microphone(&id).await?,
                None => tracing::warn!("no microphone available, joining without audio"),
            }
        }
        if self.config.camera_on_join {
            let device = state
                .camera_device
                .clone()
                .or_else(|| catalog.default_device(DeviceKind::VideoInput).map(str::to_string));
            match device {
                Some(id) => controls.start_camera(&id).await?,
                None => tracing::warn!("no camera available, joining without video"),
            }
        }

        Ok(controls.outbound_stream().await)
    }

    /// Register under `room_id` and accept joiners.
    pub async fn host_room(&self, room_id: &RoomId) -> Result<RoomHandle, MeetError> {
        self.host(room_id, self.shared.epoch()).await
    }

    async fn host(&self, room_id: &RoomId, epoch: u64) -> Result<RoomHandle, MeetError> {
        self.shared.transition(SessionPhase::Hosting)?;

        let (peer, mut events) = match self.transport.create_peer(Some(room_id.as_str())).await {
            Ok(created) => created,
            Err(e) => return self.fail(room_id, epoch, e).await,
        };
        let handle = RoomHandle::new(room_id.clone(), RoomRole::Host, peer);
        self.install(&handle, epoch).await?;

        if let Err(e) = wait_peer_open(&mut events).await {
            return self.fail(room_id, epoch, e).await;
        }
        if self.cancelled(epoch) {
            handle.close();
            return Err(cancelled_entry(room_id));
        }

        let task = tokio::spawn(peer_loop(self.shared.clone(), handle.clone(), events));
        handle.track_task(task);

        self.shared.transition(SessionPhase::Connected)?;
        tracing::info!("hosting room {room_id}");
        Ok(handle)
    }

    /// Connect to the peer registered under `room_id` and call it with
    /// `local_stream`.
    pub async fn join_room(
        &self,
        room_id: &RoomId,
        local_stream: MediaStream,
    ) -> Result<RoomHandle, MeetError> {
        self.join(room_id, local_stream, self.shared.epoch()).await
    }

    async fn join(
        &self,
        room_id: &RoomId,
        local_stream: MediaStream,
        epoch: u64,
    ) -> Result<RoomHandle, MeetError> {
        self.shared.transition(SessionPhase::Joining)?;

        let (peer, mut events) = match self.transport.create_peer(None).await {
            Ok(created) => created,
            Err(e) => return self.fail(room_id, epoch, e).await,
        };
        let handle = RoomHandle::new(room_id.clone(), RoomRole::Joiner, peer.clone());
        self.install(&handle, epoch).await?;

        let connected = async {
            wait_peer_open(&mut events).await?;
            let (connection, mut data) = peer.connect(room_id.as_str()).await?;
            handle.track_connection(room_id.as_str(), connection.clone());
            wait_data_open(&mut data).await?;
            let (call, call_events) = peer.call(room_id.as_str(), local_stream).await?;
            handle.track_call(room_id.as_str(), call);
            Ok::<_, TransportError>((connection, data, call_events))
        }
        .await;

        let (connection, data, call_events) = match connected {
            Ok(parts) => parts,
            Err(e) => return self.fail(room_id, epoch, e).await,
        };
        if self.cancelled(epoch) {
            handle.close();
            return Err(cancelled_entry(room_id));
        }

        self.shared.participant_connecting(room_id.as_str()).await;
        self.shared.on_connection_open(&handle, &connection).await;

        let tasks = [
            tokio::spawn(peer_loop(self.shared.clone(), handle.clone(), events)),
            tokio::spawn(data_loop(self.shared.clone(), handle.clone(), connection, data)),
            tokio::spawn(call_loop(self.shared.clone(), room_id.to_string(), call_events)),
        ];
        for task in tasks {
            handle.track_task(task);
        }

        self.shared.transition(SessionPhase::Connected)?;
        tracing::info!("joined room {room_id} as {}", handle.local_peer_id());
        Ok(handle)
    }

    /// Tear down after a failed host or join and surface a connection error.
    /// If a teardown already cancelled the entry, report that instead.
    async fn fail(
        &self,
        room_id: &RoomId,
        epoch: u64,
        cause: TransportError,
    ) -> Result<RoomHandle, MeetError> {
        if self.cancelled(epoch) {
            tracing::debug!("entry to {room_id} cancelled ({cause})");
            return Err(cancelled_entry(room_id));
        }
        let error = MeetError::from(cause);
        tracing::warn!("{error}");
        self.teardown().await;
        Err(error)
    }

    /// Re-place calls so remote peers receive the current local media.
    ///
    /// A joiner calls the room again; the host calls every participant.
    pub async fn renegotiate(&self) -> Result<(), MeetError> {
        if self.phase() != SessionPhase::Connected {
            return Ok(());
        }
        let Some(handle) = self.handle().await else {
            return Ok(());
        };
        let Some(peer) = handle.peer() else {
            return Ok(());
        };

        let targets: Vec<PeerId> = match handle.role() {
            RoomRole::Joiner => vec![handle.room_id().to_string()],
            RoomRole::Host => self
                .participants()
                .await
                .into_iter()
                .map(|p| p.peer_id)
                .collect(),
        };
        let outbound = self.shared.controls.outbound_stream().await;

        let placed = futures_util::future::join_all(
            targets
                .iter()
                .map(|target| peer.call(target, outbound.clone())),
        )
        .await;

        let mut first_error = None;
        for (target, result) in targets.into_iter().zip(placed) {
            match result {
                Ok((call, events)) => {
                    handle.track_call(&target, call);
                    let task = tokio::spawn(call_loop(self.shared.clone(), target, events));
                    handle.track_task(task);
                }
                Err(e) => {
                    tracing::warn!("re-calling {target} failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub async fn toggle_camera(&self) -> Result<bool, MeetError> {
        let active = self.shared.controls.toggle_camera().await?;
        self.renegotiate().await?;
        Ok(active)
    }

    pub async fn toggle_microphone(&self) -> Result<bool, MeetError> {
        let active = self.shared.controls.toggle_microphone().await?;
        self.renegotiate().await?;
        Ok(active)
    }

    pub async fn share_screen(&self) -> Result<(), MeetError> {
        self.shared.controls.start_screen_share().await?;
        self.renegotiate().await
    }

    pub async fn stop_screen_share(&self) -> Result<(), MeetError> {
        self.shared.controls.stop_screen_share().await;
        self.renegotiate().await
    }

    /// Leave the room.
    ///
    /// Order is fixed: local media first, then remote streams, then the
    /// connections and the peer. Safe from any phase and idempotent; only the
    /// first call after a session emits `SessionEnded`. An `enter` still in
    /// flight is cancelled.
    pub async fn teardown(&self) {
        self.shared.teardown().await;
    }
}
