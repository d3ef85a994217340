use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::encoder::{FrameEncoder, ImageJpegEncoder};
use super::governor::{FpsMeter, RateGovernor};
use super::session::{ClientSession, EncodedFrame, Offer, Subscription};
use super::StreamConfig;
use crate::error::StreamError;
use crate::pipeline::{ProcessingResult, StageFault};
use crate::utils::{lock, read, write};

/// Lifecycle of the distribution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What `handle_frame` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Encoded and queued for this many clients.
    Delivered(usize),
    /// Arrived sooner than the camera's frame interval allows.
    RateLimited,
    EncodeFailed,
    /// Nobody is watching the camera; nothing was encoded.
    NoSubscribers,
    /// The engine is not running.
    Skipped,
    /// The stage ran out of backends; the engine moved to `Error`.
    Escalated,
}

/// Snapshot of one client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub camera_id: String,
    pub connected_us: u64,
    pub last_frame_us: u64,
    pub last_activity_us: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub queued: usize,
}

/// Engine-wide status for health endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub last_error: Option<String>,
    pub clients: usize,
    pub cameras: usize,
    pub current_fps: f64,
    pub frames_received: u64,
    pub frames_encoded: u64,
    pub frames_delivered: u64,
    pub encode_failures: u64,
    pub rate_limited: u64,
    pub session_drops: u64,
    pub clients_disconnected: u64,
}

#[derive(Debug)]
struct Lifecycle {
    state: EngineState,
    last_error: Option<String>,
}

/// Clients by id and by camera. Both maps change together under one lock.
#[derive(Default)]
struct Registry {
    clients: HashMap<Arc<str>, Arc<ClientSession>>,
    by_camera: HashMap<Arc<str>, Vec<Arc<ClientSession>>>,
}

impl Registry {
    /// Remove `id`. The flag is true when it was its camera's last client.
    fn remove(&mut self, id: &str) -> Option<(Arc<ClientSession>, bool)> {
        let session = self.clients.remove(id)?;
        let mut last = false;
        if let Some(sessions) = self.by_camera.get_mut(session.camera_id()) {
            sessions.retain(|s| !Arc::ptr_eq(s, &session));
            if sessions.is_empty() {
                self.by_camera.remove(session.camera_id());
                last = true;
            }
        }
        Some((session, last))
    }

    fn drain(&mut self) -> Vec<Arc<ClientSession>> {
        self.by_camera.clear();
        self.clients.drain().map(|(_, session)| session).collect()
    }
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_encoded: AtomicU64,
    frames_delivered: AtomicU64,
    encode_failures: AtomicU64,
    rate_limited: AtomicU64,
    session_drops: AtomicU64,
    clients_disconnected: AtomicU64,
}

/// Fans encoded camera frames out to subscribed clients.
///
/// The engine spawns nothing: the producer calls [`StreamEngine::handle_frame`]
/// and transports call the client operations from their own threads. Client
/// delivery is a non-blocking enqueue on each session's bounded queue.
pub struct StreamEngine {
    lifecycle: Mutex<Lifecycle>,
    config: ArcSwapOption<StreamConfig>,
    registry: Mutex<Registry>,
    governor: Mutex<RateGovernor>,
    fps: Mutex<FpsMeter>,
    /// Held shared by every frame in flight, exclusively by `stop`
    in_flight: RwLock<()>,
    encoder: Arc<dyn FrameEncoder>,
    counters: CachePadded<Counters>,
    epoch: Instant,
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngine {
    pub fn new() -> Self {
        Self::with_encoder(Arc::new(ImageJpegEncoder))
    }

    pub fn with_encoder(encoder: Arc<dyn FrameEncoder>) -> Self {
        let epoch = Instant::now();
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Stopped,
                last_error: None,
            }),
            config: ArcSwapOption::empty(),
            registry: Mutex::new(Registry::default()),
            governor: Mutex::new(RateGovernor::new(1)),
            fps: Mutex::new(FpsMeter::new(epoch)),
            in_flight: RwLock::new(()),
            encoder,
            counters: CachePadded::new(Counters::default()),
            epoch,
        }
    }

    fn micros(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Microseconds since the engine was created. Session timestamps use
    /// this clock.
    pub fn now_us(&self) -> u64 {
        self.micros(Instant::now())
    }

    /// Validate and store the configuration. Only allowed while stopped.
    #[instrument(skip(self, config))]
    pub fn initialize(&self, config: StreamConfig) -> Result<(), StreamError> {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            EngineState::Stopped | EngineState::Error => {}
            busy => return Err(StreamError::Busy(busy)),
        }
        config.validate()?;

        lock(&self.governor).set_max_fps(config.max_fps);
        info!(
            jpeg_quality = config.jpeg_quality,
            max_fps = config.max_fps,
            max_clients_per_camera = config.max_clients_per_camera,
            "Stream engine initialized"
        );
        self.config.store(Some(Arc::new(config)));
        lifecycle.state = EngineState::Stopped;
        lifecycle.last_error = None;
        Ok(())
    }

    /// Apply a new configuration to a running engine. Queue depth and drop
    /// policy only affect clients that connect afterwards.
    pub fn reconfigure(&self, config: StreamConfig) -> Result<(), StreamError> {
        if self.config.load().is_none() {
            return Err(StreamError::NotInitialized);
        }
        config.validate()?;
        lock(&self.governor).set_max_fps(config.max_fps);
        self.config.store(Some(Arc::new(config)));
        info!("Stream engine reconfigured");
        Ok(())
    }

    /// Probe the encoder and start accepting frames and clients.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), StreamError> {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            EngineState::Running => return Ok(()),
            EngineState::Stopped => {}
            busy => return Err(StreamError::Busy(busy)),
        }
        if self.config.load().is_none() {
            return Err(StreamError::NotInitialized);
        }

        lifecycle.state = EngineState::Starting;
        if let Err(err) = self.encoder.probe() {
            error!("Encoder probe failed: {}", err);
            lifecycle.state = EngineState::Error;
            lifecycle.last_error = Some(err.to_string());
            return Err(err.into());
        }

        let now = Instant::now();
        lock(&self.governor).reset();
        lock(&self.fps).reset(now);
        lifecycle.state = EngineState::Running;
        lifecycle.last_error = None;
        info!("Stream engine running");
        Ok(())
    }

    /// Stop accepting frames, wait for in-flight deliveries and close every
    /// session.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                EngineState::Running | EngineState::Error | EngineState::Starting => {
                    lifecycle.state = EngineState::Stopping;
                }
                EngineState::Stopped | EngineState::Stopping => return,
            }
        }

        let closed = {
            let _gate = write(&self.in_flight);
            self.close_all()
        };

        lock(&self.lifecycle).state = EngineState::Stopped;
        info!(clients_closed = closed, "Stream engine stopped");
    }

    fn close_all(&self) -> usize {
        let sessions = lock(&self.registry).drain();
        lock(&self.governor).reset();
        for session in &sessions {
            session.close();
        }
        metrics::gauge!("stream_clients").set(0.0);
        sessions.len()
    }

    /// Move to `Error` with `reason`. Ignored when stopped.
    pub fn escalate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == EngineState::Stopped {
            return;
        }
        error!("Stream engine failed: {}", reason);
        lifecycle.state = EngineState::Error;
        lifecycle.last_error = Some(reason);
    }

    pub fn state(&self) -> EngineState {
        lock(&self.lifecycle).state
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.lifecycle).last_error.clone()
    }

    pub fn config(&self) -> Option<StreamConfig> {
        self.config.load_full().map(|config| (*config).clone())
    }

    /// Subscribe `id` to `camera_id`.
    pub fn add_client(
        &self,
        id: impl Into<String>,
        camera_id: impl Into<String>,
    ) -> Result<Subscription, StreamError> {
        let id: Arc<str> = Arc::from(id.into());
        let camera_id: Arc<str> = Arc::from(camera_id.into());
        let config = self.config.load_full().ok_or(StreamError::NotInitialized)?;

        let mut registry = lock(&self.registry);
        // checked under the registry lock so `stop` cannot miss this session
        let state = self.state();
        if state != EngineState::Running {
            return Err(StreamError::NotRunning(state));
        }
        if registry.clients.contains_key(&id) {
            return Err(StreamError::DuplicateClient(id.to_string()));
        }

        let on_camera = registry.by_camera.get(&camera_id).map_or(0, Vec::len);
        let limit = config.max_clients_per_camera;
        if limit > 0 && on_camera >= limit {
            warn!(client = %id, camera = %camera_id, limit, "Camera at client capacity");
            return Err(StreamError::CapacityExceeded {
                camera_id: camera_id.to_string(),
                limit,
            });
        }

        let (session, subscription) = ClientSession::open(
            Arc::clone(&id),
            Arc::clone(&camera_id),
            config.session_queue_depth,
            config.drop_policy,
            self.now_us(),
        );
        registry.clients.insert(Arc::clone(&id), Arc::clone(&session));
        registry.by_camera.entry(camera_id).or_default().push(session);
        let total = registry.clients.len();
        drop(registry);

        metrics::gauge!("stream_clients").set(total as f64);
        info!(client = %id, camera = subscription.camera_id(), total, "Client connected");
        Ok(subscription)
    }

    /// Remove a client and signal close to its subscriber. Returns false if
    /// the id is unknown.
    pub fn remove_client(&self, id: &str) -> bool {
        let (removed, total) = {
            let mut registry = lock(&self.registry);
            let removed = registry.remove(id);
            (removed, registry.clients.len())
        };
        let Some((session, last_on_camera)) = removed else {
            return false;
        };

        if last_on_camera {
            lock(&self.governor).forget(session.camera_id());
        }
        session.close();
        metrics::gauge!("stream_clients").set(total as f64);
        info!(
            client = id,
            camera = %session.camera_id(),
            delivered = session.delivered(),
            dropped = session.dropped(),
            "Client disconnected"
        );
        true
    }

    pub fn handle_frame(&self, result: &ProcessingResult) -> FrameOutcome {
        self.handle_frame_at(result, Instant::now())
    }

    /// [`StreamEngine::handle_frame`] with an explicit arrival time.
    pub fn handle_frame_at(&self, result: &ProcessingResult, now: Instant) -> FrameOutcome {
        let _gate = read(&self.in_flight);

        if let Some(StageFault::BackendsExhausted(reason)) = &result.fault {
            self.escalate(format!("processing backends exhausted: {reason}"));
            return FrameOutcome::Escalated;
        }

        if self.state() != EngineState::Running {
            return FrameOutcome::Skipped;
        }
        let Some(config) = self.config.load_full() else {
            return FrameOutcome::Skipped;
        };

        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let frame = &result.frame;
        let camera = frame.camera_id_arc();

        if !lock(&self.registry).by_camera.contains_key(&camera) {
            return FrameOutcome::NoSubscribers;
        }

        if !lock(&self.governor).admit(&camera, now) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("stream_frames_rate_limited_total").increment(1);
            return FrameOutcome::RateLimited;
        }

        let resize = config.resize_target();
        let encode_started = Instant::now();
        let jpeg = match self.encoder.encode(frame, config.jpeg_quality, resize) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                self.counters.encode_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("stream_encode_failures_total").increment(1);
                warn!(camera = %camera, "Frame encode failed: {}", err);
                return FrameOutcome::EncodeFailed;
            }
        };
        metrics::histogram!("stream_encode_time_us")
            .record(encode_started.elapsed().as_micros() as f64);
        metrics::counter!("stream_frames_encoded_total").increment(1);
        self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);

        let (width, height) = resize.unwrap_or((frame.width(), frame.height()));
        let encoded = EncodedFrame {
            camera_id: Arc::clone(&camera),
            jpeg,
            width,
            height,
            sequence: frame.metadata().sequence,
            timestamp_us: frame.metadata().timestamp_us,
        };

        // snapshot, then deliver without holding the registry lock
        let sessions: Vec<Arc<ClientSession>> = lock(&self.registry)
            .by_camera
            .get(&camera)
            .cloned()
            .unwrap_or_default();

        let now_us = self.micros(now);
        let mut delivered = 0;
        let mut gone = Vec::new();
        for session in &sessions {
            match session.offer(encoded.clone(), now_us) {
                Offer::Queued => delivered += 1,
                Offer::ReplacedOldest => {
                    delivered += 1;
                    self.record_drop(session);
                }
                Offer::DroppedNewest => self.record_drop(session),
                Offer::Disconnected => gone.push(Arc::clone(session.id())),
                Offer::Closed => {}
            }
        }

        for id in gone {
            warn!(client = %id, "Subscriber went away, removing client");
            self.counters.clients_disconnected.fetch_add(1, Ordering::Relaxed);
            self.remove_client(&id);
        }

        if delivered > 0 {
            self.counters
                .frames_delivered
                .fetch_add(delivered as u64, Ordering::Relaxed);
            lock(&self.fps).record(now);
        }
        FrameOutcome::Delivered(delivered)
    }

    fn record_drop(&self, session: &ClientSession) {
        self.counters.session_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stream_session_drops_total").increment(1);
        debug!(client = %session.id(), queued = session.queued(), "Client queue full");
    }

    pub fn client_count(&self) -> usize {
        lock(&self.registry).clients.len()
    }

    pub fn current_fps(&self) -> f64 {
        lock(&self.fps).fps()
    }

    pub fn is_client_connected(&self, id: &str) -> bool {
        lock(&self.registry).clients.contains_key(id)
    }

    /// Connected client ids, sorted.
    pub fn active_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.registry)
            .clients
            .keys()
            .map(|id| id.to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn camera_client_count(&self, camera_id: &str) -> usize {
        lock(&self.registry).by_camera.get(camera_id).map_or(0, Vec::len)
    }

    /// Client ids subscribed to `camera_id`, sorted.
    pub fn camera_clients(&self, camera_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.registry)
            .by_camera
            .get(camera_id)
            .map(|sessions| sessions.iter().map(|s| s.id().to_string()).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Cameras with at least one client, sorted.
    pub fn cameras(&self) -> Vec<String> {
        let mut cameras: Vec<String> = lock(&self.registry)
            .by_camera
            .keys()
            .map(|camera| camera.to_string())
            .collect();
        cameras.sort();
        cameras
    }

    pub fn client_info(&self, id: &str) -> Option<ClientInfo> {
        let session = lock(&self.registry).clients.get(id).cloned()?;
        Some(ClientInfo {
            id: session.id().to_string(),
            camera_id: session.camera_id().to_string(),
            connected_us: session.connected_us(),
            last_frame_us: session.last_frame_us(),
            last_activity_us: session.last_activity_us(),
            frames_delivered: session.delivered(),
            frames_dropped: session.dropped(),
            queued: session.queued(),
        })
    }

    /// Record transport-side activity for a client.
    pub fn touch(&self, id: &str) -> bool {
        let session = lock(&self.registry).clients.get(id).cloned();
        match session {
            Some(session) => {
                session.touch(self.now_us());
                true
            }
            None => false,
        }
    }

    /// Clients idle for longer than `window`, sorted.
    pub fn stale_clients(&self, window: Duration) -> Vec<String> {
        self.stale_clients_at(window, Instant::now())
    }

    fn stale_clients_at(&self, window: Duration, now: Instant) -> Vec<String> {
        let now_us = self.micros(now);
        let window_us = window.as_micros() as u64;
        let mut ids: Vec<String> = lock(&self.registry)
            .clients
            .values()
            .filter(|s| now_us.saturating_sub(s.last_activity_us()) > window_us)
            .map(|s| s.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Remove clients idle for longer than `window`. Returns their ids.
    pub fn reap_stale(&self, window: Duration) -> Vec<String> {
        self.reap_stale_at(window, Instant::now())
    }

    /// [`StreamEngine::reap_stale`] evaluated at `now`.
    pub fn reap_stale_at(&self, window: Duration, now: Instant) -> Vec<String> {
        let stale = self.stale_clients_at(window, now);
        let mut reaped = Vec::with_capacity(stale.len());
        for id in stale {
            let session = lock(&self.registry).clients.get(id.as_str()).cloned();
            if let Some(session) = session {
                if !session.notify_error("client idle timeout") {
                    warn!(
                        client = %id,
                        queued = session.queued(),
                        "Queue full, closing idle client without a timeout notice"
                    );
                }
            }
            if self.remove_client(&id) {
                reaped.push(id);
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped stale clients");
        }
        reaped
    }

    pub fn status(&self) -> EngineStatus {
        let (state, last_error) = {
            let lifecycle = lock(&self.lifecycle);
            (lifecycle.state, lifecycle.last_error.clone())
        };
        let (clients, cameras) = {
            let registry = lock(&self.registry);
            (registry.clients.len(), registry.by_camera.len())
        };
        let c = &self.counters;
        EngineStatus {
            state,
            last_error,
            clients,
            cameras,
            current_fps: self.current_fps(),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_encoded: c.frames_encoded.load(Ordering::Relaxed),
            frames_delivered: c.frames_delivered.load(Ordering::Relaxed),
            encode_failures: c.encode_failures.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            session_drops: c.session_drops.load(Ordering::Relaxed),
            clients_disconnected: c.clients_disconnected.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        let sessions = self
            .registry
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain();
        for session in sessions {
            session.close();
        }
    }
}
