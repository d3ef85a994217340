//! Per-client delivery queues and the consumer side handed to transports.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, warn};

use super::DropPolicy;
use crate::error::DeliveryError;
use crate::utils::lock;

/// One JPEG ready to be written to a client.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub camera_id: Arc<str>,
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp_us: u64,
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    Frame(EncodedFrame),
    Error(String),
    /// Always the last delivery of a session, sent exactly once.
    Closed,
}

/// Result of offering a frame to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    Queued,
    /// Queued after evicting the oldest frame.
    ReplacedOldest,
    /// Queue full, frame discarded.
    DroppedNewest,
    /// The subscriber went away.
    Disconnected,
    Closed,
}

/// Engine-side state of one connected client.
pub(crate) struct ClientSession {
    id: Arc<str>,
    camera_id: Arc<str>,
    tx: Sender<Delivery>,
    /// Kept so the engine can evict from a full queue
    rx: Receiver<Delivery>,
    depth: usize,
    policy: DropPolicy,
    /// Serialises offers against close; true once closed
    closed: Mutex<bool>,
    connected_us: u64,
    last_frame_us: AtomicU64,
    last_activity_us: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ClientSession {
    pub(crate) fn open(
        id: Arc<str>,
        camera_id: Arc<str>,
        depth: usize,
        policy: DropPolicy,
        now_us: u64,
    ) -> (Arc<Self>, Subscription) {
        // one slot beyond the frame depth is reserved for the close marker
        let (tx, rx) = flume::bounded(depth + 1);
        let subscription = Subscription {
            id: Arc::clone(&id),
            camera_id: Arc::clone(&camera_id),
            rx: rx.clone(),
            finished: false,
        };
        let session = Arc::new(Self {
            id,
            camera_id,
            tx,
            rx,
            depth,
            policy,
            closed: Mutex::new(false),
            connected_us: now_us,
            last_frame_us: AtomicU64::new(now_us),
            last_activity_us: AtomicU64::new(now_us),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        (session, subscription)
    }

    pub(crate) fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub(crate) fn camera_id(&self) -> &Arc<str> {
        &self.camera_id
    }

    fn subscriber_gone(&self) -> bool {
        self.tx.receiver_count() <= 1
    }

    /// Queue a frame without ever blocking.
    pub(crate) fn offer(&self, frame: EncodedFrame, now_us: u64) -> Offer {
        let closed = lock(&self.closed);
        if *closed {
            return Offer::Closed;
        }
        if self.subscriber_gone() {
            return Offer::Disconnected;
        }

        let mut evicted = false;
        if self.tx.len() >= self.depth {
            match self.policy {
                DropPolicy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Offer::DroppedNewest;
                }
                DropPolicy::DropOldest => {
                    while self.tx.len() >= self.depth {
                        match self.rx.try_recv() {
                            Ok(_) => evicted = true,
                            Err(_) => break,
                        }
                    }
                    if evicted {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        match self.tx.try_send(Delivery::Frame(frame)) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.last_frame_us.store(now_us, Ordering::Relaxed);
                self.last_activity_us.store(now_us, Ordering::Relaxed);
                if evicted {
                    Offer::ReplacedOldest
                } else {
                    Offer::Queued
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => Offer::Disconnected,
            Err(flume::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Offer::DroppedNewest
            }
        }
    }

    /// Queue an error notification if there is room for it.
    pub(crate) fn notify_error(&self, message: impl Into<String>) -> bool {
        let closed = lock(&self.closed);
        if *closed || self.tx.len() >= self.depth {
            return false;
        }
        self.tx.try_send(Delivery::Error(message.into())).is_ok()
    }

    /// Signal close to the subscriber. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let mut closed = lock(&self.closed);
        if *closed {
            return false;
        }
        *closed = true;
        if self.tx.try_send(Delivery::Closed).is_err() {
            debug!(client = %self.id, "Close marker not queued, subscriber already gone");
        }
        true
    }

    pub(crate) fn touch(&self, now_us: u64) {
        self.last_activity_us.store(now_us, Ordering::Relaxed);
    }

    pub(crate) fn connected_us(&self) -> u64 {
        self.connected_us
    }

    pub(crate) fn last_frame_us(&self) -> u64 {
        self.last_frame_us.load(Ordering::Relaxed)
    }

    pub(crate) fn last_activity_us(&self) -> u64 {
        self.last_activity_us.load(Ordering::Relaxed)
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn queued(&self) -> usize {
        self.tx.len()
    }
}

type FrameCallback = Box<dyn FnMut(&EncodedFrame) -> Result<(), DeliveryError> + Send>;
type ErrorCallback = Box<dyn FnMut(&str) + Send>;
type CloseCallback = Box<dyn FnOnce() + Send>;

/// Transport hooks driven by [`Subscription::pump`].
///
/// `on_frame` is mandatory. A failing or panicking `on_frame` is reported to
/// `on_error` and delivery carries on; `on_close` runs once at the end.
pub struct ClientCallbacks {
    on_frame: FrameCallback,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
}

impl ClientCallbacks {
    pub fn new<F>(on_frame: F) -> Self
    where
        F: FnMut(&EncodedFrame) -> Result<(), DeliveryError> + Send + 'static,
    {
        Self {
            on_frame: Box::new(on_frame),
            on_error: None,
            on_close: None,
        }
    }

    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }

    pub fn on_close<F>(mut self, on_close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(on_close));
        self
    }

    fn report(&mut self, client: &str, message: &str) {
        warn!(client, "Client delivery error: {}", message);
        if let Some(on_error) = self.on_error.as_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_error(message))) {
                warn!(client, "on_error callback panicked: {}", panic_message(&payload));
            }
        }
    }

    /// Returns false once the session is over.
    fn dispatch(&mut self, client: &str, delivery: Delivery, summary: &mut PumpSummary) -> bool {
        match delivery {
            Delivery::Frame(frame) => {
                let on_frame = &mut self.on_frame;
                match panic::catch_unwind(AssertUnwindSafe(|| on_frame(&frame))) {
                    Ok(Ok(())) => summary.frames += 1,
                    Ok(Err(err)) => {
                        summary.errors += 1;
                        self.report(client, &err.to_string());
                    }
                    Err(payload) => {
                        summary.errors += 1;
                        let message = format!("on_frame panicked: {}", panic_message(&payload));
                        self.report(client, &message);
                    }
                }
                true
            }
            Delivery::Error(message) => {
                summary.errors += 1;
                self.report(client, &message);
                true
            }
            Delivery::Closed => {
                summary.closed = true;
                if let Some(on_close) = self.on_close.take() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(on_close)) {
                        warn!(client, "on_close callback panicked: {}", panic_message(&payload));
                    }
                }
                false
            }
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Counts from one pump run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    /// Frames the transport accepted
    pub frames: u64,
    pub errors: u64,
    pub closed: bool,
}

/// Receiving end of a client session.
///
/// Yields queued frames and error notifications, then exactly one
/// [`Delivery::Closed`], after which every receive returns `None`. Dropping
/// the subscription disconnects the client; the engine removes it on the
/// next frame for its camera.
#[derive(Debug)]
pub struct Subscription {
    id: Arc<str>,
    camera_id: Arc<str>,
    rx: Receiver<Delivery>,
    finished: bool,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// True once `Closed` has been observed.
    pub fn is_closed(&self) -> bool {
        self.finished
    }

    fn observe(&mut self, delivery: Option<Delivery>, disconnected: bool) -> Option<Delivery> {
        if self.finished {
            return None;
        }
        match delivery {
            Some(Delivery::Closed) => {
                self.finished = true;
                Some(Delivery::Closed)
            }
            Some(other) => Some(other),
            // engine dropped without closing us
            None if disconnected => {
                self.finished = true;
                Some(Delivery::Closed)
            }
            None => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(delivery) => self.observe(Some(delivery), false),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.observe(None, true),
        }
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        if self.finished {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => self.observe(Some(delivery), false),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => self.observe(None, true),
        }
    }

    pub async fn recv_async(&mut self) -> Option<Delivery> {
        if self.finished {
            return None;
        }
        match self.rx.recv_async().await {
            Ok(delivery) => self.observe(Some(delivery), false),
            Err(RecvError::Disconnected) => self.observe(None, true),
        }
    }

    /// Everything queued right now, without waiting.
    pub fn drain(&mut self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Feed deliveries to `callbacks` until the session closes.
    pub async fn pump(mut self, mut callbacks: ClientCallbacks) -> PumpSummary {
        let mut summary = PumpSummary::default();
        while let Some(delivery) = self.recv_async().await {
            if !callbacks.dispatch(&self.id, delivery, &mut summary) {
                break;
            }
        }
        debug!(client = %self.id, frames = summary.frames, "Client pump finished");
        summary
    }

    /// Blocking variant of [`Subscription::pump`] for thread-per-client
    /// transports.
    pub fn pump_blocking(mut self, mut callbacks: ClientCallbacks) -> PumpSummary {
        let mut summary = PumpSummary::default();
        while !self.finished {
            let delivery = match self.rx.recv() {
                Ok(delivery) => self.observe(Some(delivery), false),
                Err(RecvError::Disconnected) => self.observe(None, true),
            };
            let Some(delivery) = delivery else { break };
            if !callbacks.dispatch(&self.id, delivery, &mut summary) {
                break;
            }
        }
        debug!(client = %self.id, frames = summary.frames, "Client pump finished");
        summary
    }
}
