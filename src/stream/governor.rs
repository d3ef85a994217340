use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-camera frame rate cap.
///
/// A frame is admitted when at least `1 / max_fps` has elapsed since the
/// last admitted frame of the same camera.
#[derive(Debug)]
pub struct RateGovernor {
    min_interval: Duration,
    last_accepted: HashMap<Arc<str>, Instant>,
}

impl RateGovernor {
    pub fn new(max_fps: u32) -> Self {
        Self {
            min_interval: Self::interval_for(max_fps),
            last_accepted: HashMap::new(),
        }
    }

    fn interval_for(max_fps: u32) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(max_fps.max(1)))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn set_max_fps(&mut self, max_fps: u32) {
        self.min_interval = Self::interval_for(max_fps);
    }

    /// Returns true and records `now` if the camera may emit a frame.
    pub fn admit(&mut self, camera_id: &Arc<str>, now: Instant) -> bool {
        match self.last_accepted.get_mut(camera_id) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_accepted.insert(Arc::clone(camera_id), now);
                true
            }
        }
    }

    /// Drop the history of a camera nobody watches any more.
    pub fn forget(&mut self, camera_id: &str) {
        self.last_accepted.remove(camera_id);
    }

    /// Cameras with admission history.
    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn reset(&mut self) {
        self.last_accepted.clear();
    }
}

/// Delivered frames per second over roughly one-second windows.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    count: u32,
    fps: f64,
}

impl FpsMeter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            fps: 0.0,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Self::WINDOW {
            self.fps = f64::from(self.count) / elapsed.as_secs_f64();
            self.count = 0;
            self.window_start = now;
        }
    }

    /// Rate of the last completed window.
    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_each_camera_independently() {
        let mut governor = RateGovernor::new(10);
        let cam0: Arc<str> = Arc::from("cam0");
        let cam1: Arc<str> = Arc::from("cam1");
        let t0 = Instant::now();

        let mut admitted = 0;
        for i in 0..100u64 {
            if governor.admit(&cam0, t0 + Duration::from_millis(i * 10)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);

        // the other camera has its own budget
        assert!(governor.admit(&cam1, t0 + Duration::from_millis(995)));
    }

    #[test]
    fn exact_interval_is_admitted() {
        let mut governor = RateGovernor::new(30);
        let cam: Arc<str> = Arc::from("cam0");
        let t0 = Instant::now();

        assert!(governor.admit(&cam, t0));
        assert!(!governor.admit(&cam, t0 + governor.min_interval() / 2));
        assert!(governor.admit(&cam, t0 + governor.min_interval()));
    }

    #[test]
    fn reset_forgets_history() {
        let mut governor = RateGovernor::new(1);
        let cam: Arc<str> = Arc::from("cam0");
        let t0 = Instant::now();
        assert!(governor.admit(&cam, t0));
        governor.reset();
        assert!(governor.admit(&cam, t0));
    }

    #[test]
    fn forget_drops_one_camera() {
        let mut governor = RateGovernor::new(1);
        let cam0: Arc<str> = Arc::from("cam0");
        let cam1: Arc<str> = Arc::from("cam1");
        let t0 = Instant::now();
        assert!(governor.admit(&cam0, t0));
        assert!(governor.admit(&cam1, t0));

        governor.forget("cam0");
        assert_eq!(governor.tracked(), 1);
        assert!(governor.admit(&cam0, t0));
        assert!(!governor.admit(&cam1, t0));
    }

    #[test]
    fn fps_updates_once_per_window() {
        let t0 = Instant::now();
        let mut meter = FpsMeter::new(t0);

        for i in 1..=24u64 {
            meter.record(t0 + Duration::from_millis(i * 40));
        }
        // 24 frames over 960ms, window not complete yet
        assert_eq!(meter.fps(), 0.0);

        meter.record(t0 + Duration::from_millis(1000));
        assert!((meter.fps() - 25.0).abs() < 1e-9);
    }
}
