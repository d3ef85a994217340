use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// All state guarded this way is kept consistent between statements, so a
/// poisoned lock carries no torn data.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T: ?Sized>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T: ?Sized>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "v4l2")]
pub use device::{auto_detect_device, FoundDevice};

#[cfg(feature = "v4l2")]
mod device {
    use serde::{Deserialize, Serialize};
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use crate::capture::PixelFormat;
    use crate::error::CaptureError;

    // Detected capture device info
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FoundDevice {
        pub path: String,
        pub format: PixelFormat,
    }

    /// Auto-detect the first capture device, preferring MJPEG over YUYV
    pub fn auto_detect_device() -> Result<FoundDevice, CaptureError> {
        use std::path::Path;

        info!("Auto-detecting capture devices...");

        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }

            if let Ok(formats) = dev.enum_formats() {
                let has = |code: &[u8; 4]| formats.iter().any(|f| f.fourcc == FourCC::new(code));
                let format = if has(b"MJPG") {
                    PixelFormat::Mjpeg
                } else if has(b"YUYV") {
                    PixelFormat::Yuyv
                } else {
                    continue;
                };
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                return Ok(FoundDevice { path, format });
            }
        }

        Err(CaptureError::Device("no suitable capture device found".into()))
    }
}
