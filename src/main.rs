//! camstream: camera capture, stage processing and MJPEG fan-out

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camstream::capture::{Frame, FrameSource, TestPatternSource};
use camstream::stream::{ClientCallbacks, EngineState};
use camstream::{CameraServer, Config, SourceKind};
use color_eyre::Result;
use flume::{bounded, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn spawn_capture<S>(mut source: S, tx: Sender<Frame>) -> JoinHandle<()>
where
    S: FrameSource + 'static,
{
    tokio::spawn(async move {
        info!(camera = source.camera_id(), "Capture task started");
        loop {
            match source.capture_frame().await {
                Ok(frame) => {
                    if let Err(e) = tx.send_async(frame).await {
                        error!("Failed to send frame: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    error!("Capture error: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
}

#[cfg(feature = "v4l2")]
fn open_device(config: &Config) -> Result<camstream::capture::V4l2Capture> {
    use camstream::utils;

    let mut capture_config = config.capture.clone();
    if capture_config.device.is_empty() {
        let found = utils::auto_detect_device()?;
        capture_config.device = found.path;
        capture_config.format = found.format;
    }
    info!("Using capture device: {}", capture_config.device);

    let mut capture = camstream::capture::V4l2Capture::new(capture_config)?;
    capture.start_stream()?;
    Ok(capture)
}

#[cfg(not(feature = "v4l2"))]
fn open_device(_config: &Config) -> Result<TestPatternSource> {
    Err(color_eyre::eyre::eyre!(
        "capture.source = \"v4l2\" needs a build with the `v4l2` feature"
    ))
}

fn spawn_demo_viewers(server: &CameraServer, config: &Config) {
    for i in 0..config.service.demo_viewers {
        let id = format!("viewer-{i}");
        let camera_id = config.capture.camera_id.as_str();
        let subscription = match server.engine().add_client(id.as_str(), camera_id) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(viewer = %id, "Demo viewer not attached: {}", e);
                continue;
            }
        };

        let closed_id = id.clone();
        let callbacks = ClientCallbacks::new(|frame| {
            debug!(
                bytes = frame.jpeg.len(),
                sequence = frame.sequence,
                "Viewer received frame"
            );
            Ok(())
        })
        .on_error(|message| warn!("Viewer error: {}", message))
        .on_close(move || info!(viewer = %closed_id, "Viewer closed"));

        tokio::spawn(subscription.pump(callbacks));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camstream launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    let server = Arc::new(CameraServer::new(&config)?);

    // Capture -> producer channel
    let (tx, rx) = bounded::<Frame>(config.capture.queue_depth.max(1));

    let capture_handle = match config.capture.source {
        SourceKind::TestPattern => spawn_capture(TestPatternSource::new(&config.capture), tx),
        SourceKind::V4l2 => spawn_capture(open_device(&config)?, tx),
    };

    // Producer: process and distribute every captured frame
    let producer = tokio::task::spawn_blocking({
        let server = Arc::clone(&server);
        move || {
            while let Ok(frame) = rx.recv() {
                server.on_frame(&frame);
            }
            info!("Producer stopped");
        }
    });

    spawn_demo_viewers(&server, &config);

    let reaper = tokio::spawn({
        let server = Arc::clone(&server);
        let stale_after = config.stream.stale_after();
        let period = Duration::from_secs(config.service.reap_interval_secs.max(1));
        async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                server.engine().reap_stale(stale_after);
            }
        }
    });

    let stats = tokio::spawn({
        let server = Arc::clone(&server);
        let period = Duration::from_secs(config.service.stats_interval_secs.max(1));
        async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let status = server.engine().status();
                if status.state == EngineState::Error {
                    warn!(
                        error = status.last_error.as_deref().unwrap_or("unknown"),
                        "Stream engine in error state"
                    );
                }
                info!(
                    state = %status.state,
                    clients = status.clients,
                    fps = format!("{:.1}", status.current_fps),
                    encoded = status.frames_encoded,
                    encode_failures = status.encode_failures,
                    drops = status.session_drops,
                    "Stream stats"
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    capture_handle.abort();
    reaper.abort();
    stats.abort();
    server.shutdown();
    producer.await?;

    info!("camstream shutting down");
    Ok(())
}
