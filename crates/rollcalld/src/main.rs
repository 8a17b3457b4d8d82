use anyhow::{Context, Result};
use rollcall_core::{CosineSimilarity, DetectorConfig, EngineConfig, MatchingEngine, OnnxEncoder};
use rollcall_hw::{Camera, FrameSource};
use rollcall_records::{AttendanceService, Stores};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod session;
#[cfg(test)]
mod testing;

use config::{Config, StorageKind};
use dbus_interface::{AttendanceBus, BUS_NAME, OBJECT_PATH};
use engine::{CaptureSettings, SourceOpener};
use session::SessionController;

fn open_stores(config: &Config) -> Result<(Stores, String)> {
    match config.storage {
        StorageKind::Json => Ok((Stores::json(&config.data_dir), format!("json:{}", config.data_dir.display()))),
        StorageKind::Sqlite => {
            let path = config.db_path();
            let stores = Stores::sqlite(&path).with_context(|| format!("opening {}", path.display()))?;
            Ok((stores, format!("sqlite:{}", path.display())))
        }
    }
}

fn camera_opener(config: &Config) -> SourceOpener {
    let device = config.camera_device.clone();
    let (width, height) = (config.camera_width, config.camera_height);
    Box::new(move || Camera::open(&device, width, height).map(|camera| Box::new(camera) as Box<dyn FrameSource>))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::load();

    let (stores, storage) = open_stores(&config)?;
    let mut service = AttendanceService::open(stores);
    if let Some(password) = config.bootstrap_admin_password.as_deref() {
        service.bootstrap_admin(password).context("bootstrapping administrator")?;
    }
    tracing::info!(storage = %storage, faces = service.face_stats().count, "records loaded");
    let service = Arc::new(Mutex::new(service));

    // Load models up front so a missing file fails at startup, not mid-session.
    let encoder = OnnxEncoder::load(&config.model_dir, DetectorConfig::default(), config.max_faces)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let matcher = MatchingEngine::new(
        encoder,
        CosineSimilarity,
        EngineConfig {
            match_threshold: config.match_threshold,
            region_iou_threshold: config.region_iou_threshold,
        },
    );
    let engine = engine::spawn_engine(
        matcher,
        camera_opener(&config),
        CaptureSettings {
            warmup_frames: config.warmup_frames,
            frames_per_capture: config.frames_per_capture,
        },
    )?;

    let sessions = Arc::new(SessionController::new(
        engine.clone(),
        Arc::clone(&service),
        config.session_interval(),
    ));

    let bus = AttendanceBus {
        service,
        engine,
        sessions: Arc::clone(&sessions),
        camera_device: config.camera_device.clone(),
        storage,
        match_threshold: config.match_threshold,
    };

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, bus)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, system = config.system_bus, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    sessions.stop().await;

    Ok(())
}
