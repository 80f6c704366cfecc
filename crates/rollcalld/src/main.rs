use anyhow::{Context, Result};
use rollcall_core::{AttendanceGate, EnrollmentConfig, Enroller, FaceDetector, FaceEmbedder, Pipeline};
use rollcall_hw::{Camera, MotorTrigger};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;
mod workbook;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load()?;

    // Models, camera and roster are fatal if missing.
    let detector = FaceDetector::load(&config.detector_model_path())
        .context("failed to load face detector")?
        .with_confidence(config.detection_confidence);
    let embedder = FaceEmbedder::load(&config.embedder_model_path(), config.embedder_layout)
        .context("failed to load FaceNet embedder")?;

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;

    let roster_store = store::SqliteRosterStore::open(&config.db_path)
        .with_context(|| format!("failed to open roster database {}", config.db_path.display()))?;
    let enroller = Enroller::open(
        Box::new(roster_store),
        EnrollmentConfig {
            max_samples: config.enroll_samples,
            sample_interval: Duration::from_millis(config.enroll_interval_ms),
        },
    )
    .context("failed to load roster")?;

    let workbook = workbook::Workbook::open(&config.workbook_dir)
        .with_context(|| format!("failed to open workbook {}", config.workbook_dir.display()))?;
    let gate = AttendanceGate::new(
        Box::new(workbook::WorkbookSink::new(workbook.clone())),
        Duration::from_secs(config.cooldown_secs),
    );

    let mut pipeline = Pipeline::new(detector, embedder, enroller, gate, config.similarity_threshold);
    if let Some(target) = &config.default_target {
        if workbook.contains(target) {
            pipeline.select_target(target);
        } else {
            tracing::info!(sheet = %target, "default attendance sheet not found; none selected");
        }
    }

    let trigger = config
        .trigger_enabled
        .then(|| MotorTrigger::new(config.trigger_port.clone(), config.trigger_baud));

    let engine = engine::spawn_engine(pipeline, camera, trigger)?;

    let service = dbus_interface::AttendanceService::new(engine, workbook);
    let _conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = dbus_interface::BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
