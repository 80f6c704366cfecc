use crate::engine::{EngineError, EngineHandle};
use crate::workbook::Workbook;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    workbook: Workbook,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, workbook: Workbook) -> Self {
        Self { engine, workbook }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

impl From<EngineError> for zbus::fdo::Error {
    fn from(e: EngineError) -> Self {
        failed(e)
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Select an attendance sheet and start marking recognized faces.
    async fn start_session(&self, target: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(target_name = target, "start_session requested");
        Ok(self.engine.start_session(target).await?)
    }

    /// Start capturing enrollment samples for `name`.
    async fn start_enrollment(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "start_enrollment requested");
        Ok(self.engine.start_enrollment(name).await?)
    }

    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        Ok(self.engine.stop().await?)
    }

    /// JSON array of `{name, samples}`.
    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let students = self.engine.list_students().await?;
        serde_json::to_string(&students).map_err(failed)
    }

    async fn remove_student(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove_student requested");
        Ok(self.engine.remove_student(name).await?)
    }

    /// JSON array of sheet names.
    async fn list_targets(&self) -> zbus::fdo::Result<String> {
        let targets = self.workbook.targets().map_err(failed)?;
        serde_json::to_string(&targets).map_err(failed)
    }

    /// Create an empty sheet. False if it already exists.
    async fn create_target(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(sheet = name, "create_target requested");
        self.workbook
            .create_target(name)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await?;
        serde_json::to_string(&status).map_err(failed)
    }

    /// Write the latest annotated frame to `path` as an image.
    ///
    /// Returns false if nothing has been captured yet.
    async fn save_snapshot(&self, path: &str) -> zbus::fdo::Result<bool> {
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "snapshot path must be absolute: {}",
                path.display()
            )));
        }
        let Some(frame) = self.engine.latest_frame() else {
            return Ok(false);
        };

        let dest = path.clone();
        tokio::task::spawn_blocking(move || frame.image.save(&dest))
            .await
            .map_err(failed)?
            .map_err(failed)?;
        tracing::info!(path = %path.display(), "snapshot saved");
        Ok(true)
    }
}
