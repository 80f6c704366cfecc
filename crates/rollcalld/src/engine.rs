use image::RgbImage;
use rollcall_core::pipeline::StudentSummary;
use rollcall_core::{AnnotatedFrame, FaceDetect, FaceEmbed, Pipeline, PipelineEvent, RosterError, VideoSource};
use rollcall_hw::{Camera, CameraError, FrameStream, MotorTrigger};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("roster error: {0}")]
    Roster(#[from] RosterError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Latest annotated frame, shared with snapshot readers.
pub type FrameSlot = Option<Arc<AnnotatedFrame>>;

/// Something that can begin a capture run.
pub trait CaptureDevice {
    type Source: VideoSource;

    fn start(&mut self) -> Result<Self::Source, EngineError>;
    fn describe(&self) -> String;
}

/// Frames of a running V4L2 stream.
pub struct CameraFeed(FrameStream);

impl VideoSource for CameraFeed {
    type Error = CameraError;

    fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
        self.0.next_frame().map(|frame| Some(frame.image))
    }
}

impl CaptureDevice for Camera {
    type Source = CameraFeed;

    fn start(&mut self) -> Result<CameraFeed, EngineError> {
        Ok(CameraFeed(self.stream()?))
    }

    fn describe(&self) -> String {
        format!("{} ({}x{} {:?})", self.device_path, self.width, self.height, self.fourcc)
    }
}

/// What the capture loop is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    Session,
    /// `resume_session`: go back to marking attendance once enrollment ends.
    Enrolling { resume_session: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollStatus {
    pub name: String,
    pub count: usize,
    pub target: usize,
}

/// Snapshot of engine state for `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub mode: Mode,
    pub camera: String,
    pub capturing: bool,
    pub target: Option<String>,
    pub enrollment: Option<EnrollStatus>,
    pub students: usize,
    pub frames: u64,
    pub similarity_threshold: f32,
    pub cooldown_secs: u64,
    pub last_error: Option<String>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    StartSession {
        target: String,
        reply: oneshot::Sender<bool>,
    },
    StartEnrollment {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ListStudents {
        reply: oneshot::Sender<Vec<StudentSummary>>,
    },
    RemoveStudent {
        name: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    frames: watch::Receiver<FrameSlot>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Select `target` and start marking attendance.
    pub async fn start_session(&self, target: &str) -> Result<bool, EngineError> {
        let target = target.to_string();
        self.request(|reply| EngineRequest::StartSession { target, reply }).await
    }

    pub async fn start_enrollment(&self, name: &str) -> Result<bool, EngineError> {
        let name = name.to_string();
        self.request(|reply| EngineRequest::StartEnrollment { name, reply }).await
    }

    /// Stop capturing; abandons an unfinished enrollment.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Stop { reply }).await
    }

    pub async fn list_students(&self) -> Result<Vec<StudentSummary>, EngineError> {
        self.request(|reply| EngineRequest::ListStudents { reply }).await
    }

    pub async fn remove_student(&self, name: &str) -> Result<bool, EngineError> {
        let name = name.to_string();
        self.request(|reply| EngineRequest::RemoveStudent { name, reply })
            .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Most recently published frame, if any capture has run.
    pub fn latest_frame(&self) -> FrameSlot {
        self.frames.borrow().clone()
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The pipeline and capture device are built by the caller so that model
/// and camera failures surface before anything is spawned.
pub fn spawn_engine<D, E, C>(
    pipeline: Pipeline<D, E>,
    device: C,
    trigger: Option<MotorTrigger>,
) -> Result<EngineHandle, EngineError>
where
    D: FaceDetect + 'static,
    E: FaceEmbed + 'static,
    C: CaptureDevice + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (frames_tx, frames_rx) = watch::channel::<FrameSlot>(None);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            Engine::new(pipeline, device, trigger, frames_tx).run(rx);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        frames: frames_rx,
    })
}

struct Engine<D, E, C: CaptureDevice> {
    pipeline: Pipeline<D, E>,
    device: C,
    source: Option<C::Source>,
    mode: Mode,
    trigger: Option<MotorTrigger>,
    frames_tx: watch::Sender<FrameSlot>,
    frames: u64,
    last_error: Option<String>,
}

impl<D: FaceDetect, E: FaceEmbed, C: CaptureDevice> Engine<D, E, C> {
    fn new(
        pipeline: Pipeline<D, E>,
        device: C,
        trigger: Option<MotorTrigger>,
        frames_tx: watch::Sender<FrameSlot>,
    ) -> Self {
        Self {
            pipeline,
            device,
            source: None,
            mode: Mode::Idle,
            trigger,
            frames_tx,
            frames: 0,
            last_error: None,
        }
    }

    /// Serve requests until every handle is dropped.
    ///
    /// While idle the thread blocks on the channel; while capturing, pending
    /// requests are drained between frames.
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        loop {
            if self.mode == Mode::Idle {
                match rx.blocking_recv() {
                    Some(req) => self.handle(req),
                    None => return,
                }
            }

            loop {
                match rx.try_recv() {
                    Ok(req) => self.handle(req),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }

            if self.mode != Mode::Idle {
                self.tick();
            }
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::StartSession { target, reply } => {
                let _ = reply.send(self.start_session(&target));
            }
            EngineRequest::StartEnrollment { name, reply } => {
                let _ = reply.send(self.start_enrollment(&name));
            }
            EngineRequest::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            EngineRequest::ListStudents { reply } => {
                let _ = reply.send(self.pipeline.students());
            }
            EngineRequest::RemoveStudent { name, reply } => {
                let _ = reply.send(self.remove_student(&name));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Nothing is changed unless the request succeeds: the camera is
    /// acquired before the target is switched or an enrollment dropped.
    fn start_session(&mut self, target: &str) -> bool {
        let was_idle = self.mode == Mode::Idle;
        if !self.ensure_capture() {
            return false;
        }
        if !self.pipeline.select_target(target) {
            if was_idle {
                self.end_capture();
            }
            return false;
        }
        if self.pipeline.cancel_enrollment().is_some() {
            tracing::info!("enrollment abandoned for attendance session");
        }
        self.mode = Mode::Session;
        tracing::info!(target_name = target, "attendance session started");

        if let Some(trigger) = &self.trigger {
            trigger.fire_detached();
        }
        true
    }

    fn start_enrollment(&mut self, name: &str) -> bool {
        let was_idle = self.mode == Mode::Idle;
        if !self.ensure_capture() {
            return false;
        }
        if !self.pipeline.start_enrollment(name) {
            if was_idle {
                self.end_capture();
            }
            return false;
        }
        let resume_session = matches!(
            self.mode,
            Mode::Session | Mode::Enrolling { resume_session: true }
        );
        self.mode = Mode::Enrolling { resume_session };
        true
    }

    fn stop(&mut self) {
        self.pipeline.cancel_enrollment();
        self.end_capture();
        tracing::info!("capture stopped");
    }

    fn remove_student(&mut self, name: &str) -> Result<bool, EngineError> {
        if self.pipeline.enroller().session().is_some_and(|s| s.name == name.trim()) {
            self.pipeline.cancel_enrollment();
            if let Mode::Enrolling { resume_session } = self.mode {
                self.after_enrollment(resume_session);
            }
        }
        Ok(self.pipeline.remove_identity(name)?)
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            mode: self.mode,
            camera: self.device.describe(),
            capturing: self.source.is_some(),
            target: self.pipeline.gate().target().map(str::to_string),
            enrollment: self.pipeline.enroller().session().map(|s| EnrollStatus {
                name: s.name.clone(),
                count: s.count,
                target: s.target,
            }),
            students: self.pipeline.enroller().roster().len(),
            frames: self.frames,
            similarity_threshold: self.pipeline.recognizer().threshold(),
            cooldown_secs: self.pipeline.gate().cooldown().as_secs(),
            last_error: self.last_error.clone(),
        }
    }

    /// Make sure a capture run is in progress.
    fn ensure_capture(&mut self) -> bool {
        if self.source.is_some() {
            return true;
        }
        match self.device.start() {
            Ok(source) => {
                self.source = Some(source);
                self.last_error = None;
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start capture");
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn end_capture(&mut self) {
        self.source = None;
        self.mode = Mode::Idle;
    }

    fn after_enrollment(&mut self, resume_session: bool) {
        if resume_session && self.pipeline.gate().target().is_some() {
            self.mode = Mode::Session;
        } else {
            self.end_capture();
        }
    }

    /// Process one frame from the running capture.
    fn tick(&mut self) {
        let Some(source) = self.source.as_mut() else {
            self.mode = Mode::Idle;
            return;
        };

        let report = match self.pipeline.step(source) {
            Ok(Some(report)) => report,
            Ok(None) => {
                tracing::info!("video source ended");
                self.pipeline.cancel_enrollment();
                self.end_capture();
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "camera read failed; ending capture");
                self.last_error = Some(e.to_string());
                self.pipeline.cancel_enrollment();
                self.end_capture();
                return;
            }
        };

        self.frames += 1;
        for event in &report.events {
            match event {
                PipelineEvent::EnrollmentCompleted { name, samples } => {
                    tracing::info!(name = %name, samples, "enrollment completed");
                    if let Mode::Enrolling { resume_session } = self.mode {
                        self.after_enrollment(resume_session);
                    }
                }
                PipelineEvent::AttendanceMarked { identity } => {
                    tracing::debug!(identity = %identity, "attendance event");
                }
            }
        }

        self.frames_tx.send_replace(Some(Arc::new(report.frame)));
    }
}
