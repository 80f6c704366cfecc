//! Per-frame attendance pipeline.
//!
//! detect → clamp/crop → resize → embed → enroll or (recognize → mark) →
//! annotate. The pipeline owns the recognizer, enroller and gate, so every
//! roster mutation and prototype rebuild happens on whichever thread drives
//! it, between frames.

use crate::attendance::AttendanceGate;
use crate::detector::FaceDetector;
use crate::embedder::{EmbedderError, FaceEmbedder, FACENET_INPUT_SIZE};
use crate::enrollment::{EnrollProgress, Enroller, RosterChange, RosterUpdated};
use crate::recognizer::Recognizer;
use crate::store::RosterError;
use crate::types::{CropRect, Embedding, FaceBox, Identity};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::Serialize;

const COLOR_RECOGNIZED: Rgb<u8> = Rgb([0, 255, 0]);
const COLOR_OTHER: Rgb<u8> = Rgb([255, 0, 0]);
const OUTLINE_THICKNESS: u32 = 2;

/// Anything that finds faces in a frame.
pub trait FaceDetect: Send {
    fn detect(&mut self, frame: &RgbImage) -> Vec<FaceBox>;
}

/// Anything that turns a face crop into an embedding.
pub trait FaceEmbed: Send {
    /// Side length of the square crop the embedder expects.
    fn input_size(&self) -> u32;
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError>;
}

impl FaceDetect for FaceDetector {
    fn detect(&mut self, frame: &RgbImage) -> Vec<FaceBox> {
        FaceDetector::detect(self, frame)
    }
}

impl FaceEmbed for FaceEmbedder {
    fn input_size(&self) -> u32 {
        FACENET_INPUT_SIZE
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        FaceEmbedder::embed(self, face)
    }
}

/// Pull-based frame source. `Ok(None)` is end-of-stream.
pub trait VideoSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn next_frame(&mut self) -> Result<Option<RgbImage>, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Enrolling,
    Recognized,
    Unknown,
}

/// One labelled face box drawn on a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlay {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub kind: OverlayKind,
    pub label: String,
}

/// A processed frame: the image with box outlines drawn in, plus labels.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub sequence: u64,
    pub image: RgbImage,
    pub overlays: Vec<Overlay>,
}

/// Noteworthy things that happened while processing a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    EnrollmentCompleted { name: String, samples: usize },
    AttendanceMarked { identity: String },
}

pub struct FrameReport {
    pub frame: AnnotatedFrame,
    pub events: Vec<PipelineEvent>,
}

/// Error returned by [`Pipeline::step`] when the source gives up.
#[derive(Debug, thiserror::Error)]
#[error("frame source failed: {0}")]
pub struct SourceFailed<E: std::error::Error + 'static>(#[source] pub E);

/// Roster summary for control surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentSummary {
    pub name: String,
    pub samples: usize,
}

pub struct Pipeline<D, E> {
    detector: D,
    embedder: E,
    recognizer: Recognizer,
    enroller: Enroller,
    gate: AttendanceGate,
    sequence: u64,
}

impl<D: FaceDetect, E: FaceEmbed> Pipeline<D, E> {
    /// Assemble a pipeline; the recognizer starts from the enroller's roster.
    pub fn new(detector: D, embedder: E, enroller: Enroller, gate: AttendanceGate, threshold: f32) -> Self {
        let recognizer = Recognizer::new(enroller.roster(), threshold);
        Self {
            detector,
            embedder,
            recognizer,
            enroller,
            gate,
            sequence: 0,
        }
    }

    /// Pull one frame from `source` and process it.
    ///
    /// `Ok(None)` means the source is exhausted; errors end the capture run.
    pub fn step<S: VideoSource>(&mut self, source: &mut S) -> Result<Option<FrameReport>, SourceFailed<S::Error>> {
        match source.next_frame().map_err(SourceFailed)? {
            Some(frame) => Ok(Some(self.process_frame(frame))),
            None => Ok(None),
        }
    }

    /// Run every detected face of `frame` through the pipeline.
    pub fn process_frame(&mut self, mut frame: RgbImage) -> FrameReport {
        self.sequence += 1;
        let boxes = self.detector.detect(&frame);
        let mut overlays = Vec::with_capacity(boxes.len());
        let mut events = Vec::new();

        if !boxes.is_empty() {
            tracing::trace!(seq = self.sequence, faces = boxes.len(), "faces detected");
        }

        for face in &boxes {
            let Some(rect) = face.clamp(frame.width(), frame.height()) else {
                continue;
            };

            let size = self.embedder.input_size();
            let crop = imageops::crop_imm(&frame, rect.x, rect.y, rect.width, rect.height).to_image();
            let crop = imageops::resize(&crop, size, size, FilterType::Triangle);

            let embedding = match self.embedder.embed(&crop) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed; skipping face");
                    continue;
                }
            };

            let overlay = if self.enroller.is_active() {
                self.enroll_face(embedding, rect, &mut events)
            } else {
                self.recognize_face(&embedding, rect, &mut events)
            };
            overlays.push(overlay);
        }

        for overlay in &overlays {
            let color = match overlay.kind {
                OverlayKind::Recognized => COLOR_RECOGNIZED,
                OverlayKind::Enrolling | OverlayKind::Unknown => COLOR_OTHER,
            };
            draw_outline(&mut frame, overlay, color);
        }

        FrameReport {
            frame: AnnotatedFrame {
                sequence: self.sequence,
                image: frame,
                overlays,
            },
            events,
        }
    }

    fn enroll_face(&mut self, embedding: Embedding, rect: CropRect, events: &mut Vec<PipelineEvent>) -> Overlay {
        let label = match self.enroller.process(embedding) {
            EnrollProgress::Captured { name, count, target } => {
                format!("Enrolling {name}: {count}/{target}")
            }
            EnrollProgress::Completed(update) => {
                let label = match &update.change {
                    RosterChange::Enrolled { name, samples } => {
                        events.push(PipelineEvent::EnrollmentCompleted {
                            name: name.clone(),
                            samples: *samples,
                        });
                        format!("Enrolled {name}")
                    }
                    RosterChange::Removed { name } => format!("Removed {name}"),
                };
                self.apply(update);
                label
            }
            EnrollProgress::Ignored => "Enrolling".to_string(),
        };

        overlay(rect, OverlayKind::Enrolling, label)
    }

    fn recognize_face(&mut self, embedding: &Embedding, rect: CropRect, events: &mut Vec<PipelineEvent>) -> Overlay {
        let result = self.recognizer.recognize(embedding);
        let label = format!("{} ({:.2})", result.identity, result.score);

        match &result.identity {
            Identity::Known(name) => {
                if self.gate.mark(name) {
                    events.push(PipelineEvent::AttendanceMarked {
                        identity: name.clone(),
                    });
                }
                overlay(rect, OverlayKind::Recognized, label)
            }
            Identity::Unknown => {
                tracing::trace!(score = result.score, "unrecognized face");
                overlay(rect, OverlayKind::Unknown, label)
            }
        }
    }

    /// Hand a roster snapshot to the recognizer.
    fn apply(&mut self, update: RosterUpdated) {
        self.recognizer.update(&update.roster);
    }

    pub fn start_enrollment(&mut self, name: &str) -> bool {
        self.enroller.start(name)
    }

    pub fn cancel_enrollment(&mut self) -> Option<String> {
        self.enroller.cancel()
    }

    /// Delete an identity and stop matching against it.
    pub fn remove_identity(&mut self, name: &str) -> Result<bool, RosterError> {
        match self.enroller.remove(name)? {
            Some(update) => {
                self.apply(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn select_target(&mut self, name: &str) -> bool {
        self.gate.select_target(name)
    }

    pub fn students(&self) -> Vec<StudentSummary> {
        self.enroller
            .roster()
            .iter()
            .map(|(name, samples)| StudentSummary {
                name: name.clone(),
                samples: samples.len(),
            })
            .collect()
    }

    pub fn is_enrolling(&self) -> bool {
        self.enroller.is_active()
    }

    pub fn enroller(&self) -> &Enroller {
        &self.enroller
    }

    pub fn recognizer(&self) -> &Recognizer {
        &self.recognizer
    }

    pub fn gate(&self) -> &AttendanceGate {
        &self.gate
    }
}

fn overlay(rect: CropRect, kind: OverlayKind, label: String) -> Overlay {
    Overlay {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
        kind,
        label,
    }
}

/// Draw a hollow rectangle, clipped to the image.
fn draw_outline(image: &mut RgbImage, overlay: &Overlay, color: Rgb<u8>) {
    let (w, h) = image.dimensions();
    let x2 = (overlay.x + overlay.width).min(w);
    let y2 = (overlay.y + overlay.height).min(h);

    for y in overlay.y..y2 {
        for x in overlay.x..x2 {
            let on_edge = x < overlay.x + OUTLINE_THICKNESS
                || y < overlay.y + OUTLINE_THICKNESS
                || x + OUTLINE_THICKNESS >= x2
                || y + OUTLINE_THICKNESS >= y2;
            if on_edge {
                image.put_pixel(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::testing::{noon, ManualClock, RecordingSink};
    use crate::attendance::DEFAULT_COOLDOWN;
    use crate::enrollment::EnrollmentConfig;
    use crate::store::{MemoryRosterStore, RosterStore};
    use crate::types::Roster;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Returns the same boxes for every frame.
    struct FixedDetector(Vec<FaceBox>);

    impl FaceDetect for FixedDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Vec<FaceBox> {
            self.0.clone()
        }
    }

    /// Embeds a face as its mean colour, so tests control identity by colour.
    struct ColorEmbedder {
        calls: usize,
    }

    impl FaceEmbed for ColorEmbedder {
        fn input_size(&self) -> u32 {
            8
        }

        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
            assert_eq!(face.dimensions(), (8, 8));
            self.calls += 1;
            let n = (face.width() * face.height()) as f32;
            let mut sum = [0.0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    sum[c] += p.0[c] as f32;
                }
            }
            Ok(Embedding::new(sum.iter().map(|s| s / n).collect()))
        }
    }

    struct FailingEmbedder;

    impl FaceEmbed for FailingEmbedder {
        fn input_size(&self) -> u32 {
            8
        }

        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, EmbedderError> {
            Err(EmbedderError::InferenceFailed("boom".into()))
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("camera unplugged")]
    struct Unplugged;

    struct ScriptedSource(VecDeque<Result<Option<RgbImage>, Unplugged>>);

    impl VideoSource for ScriptedSource {
        type Error = Unplugged;

        fn next_frame(&mut self) -> Result<Option<RgbImage>, Unplugged> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    const RED: [u8; 3] = [200, 10, 10];
    const BLUE: [u8; 3] = [10, 10, 200];

    fn frame(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(64, 48, Rgb(color))
    }

    fn face_box(x1: i32, y1: i32, x2: i32, y2: i32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence: 0.9 }
    }

    struct Harness {
        pipeline: Pipeline<FixedDetector, ColorEmbedder>,
        sink: RecordingSink,
        clock: ManualClock,
        store: MemoryRosterStore,
    }

    fn harness(roster: Roster, boxes: Vec<FaceBox>, max_samples: usize) -> Harness {
        let store = MemoryRosterStore::new(roster);
        let enroller = Enroller::open(
            Box::new(store.clone()),
            EnrollmentConfig {
                max_samples,
                sample_interval: Duration::ZERO,
            },
        )
        .unwrap();
        let sink = RecordingSink::with_targets(&["Period-1"]);
        let clock = ManualClock::at(noon());
        let gate = AttendanceGate::with_clock(Box::new(sink.clone()), Box::new(clock.clone()), DEFAULT_COOLDOWN);
        let pipeline = Pipeline::new(
            FixedDetector(boxes),
            ColorEmbedder { calls: 0 },
            enroller,
            gate,
            0.65,
        );
        Harness {
            pipeline,
            sink,
            clock,
            store,
        }
    }

    fn red_roster() -> Roster {
        let mut roster = Roster::new();
        roster.insert("red".into(), vec![Embedding::new(vec![200.0, 10.0, 10.0])]);
        roster
    }

    #[test]
    fn test_recognized_face_marks_attendance_once() {
        let mut h = harness(red_roster(), vec![face_box(10, 10, 30, 30)], 3);
        assert!(h.pipeline.select_target("Period-1"));

        let report = h.pipeline.process_frame(frame(RED));
        assert_eq!(report.events, vec![PipelineEvent::AttendanceMarked { identity: "red".into() }]);
        assert_eq!(report.frame.overlays.len(), 1);
        assert_eq!(report.frame.overlays[0].kind, OverlayKind::Recognized);
        assert!(report.frame.overlays[0].label.starts_with("red ("));

        // Still within cooldown: recognized, but no second record.
        h.clock.advance(Duration::from_secs(5));
        let report = h.pipeline.process_frame(frame(RED));
        assert!(report.events.is_empty());
        assert_eq!(report.frame.overlays[0].kind, OverlayKind::Recognized);
        assert_eq!(h.sink.records().len(), 1);
    }

    #[test]
    fn test_unknown_face_is_not_marked() {
        let mut h = harness(red_roster(), vec![face_box(10, 10, 30, 30)], 3);
        h.pipeline.select_target("Period-1");

        let report = h.pipeline.process_frame(frame(BLUE));
        assert!(report.events.is_empty());
        assert_eq!(report.frame.overlays[0].kind, OverlayKind::Unknown);
        assert!(report.frame.overlays[0].label.starts_with("Unknown ("));
        assert!(h.sink.records().is_empty());
    }

    #[test]
    fn test_recognition_without_target_still_annotates() {
        let mut h = harness(red_roster(), vec![face_box(10, 10, 30, 30)], 3);
        let report = h.pipeline.process_frame(frame(RED));
        assert!(report.events.is_empty());
        assert_eq!(report.frame.overlays[0].kind, OverlayKind::Recognized);
    }

    #[test]
    fn test_enrollment_hot_swaps_recognizer() {
        let mut h = harness(Roster::new(), vec![face_box(0, 0, 20, 20)], 3);
        h.pipeline.select_target("Period-1");
        assert!(h.pipeline.start_enrollment("blue"));

        let mut completed = Vec::new();
        for _ in 0..3 {
            let report = h.pipeline.process_frame(frame(BLUE));
            assert_eq!(report.frame.overlays[0].kind, OverlayKind::Enrolling);
            completed.extend(report.events);
        }
        assert_eq!(
            completed,
            vec![PipelineEvent::EnrollmentCompleted { name: "blue".into(), samples: 3 }]
        );
        assert!(!h.pipeline.is_enrolling());
        assert_eq!(h.store.load().unwrap()["blue"].len(), 3);

        // The very next frame is matched against the new prototype.
        let report = h.pipeline.process_frame(frame(BLUE));
        assert_eq!(report.events, vec![PipelineEvent::AttendanceMarked { identity: "blue".into() }]);
    }

    #[test]
    fn test_enrolling_frames_do_not_mark() {
        let mut h = harness(red_roster(), vec![face_box(0, 0, 20, 20)], 5);
        h.pipeline.select_target("Period-1");
        h.pipeline.start_enrollment("new");
        let report = h.pipeline.process_frame(frame(RED));
        assert!(report.events.is_empty());
        assert_eq!(report.frame.overlays[0].label, "Enrolling new: 1/5");
        assert!(h.sink.records().is_empty());
    }

    #[test]
    fn test_remove_identity_stops_matching() {
        let mut h = harness(red_roster(), vec![face_box(10, 10, 30, 30)], 3);
        assert!(h.pipeline.remove_identity("red").unwrap());
        assert!(!h.pipeline.remove_identity("red").unwrap());

        let report = h.pipeline.process_frame(frame(RED));
        assert_eq!(report.frame.overlays[0].kind, OverlayKind::Unknown);
        assert!(h.pipeline.students().is_empty());
    }

    #[test]
    fn test_out_of_frame_boxes_are_skipped() {
        let boxes = vec![
            face_box(100, 100, 140, 140), // entirely outside 64x48
            face_box(20, 20, 20, 40),     // zero width
            face_box(-10, -10, 16, 16),   // overhangs: clamped
        ];
        let mut h = harness(red_roster(), boxes, 3);
        let report = h.pipeline.process_frame(frame(RED));
        assert_eq!(report.frame.overlays.len(), 1);
        let o = &report.frame.overlays[0];
        assert_eq!((o.x, o.y, o.width, o.height), (0, 0, 16, 16));
    }

    #[test]
    fn test_embedding_failure_skips_face() {
        let store = MemoryRosterStore::new(red_roster());
        let enroller = Enroller::open(Box::new(store), EnrollmentConfig::default()).unwrap();
        let gate = AttendanceGate::new(Box::new(RecordingSink::default()), DEFAULT_COOLDOWN);
        let mut pipeline = Pipeline::new(
            FixedDetector(vec![face_box(0, 0, 10, 10)]),
            FailingEmbedder,
            enroller,
            gate,
            0.65,
        );
        let report = pipeline.process_frame(frame(RED));
        assert!(report.frame.overlays.is_empty());
        assert_eq!(report.frame.sequence, 1);
    }

    #[test]
    fn test_outline_drawn_in_overlay_color() {
        let mut h = harness(red_roster(), vec![face_box(10, 10, 30, 30)], 3);
        let report = h.pipeline.process_frame(frame(RED));
        let img = &report.frame.image;
        assert_eq!(img.get_pixel(10, 10), &COLOR_RECOGNIZED);
        assert_eq!(img.get_pixel(29, 29), &COLOR_RECOGNIZED);
        // Interior untouched.
        assert_eq!(img.get_pixel(20, 20), &Rgb(RED));
    }

    #[test]
    fn test_step_until_end_of_stream() {
        let mut h = harness(red_roster(), vec![], 3);
        let mut source = ScriptedSource(VecDeque::from(vec![Ok(Some(frame(RED))), Ok(Some(frame(BLUE)))]));

        let mut frames = 0;
        while let Some(report) = h.pipeline.step(&mut source).unwrap() {
            frames += 1;
            assert_eq!(report.frame.sequence, frames);
        }
        assert_eq!(frames, 2);
        assert_eq!(h.pipeline.embedder.calls, 0);
    }

    #[test]
    fn test_step_surfaces_source_failure() {
        let mut h = harness(red_roster(), vec![], 3);
        let mut source = ScriptedSource(VecDeque::from(vec![Err(Unplugged)]));
        let err = h.pipeline.step(&mut source).err().unwrap();
        assert_eq!(err.to_string(), "frame source failed: camera unplugged");
    }

    #[test]
    fn test_students_summary() {
        let mut roster = red_roster();
        roster.insert("blue".into(), vec![Embedding::new(vec![1.0; 3]); 4]);
        let h = harness(roster, vec![], 3);
        assert_eq!(
            h.pipeline.students(),
            vec![
                StudentSummary { name: "blue".into(), samples: 4 },
                StudentSummary { name: "red".into(), samples: 1 },
            ]
        );
    }
}
