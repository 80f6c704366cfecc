//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use image::RgbImage;
use std::io;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::{Capabilities, Flags as CapFlags};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

const REQUESTED_FOURCC: &[u8; 4] = b"YUYV";
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const VIDEO_NODE_SCAN: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Conversion(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// Packed 24-bit RGB.
    Rgb3,
    /// 8-bit grayscale (IR cameras).
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"RGB3" => Some(Self::Rgb3),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Mjpg => frame::mjpg_to_rgb(buf),
            Self::Rgb3 => frame::rgb24_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and negotiate a capture format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let (device, caps) = open_capture_node(device_path)?;
        let (format, pixel_format) = negotiate(&device)?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = format.width,
            height = format.height,
            fourcc = ?format.fourcc,
            "camera ready"
        );

        Ok(Self {
            device,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    /// Start a memory-mapped capture stream.
    ///
    /// Streaming stops when the returned value is dropped.
    pub fn stream(&self) -> Result<FrameStream, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| busy_or(e, |e| CameraError::CaptureFailed(format!("mmap stream: {e}"))))?;

        Ok(FrameStream {
            stream,
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
        })
    }

    /// Capture a single frame on a short-lived stream.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        self.stream()?.next_frame()
    }

    /// Capture-capable nodes among `/dev/video0` .. `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..VIDEO_NODE_SCAN)
            .map(|i| format!("/dev/video{i}"))
            .filter_map(|path| {
                let (_, caps) = open_capture_node(&path).ok()?;
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Open a node and check that it can capture video.
fn open_capture_node(path: &str) -> Result<(Device, Capabilities), CameraError> {
    let device = Device::with_path(path).map_err(|e| open_error(path, e))?;
    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("{path}: query capabilities: {e}")))?;
    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }
    Ok((device, caps))
}

/// Request 640x480 YUYV and accept whatever supported format the driver
/// settles on (MJPG is common).
fn negotiate(device: &Device) -> Result<(Format, PixelFormat), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
    wanted.fourcc = FourCC::new(REQUESTED_FOURCC);
    wanted.width = REQUESTED_WIDTH;
    wanted.height = REQUESTED_HEIGHT;

    let format = device
        .set_format(&wanted)
        .map_err(|e| busy_or(e, |e| CameraError::FormatNegotiationFailed(format!("set format: {e}"))))?;
    let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format {:?}; need YUYV, MJPG, RGB3 or GREY",
            format.fourcc
        ))
    })?;
    Ok((format, pixel_format))
}

fn is_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::libc::EBUSY)
}

fn busy_or(e: io::Error, other: impl FnOnce(io::Error) -> CameraError) -> CameraError {
    if is_busy(&e) {
        CameraError::DeviceBusy
    } else {
        other(e)
    }
}

fn open_error(path: &str, e: io::Error) -> CameraError {
    busy_or(e, |e| match e.kind() {
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(path.to_string()),
        _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
    })
}

/// A running capture stream yielding RGB frames.
pub struct FrameStream {
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl FrameStream {
    /// Dequeue the next buffer and convert it to RGB.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };
        let image = self.pixel_format.to_rgb(payload, self.width, self.height)?;

        Ok(Frame {
            image,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }
}
