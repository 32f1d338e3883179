//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as _;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no frame grabbed")]
    NoFrame,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A frame producer split into advance and decode, so stale buffered frames
/// can be skipped without paying for their conversion.
pub trait Capture: Send {
    /// Advance to the next frame.
    fn grab(&mut self) -> Result<(), CameraError>;
    /// Decode the most recently grabbed frame.
    fn retrieve(&mut self) -> Result<RgbImage, CameraError>;
}

/// Opens a [`Capture`] for a configured source string.
pub trait CaptureOpener: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn Capture>, CameraError>;
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
    /// Packed RGB24 (3 bytes/pixel).
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"RGB3" => Some(Self::Rgb3),
            _ => None,
        }
    }
}

/// Resolve a source string to a device node: `/dev/videoN` paths pass
/// through, bare indices map to `/dev/videoN`. Anything else is not a V4L2
/// device.
pub fn device_path(source: &str) -> Result<String, CameraError> {
    let source = source.trim();
    if let Ok(index) = source.parse::<u32>() {
        return Ok(format!("/dev/video{index}"));
    }
    if source.starts_with("/dev/") {
        return Ok(source.to_string());
    }
    Err(CameraError::UnsupportedSource(source.to_string()))
}

/// Where a configured source string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// A local V4L2 node.
    Device(String),
    /// A URL (`rtsp://`, `http://`, ...) or a video file, decoded by FFmpeg.
    Stream(String),
}

pub fn classify(source: &str) -> Result<SourceKind, CameraError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(CameraError::UnsupportedSource("empty source".to_string()));
    }
    Ok(match device_path(trimmed) {
        Ok(path) => SourceKind::Device(path),
        Err(_) => SourceKind::Stream(trimmed.to_string()),
    })
}

/// Sends local devices to one opener and network/file streams to another.
pub struct SourceRouter {
    device: Arc<dyn CaptureOpener>,
    stream: Arc<dyn CaptureOpener>,
}

impl SourceRouter {
    pub fn new(device: Arc<dyn CaptureOpener>, stream: Arc<dyn CaptureOpener>) -> Self {
        Self { device, stream }
    }
}

impl CaptureOpener for SourceRouter {
    fn open(&self, source: &str) -> Result<Box<dyn Capture>, CameraError> {
        match classify(source)? {
            SourceKind::Device(_) => self.device.open(source),
            SourceKind::Stream(_) => self.stream.open(source),
        }
    }
}

/// V4L2 camera device handle with a running mmap stream.
pub struct Camera {
    stream: MmapStream<'static>,
    // Kept open for the lifetime of the stream.
    _device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    last: Option<Vec<u8>>,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video2") and start
    /// streaming at the requested size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Prefer YUYV, then MJPG (typical for 720p+ on USB 2), then RGB3.
        let mut negotiated = None;
        for fourcc in [b"YUYV", b"MJPG", b"RGB3"] {
            let mut fmt = device.format().map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
            })?;
            fmt.fourcc = FourCC::new(fourcc);
            fmt.width = width;
            fmt.height = height;
            let Ok(got) = device.set_format(&fmt) else {
                continue;
            };
            if let Some(pf) = PixelFormat::from_fourcc(got.fourcc) {
                negotiated = Some((got, pf));
                break;
            }
        }
        let (fmt, pixel_format) = negotiated.ok_or_else(|| {
            CameraError::FormatNegotiationFailed("need YUYV, MJPG, or RGB3".to_string())
        })?;

        tracing::info!(
            width = fmt.width,
            height = fmt.height,
            fourcc = ?fmt.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;

        Ok(Self {
            stream,
            _device: device,
            width: fmt.width,
            height: fmt.height,
            device_path: device_path.to_string(),
            pixel_format,
            last: None,
        })
    }

    /// Convert a raw buffer to RGB based on the negotiated format.
    fn decode(&self, buf: &[u8]) -> Result<RgbImage, CameraError> {
        let img = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf)?,
            PixelFormat::Rgb3 => frame::rgb24_to_image(buf, self.width, self.height)?,
        };
        Ok(img)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl Capture for Camera {
    fn grab(&mut self) -> Result<(), CameraError> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        if buf.is_empty() {
            return Err(CameraError::NoFrame);
        }
        let last = self.last.get_or_insert_with(Vec::new);
        last.clear();
        last.extend_from_slice(buf);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage, CameraError> {
        let buf = self.last.as_deref().ok_or(CameraError::NoFrame)?;
        self.decode(buf)
    }
}

/// Opens local V4L2 devices at a fixed requested size.
#[derive(Debug, Clone)]
pub struct V4l2Opener {
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Opener {
    fn default() -> Self {
        Self { width: 1280, height: 720 }
    }
}

impl CaptureOpener for V4l2Opener {
    fn open(&self, source: &str) -> Result<Box<dyn Capture>, CameraError> {
        let path = device_path(source)?;
        let camera = Camera::open(&path, self.width, self.height)?;
        Ok(Box::new(camera))
    }
}
