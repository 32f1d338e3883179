//! facewatch-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access, FFmpeg decoding of network streams,
//! pixel format conversion and the reconnecting [`FrameSource`] that keeps the
//! newest frame of a camera.

pub mod camera;
pub mod frame;
pub mod network;
pub mod source;

pub use camera::{
    classify, Camera, CameraError, Capture, CaptureOpener, PixelFormat, SourceKind, SourceRouter, V4l2Opener,
};
pub use frame::{Frame, FrameError};
pub use network::{FfmpegCapture, FfmpegOpener};
pub use source::{FrameSource, SourceConfig, SourceError, SourceMetrics, SourceStatus};
