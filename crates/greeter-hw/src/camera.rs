//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Rotation};
use greeter_core::collaborators::{FrameSource, SourceError};
use greeter_core::types::Frame;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// errno for a device that has been unplugged.
const ENODEV: i32 = 19;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl CameraError {
    /// The device is gone; no later capture can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CameraError::Disconnected(_) | CameraError::DeviceNotFound(_))
    }
}

impl From<CameraError> for SourceError {
    fn from(e: CameraError) -> Self {
        if e.is_fatal() {
            SourceError::Closed(e.to_string())
        } else {
            SourceError::Transient(e.to_string())
        }
    }
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
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(PixelFormat::Mjpg)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle with a running capture stream.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    rotation: Rotation,
    sequence: u64,
}

impl Camera {
    /// Open a V4L2 camera by path (e.g. "/dev/video0") and start streaming.
    ///
    /// `width`/`height` are a request; the driver may pick the nearest mode.
    pub fn open(
        device_path: &str,
        width: u32,
        height: u32,
        rotation: Rotation,
    ) -> Result<Self, CameraError> {
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

        // Prefer MJPG at larger sizes (USB bandwidth); fall back to whatever
        // the driver negotiates if it is one we can convert.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.width = width;
        fmt.height = height;

        let mut negotiated = None;
        for fourcc in [b"MJPG", b"YUYV", b"GREY"] {
            fmt.fourcc = FourCC::new(fourcc);
            match device.set_format(&fmt) {
                Ok(f) if PixelFormat::from_fourcc(f.fourcc).is_some() => {
                    negotiated = Some(f);
                    break;
                }
                Ok(f) => tracing::debug!(requested = ?fmt.fourcc, got = ?f.fourcc, "format refused"),
                Err(e) => tracing::debug!(requested = ?fmt.fourcc, error = %e, "set_format failed"),
            }
        }

        let negotiated = negotiated.ok_or_else(|| {
            CameraError::FormatNegotiationFailed("unsupported pixel format (need MJPG, YUYV, or GREY)".into())
        })?;
        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!("unsupported pixel format: {fourcc:?}"))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            rotation = ?rotation,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            rotation,
            sequence: 0,
        })
    }

    /// Capture one frame, converted to RGB and rotated.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(|e| {
            if e.raw_os_error() == Some(ENODEV) {
                CameraError::Disconnected(self.device_path.clone())
            } else {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            }
        })?;

        let used = (meta.bytesused as usize).min(buf.len());
        let rgb = buf_to_rgb(self.pixel_format, &buf[..used], self.width, self.height)?;

        self.sequence += 1;
        Ok(Frame::new(self.rotation.apply(rgb), self.sequence))
    }

    /// Discard `count` frames so exposure and white balance settle.
    ///
    /// Bad frames are skipped; only a vanished device is an error.
    pub fn warm_up(&mut self, count: usize) -> Result<(), CameraError> {
        let failed = discard_frames(count, || self.capture_frame().map(drop))?;
        tracing::debug!(frames = count, failed, "camera warm-up complete");
        Ok(())
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
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

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        self.capture_frame().map_err(SourceError::from)
    }
}

/// Run `capture` `count` times, returning how many attempts failed.
fn discard_frames(
    count: usize,
    mut capture: impl FnMut() -> Result<(), CameraError>,
) -> Result<usize, CameraError> {
    let mut failed = 0;
    for _ in 0..count {
        match capture() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring failed warm-up frame");
                failed += 1;
            }
        }
    }
    Ok(failed)
}

/// Convert a raw buffer to RGB based on the negotiated format.
fn buf_to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, CameraError> {
    let rgb = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
        PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf),
    }
    .map_err(|e| CameraError::CaptureFailed(format!("{format:?} conversion failed: {e}")))?;

    if rgb.dimensions() != (width, height) {
        return Err(CameraError::CaptureFailed(format!(
            "frame is {}x{}, expected {width}x{height}",
            rgb.width(),
            rgb.height()
        )));
    }
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_buf_to_rgb_rejects_short_buffer() {
        let err = buf_to_rgb(PixelFormat::Yuyv, &[0; 4], 4, 4).unwrap_err();
        assert!(matches!(err, CameraError::CaptureFailed(_)));
    }

    #[test]
    fn test_disconnect_closes_source() {
        let closed: SourceError = CameraError::Disconnected("/dev/video0".into()).into();
        assert!(matches!(closed, SourceError::Closed(_)));
        let transient: SourceError = CameraError::CaptureFailed("timeout".into()).into();
        assert!(matches!(transient, SourceError::Transient(_)));
    }

    #[test]
    fn test_warm_up_skips_bad_frames() {
        let mut calls = 0;
        let failed = discard_frames(5, || {
            calls += 1;
            if calls <= 2 {
                Err(CameraError::CaptureFailed("MJPG conversion failed".into()))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(calls, 5);
        assert_eq!(failed, 2);
    }

    #[test]
    fn test_warm_up_stops_on_disconnect() {
        let mut calls = 0;
        let err = discard_frames(5, || {
            calls += 1;
            Err(CameraError::Disconnected("/dev/video0".into()))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.is_fatal());
        assert!(!CameraError::DeviceBusy.is_fatal());
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-does-not-exist", 640, 480, Rotation::None)
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }
}
