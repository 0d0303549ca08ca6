//! greeter-hw — camera capture for the greeter pipeline.
//!
//! Opens a V4L2 device, converts YUYV / MJPG / GREY buffers to RGB and
//! rotates them to the mounting orientation.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Rotation;
