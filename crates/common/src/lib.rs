//! Common utilities for sp420-usb
//!
//! This crate provides the pieces shared by the sensor library and the CLI:
//! logging setup, the common error type, and the channel that carries hotplug
//! events from the platform USB thread to the device registry.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{
    HotplugEvent, HotplugKind, HotplugReceiver, HotplugSender, UsbLocation,
    create_hotplug_channel,
};
pub use error::{Error, Result};
pub use logging::{filter_directives, setup_logging};
