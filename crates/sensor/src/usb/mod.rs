//! USB subsystem
//!
//! rusb implementations of the transport and platform seams:
//! - [`UsbTransport`]: one claimed interface with bulk endpoints
//! - [`RusbPlatform`]: enumeration, connection and hot-plug delivery
//!
//! Hot-plug events are produced on a dedicated `usb-events` thread running the
//! libusb event loop; the callback only forwards them into a channel.

pub mod platform;
pub mod transport;

pub use platform::RusbPlatform;
pub use transport::{DeviceSelector, UsbTransport};
