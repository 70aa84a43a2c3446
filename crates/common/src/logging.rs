//! Logging setup
//!
//! Log lines go to stderr so that readings printed on stdout stay parseable.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target the transfer hex dumps are logged under
const TRANSFER_TARGET: &str = "sensor";

/// Filter directives for `default_level`
///
/// With `usb_debug` the sensor crate logs at debug level whatever the default,
/// so transfer dumps show up without raising the level of everything else.
pub fn filter_directives(default_level: &str, usb_debug: bool) -> String {
    if usb_debug {
        format!("{},{}=debug", default_level, TRANSFER_TARGET)
    } else {
        default_level.to_string()
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_level` and `usb_debug`.
pub fn setup_logging(default_level: &str, usb_debug: bool) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(default_level, usb_debug)))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}
