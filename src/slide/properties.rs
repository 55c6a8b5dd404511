//! Well-known property keys and value formatting.
//!
//! Properties are a flat string-to-string map. The `openslide.` namespace
//! is kept for drop-in compatibility with existing viewers; vendor-raw
//! keys go under `aperio.`, `trestle.`, `hamamatsu.`, or `intemedic.`.

/// Scanner vendor identifier.
pub const PROP_VENDOR: &str = "openslide.vendor";

/// Slide background color as hex `RRGGBB`.
pub const PROP_BACKGROUND_COLOR: &str = "openslide.background-color";

/// Objective lens power used for the scan.
pub const PROP_OBJECTIVE_POWER: &str = "openslide.objective-power";

/// Microns per pixel in X at level 0.
pub const PROP_MPP_X: &str = "openslide.mpp-x";

/// Microns per pixel in Y at level 0.
pub const PROP_MPP_Y: &str = "openslide.mpp-y";

/// Format a packed RGB value as the background-color property value.
pub fn format_background_color(rgb: u32) -> String {
    format!("{:06x}", rgb & 0x00FF_FFFF)
}

/// Format an optional float property, trimming a trailing `.0` the way
/// scanner software writes whole numbers.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
