//! Value types for device control parameters.

mod brightness;
mod color;
mod hue_saturation;
mod kelvin;
mod led_mode;
mod power;

pub use brightness::Brightness;
pub use color::Color;
pub use hue_saturation::HueSaturation;
pub use kelvin::Kelvin;
pub use led_mode::LedMode;
pub use power::PowerMode;
