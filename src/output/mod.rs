pub mod driver;
pub mod fallback;
pub mod font;

pub use driver::{DriverSettings, DriverStats, OutputDriver};
pub use fallback::FallbackFrameGenerator;
