pub mod controller;
pub mod slot;

pub use controller::{ContinuityController, RunReport};
pub use slot::{FrameSlot, SlotRead, SlotStats};
