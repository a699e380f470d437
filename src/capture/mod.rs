pub mod backoff;
pub mod frame;
pub mod reader;

pub use backoff::Backoff;
pub use frame::{Frame, FrameKind, FrameMetadata, PixelFormat};
pub use reader::{ConnectionState, InputReader, ReaderStats, StateChange};
