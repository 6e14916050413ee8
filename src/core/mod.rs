//! 核心层：时钟、错误分类、关停

pub mod clock;
pub mod error;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CycleError;
pub use shutdown::{ShutdownManager, ShutdownReason};
