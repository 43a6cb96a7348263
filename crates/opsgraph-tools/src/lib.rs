pub mod builtin;
pub mod dispatch;
pub mod registry;

pub use dispatch::{FanOut, SlotResult, SubCall};
pub use registry::ToolRegistry;
