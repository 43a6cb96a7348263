pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod traits;
pub mod types;

pub use config::{AppConfig, NodeDefinition};
pub use error::{OpsError, Result};
pub use event::StreamEvent;
pub use session::*;
pub use types::*;
