pub mod checkpoint;
pub mod emitter;
pub mod engine;
pub mod render;
pub mod roster;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use checkpoint::{MemoryCheckpoints, SqliteCheckpoints};
pub use emitter::{events_for_message, EventEmitter};
pub use engine::GraphEngine;
pub use roster::Roster;
pub use store::ConversationStore;
pub use supervisor::{parse_decision, Supervisor, SupervisorOutcome};
pub use worker::Worker;
