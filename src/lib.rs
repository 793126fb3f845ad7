pub mod cli;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod history;
pub mod metrics;
pub mod session;

pub use config::SessionConfig;
pub use decoder::StreamDecoder;
pub use engine::{Engine, EngineLoader, EngineSnapshot, ScriptedEngine, ScriptedLoader};
pub use error::SessionError;
pub use history::{ConversationHistory, ConversationTurn, Role, TemplatingMode};
pub use metrics::GenerationResult;
pub use session::{
    Diagnostics, GenerationListener, GenerationOutput, GenerationState, Session, StopReason,
};
