pub mod config;
pub mod error;
pub mod event;
pub mod toolcall;
pub mod traits;
pub mod types;
pub mod validator;

pub use config::AppConfig;
pub use error::{Result, SkeinError};
pub use event::EventBus;
pub use toolcall::{detect_tool_call, ToolCall};
pub use types::*;
