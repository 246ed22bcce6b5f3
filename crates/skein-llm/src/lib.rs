pub mod agent;
pub mod client;
pub mod presets;
pub mod retry;

pub use agent::ChatAgent;
pub use client::{ChatClient, ChatTurn};
