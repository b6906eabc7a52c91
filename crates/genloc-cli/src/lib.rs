//! Bug localization driver: indexes a project's bug history and ranks the
//! files most likely to fix each bug with a tool-calling chat model.

pub mod agent;
pub mod bugs;
pub mod chat;
pub mod config;
pub mod pipeline;
pub mod pool;
pub mod resolve;
pub mod tools;
pub mod transcript;

pub use agent::{LoopOutcome, LoopStatus, RefinementLoop};
pub use chat::{ChatClient, OpenAiChatClient};
pub use config::{Args, Config};
pub use pipeline::run_indexing;
pub use pool::run_ranking;
