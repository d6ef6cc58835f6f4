pub mod broker;
pub mod config;
pub mod debate;
pub mod error;
pub mod llm_client;
pub mod prompts;
pub mod server;
pub mod templates;
pub mod trace_store;

pub use broker::DebateBroker;
pub use config::{DebateConfig, ServiceConfig};
pub use debate::{DebateEvent, Orchestrator};
pub use llm_client::{ChatBackend, OllamaClient};
pub use templates::TemplateStore;
pub use trace_store::{DebateTrace, TraceStore};
