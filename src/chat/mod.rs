pub mod service;

pub use service::{ChatOutcome, ChatRequest, ChatService, MeteredStream};
