//! Client for a local OpenAI-compatible completion server.
//!
//! Targets LM Studio / Ollama style endpoints: schema-constrained chat
//! completions plus a startup reachability probe. No streaming, no tools,
//! no session state across calls.

mod client;
mod schema;

pub use client::LocalModel;
pub use schema::StructuredOutput;
