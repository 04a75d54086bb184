//! Web chat backend and client core for locally hosted LLM services
//! speaking the Ollama chat protocol. The server relays a chunked
//! generation stream to the browser and persists the assembled answer;
//! the client core owns conversation state and reconciliation.

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod ollama;
pub mod relay;
pub mod server;
pub mod storage;
