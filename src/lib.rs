//! MCP Router Library
//!
//! Core functionality for the local MCP router: server registry, process
//! supervision, stdio JSON-RPC bridging, circuit breaking, and LLM-backed
//! prompt enhancement. This library can be embedded in other applications.

pub mod bridge;
pub mod cache;
pub mod enhancement;
pub mod error;
pub mod http;
pub mod llm;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod resilience;
pub mod supervisor;
pub mod types;

pub use error::{Error, Result};
pub use registry::ServerRegistry;
pub use supervisor::Supervisor;
