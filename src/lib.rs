//! Aralia Data Assistant
//!
//! Answers natural-language questions from public datasets hosted on the
//! Aralia platform:
//! - Finds candidate datasets by keyword
//! - Lets an LLM plan charts over the dataset columns
//! - Lets an LLM pick filter values from the real options
//! - Runs the explorations and interprets the resulting tables
//!
//! PIPELINE:
//! SEARCH → PLAN → FILTER → EXECUTE → INTERPRET
//!
//! External failures never escape as panics: recoverable ones are recorded
//! on the state and the run still ends with an answer.

pub mod agent;
pub mod api;
pub mod assistant;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod retry;
pub mod state;
pub mod steps;

pub use error::Result;

// Re-export common types
pub use agent::Orchestrator;
pub use assistant::{AskRequest, AskResponse, Assistant};
pub use config::{Config, Credentials};
pub use error::{ErrorKind, OrchestrationError};
pub use state::State;
