// StewardDB - safety-checked, AI-assisted multi-database management core
//
// The core of an autonomous database operations system: a polyglot client
// layer with pooling and lifecycle state machines, an LLM-planned agent
// framework over a typed tool registry, a five-level risk pipeline with
// approval workflows and a hash-chained audit log, and the async
// coordination primitives underneath all of it. The interactive UI, CLI,
// LLM transports and real network drivers live outside this crate and plug
// into the traits exposed here.

pub mod agent;
pub mod audit;
pub mod cache;
pub mod client;
pub mod common;
pub mod concurrent;
pub mod error;
pub mod guard;
pub mod health;
pub mod orchestration;
pub mod pool;
pub mod safety;
pub mod tools;
pub mod vault;

pub use error::{DbError, ErrorContext, Result};
pub use orchestration::{CoreConfig, Orchestrator};
