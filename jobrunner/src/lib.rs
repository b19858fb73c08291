//! Job machinery for a compute-marketplace executor: the dispatcher session, input volumes,
//! sandboxed container runs and result reporting.

mod actors;
pub mod agent;
pub mod config;
pub mod download;
pub mod errors;
mod events;
pub mod runner;
pub mod runtime;
pub mod security;
pub mod session;
pub mod specs;
pub mod types;
pub mod upload;
pub mod volume;

#[cfg(test)]
mod testing;

pub use agent::Executor;
pub use config::ExecutorConfig;
pub use events::{JobState, ProcessOutcome};
pub use session::{Envelope, Outbox, ProtocolSession, SessionError};
