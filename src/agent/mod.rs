//! Backend run orchestration (run loop, retry gateway).

pub mod retry;
pub mod runner;

pub use retry::ModelGateway;
pub use runner::{RunEventStream, RunHandle, RunRequest, TurnRunner};
