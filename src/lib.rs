//! Kestrel — streaming run-loop orchestration for a conversational
//! portfolio analyst.
//!
//! The backend side ([`agent`]) drives a multi-turn exchange with a model
//! provider, dispatches tool calls, and emits an ordered event stream. The
//! client side ([`client`]) decodes that stream, buffers partial text into
//! a durable transcript, and coordinates sending while a run is in flight.
//! The two meet at the wire protocol in [`wire`].
//!
//! # Quick start (backend)
//!
//! ```no_run
//! use std::sync::Arc;
//! use kestrel::agent::{RunRequest, TurnRunner};
//! use kestrel::config::KestrelConfig;
//! use kestrel::tools::ToolDispatcher;
//! # use kestrel::provider::ProviderFactory;
//!
//! # fn example(factory: Arc<dyn ProviderFactory>) {
//! let config = KestrelConfig::from_env();
//! let dispatcher = Arc::new(ToolDispatcher::from_config(&config));
//! let runner = TurnRunner::new(config, factory, dispatcher);
//! let conversation_id = uuid::Uuid::new_v4();
//! let (handle, events) = runner.start(RunRequest::new(
//!     conversation_id,
//!     "What's my largest position?",
//! ));
//! # let _ = (handle, events);
//! # }
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod tools;
pub mod types;
pub mod util;
pub mod wire;
