//! Client-side stream consumer: buffer, transcript store, send queue,
//! watchdog, and the session coordinator that ties them together.

pub mod buffer;
pub mod queue;
pub mod session;
pub mod store;
pub mod transport;
pub mod watchdog;

pub use buffer::RunBuffer;
pub use queue::SendQueue;
pub use session::{ChatSession, SubmitOutcome};
pub use store::MessageStore;
pub use transport::{ByteStream, HttpRunTransport, RunTransport};
pub use watchdog::Watchdog;
