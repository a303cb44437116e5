//! Guest agent: wire protocol, typed client and clock reconciliation.

pub mod client;
pub mod clock;
pub mod protocol;

pub use client::AgentConnection;
pub use clock::{ClockSettings, ClockSync, ClockSyncHandle};
pub use protocol::{AgentRequest, ExecRequest, ExecStatus, ReplyShape, ShutdownMode, Whence};
