//! vm-runner: launch and supervise a QEMU guest and talk to its guest agent.

pub mod agent;
pub mod error;
pub mod logging;
pub mod settings;
pub mod state_machine;
pub mod vm;

pub use error::{ProtocolError, Result, VmError};
