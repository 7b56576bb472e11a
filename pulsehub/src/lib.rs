//! Pulsehub
//!
//! The bundled transport for [`pulsehub_core`]'s hub kernel: a length-prefixed
//! framer over `compio` TCP, plus the accept-loop glue that turns raw sockets
//! into registered hub connections.
//!
//! The hub kernel itself — `Device`, `Hub`, `HubConfig`, the hook traits, the
//! offline queue — lives in `pulsehub-core` and is re-exported here so callers
//! depend on one crate.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

mod tcp;
mod timeout;

pub mod dev_tracing;
pub mod listener;
pub mod transport;

// Re-export the hub kernel so callers depend on one crate.
pub use pulsehub_core::config::HubConfig;
pub use pulsehub_core::device::Device;
pub use pulsehub_core::error::{Error, Result};
pub use pulsehub_core::hooks::{
    Actor, AfterSendHandler, BeforeReceiveHandler, BeforeSendHandler, ByeGenerator, CloseHandler,
    PingGenerator,
};
pub use pulsehub_core::hub::Hub;
pub use pulsehub_core::queue::{MemoryQueue, Queue};

pub mod prelude {
    pub use crate::listener::serve;
    pub use crate::transport::{FramedTcpAdapter, DEFAULT_MAX_FRAME_LEN};
    pub use pulsehub_core::prelude::*;
}
