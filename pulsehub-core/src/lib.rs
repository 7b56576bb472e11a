//! Pulsehub Core
//!
//! Runtime-agnostic-in-spirit (compio-based, like the rest of this workspace)
//! hub kernel: the single-owner, event-serialized connection registry plus its
//! supporting types. Transport concreteness lives in the `pulsehub` crate.
//!
//! - Device identity (`device`)
//! - Transport adapter contract (`adapter`)
//! - Connection lifecycle (`connection`)
//! - Optional dispatch hooks (`hooks`)
//! - Offline cache contract + default impl (`queue`)
//! - Hub construction options (`config`)
//! - The dispatcher itself (`hub`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod hooks;
pub mod hub;
pub mod queue;

pub mod prelude {
    pub use crate::adapter::ConnAdapter;
    pub use crate::config::HubConfig;
    pub use crate::connection::Connection;
    pub use crate::device::Device;
    pub use crate::error::{Error, Result};
    pub use crate::hooks::{
        Actor, AfterSendHandler, BeforeReceiveHandler, BeforeSendHandler, ByeGenerator,
        CloseHandler, PingGenerator,
    };
    pub use crate::hub::Hub;
    pub use crate::queue::{MemoryQueue, Queue};
}
