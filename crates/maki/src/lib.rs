//! The maki daemon core: the instance owning all server connections and
//! the typed command/event surface that front-end transports (session
//! bus, TCP) plug into.

pub mod instance;
pub mod ipc;

#[macro_use]
extern crate log;
