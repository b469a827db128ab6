#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! `ioccore` implements the IO Catcher server core: a network attached object
//! cache staging object storage contents in volatile or persistent memory and
//! serving reads and writes over a reliable datagram fabric.

pub mod backend;
pub mod client;
pub mod container;
pub mod debug;
pub mod logging;
pub mod net;
pub mod server;
