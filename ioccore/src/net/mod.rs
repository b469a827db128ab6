//! Networking: the wire codec and protocol, the fabric domain and
//! connection carrying datagrams and one sided operations, and the TCP
//! side channel used for client authentication.

pub mod buffer;
pub mod connection;
pub mod domain;
pub mod hook;
pub mod proto;
pub mod registry;
pub mod serial;
pub mod support;
pub mod tcp;
