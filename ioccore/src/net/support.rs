//! Shared error plumbing for the fabric layer.

use crate::net::serial::SerialError;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors raised by the fabric layer. `Wait` means the operation should be
/// retried once the provider made progress, everything else is fatal for the
/// operation that raised it.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    Io(io::ErrorKind),
    Protocol(SerialError),
    UnknownMessageType(u64),
    ProtocolMismatch { local: i32, remote: i32 },
    UnknownEndpoint(u64),
    Disconnected,
    AddrParse,
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

impl From<SerialError> for NetworkError {
    #[inline]
    fn from(error: SerialError) -> Self {
        NetworkError::Fatal(ErrorType::Protocol(error))
    }
}
