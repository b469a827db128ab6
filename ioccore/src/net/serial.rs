//! Single pass codec over a flat byte buffer. Every wire structure exposes
//! one `apply` method that drives packing, unpacking, size computation and
//! stringification, so the field order is written down exactly once.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt::Write;

pub type SerialResult<T> = Result<T, SerialError>;

/// Errors raised by the codec. Any of them fails the whole message and is
/// treated as a protocol error by the connection layer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SerialError {
    /// The operation would cross the end of the buffer.
    Overrun {
        field: &'static str,
        cursor: usize,
        requested: usize,
        size: usize,
    },
    /// A string field is missing its trailing NUL terminator.
    MissingNul { field: &'static str },
    /// A string field carries a zero length, which cannot even hold the NUL.
    EmptyString { field: &'static str },
}

enum Action<'a, 'b> {
    Pack(&'b mut [u8]),
    Unpack(&'a [u8]),
    Size,
    Stringify(&'b mut String),
}

/// The serializer itself: a buffer, a cursor and an action. The `'a`
/// lifetime is the one of the source buffer on unpack, borrowed slices
/// handed out by [`Serializer::apply_data_or_point`] live as long as it.
pub struct Serializer<'a, 'b> {
    action: Action<'a, 'b>,
    cursor: usize,
    first: bool,
}

/// Implemented by every wire structure. `apply` calls the serializer
/// primitives in a fixed order; any deviation between the sender and the
/// receiver ordering is a protocol version bug.
pub trait WireMessage<'a> {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()>;
}

macro_rules! apply_scalar {
    ($name:ident, $ty:ty, $bytes:expr, $write:path, $read:path) => {
        pub fn $name(&mut self, field: &'static str, value: &mut $ty) -> SerialResult<()> {
            self.check(field, $bytes)?;
            match &mut self.action {
                Action::Pack(buffer) => $write(&mut buffer[self.cursor..], *value),
                Action::Unpack(buffer) => *value = $read(&buffer[self.cursor..]),
                Action::Stringify(out) => {
                    let separator = if self.first { "" } else { ", " };
                    let _ = write!(out, "{}{}: {}", separator, field, value);
                }
                Action::Size => {}
            }
            self.cursor += $bytes;
            self.first = false;
            Ok(())
        }
    };
}

impl<'a, 'b> Serializer<'a, 'b> {
    /// Serializer packing into the given buffer.
    pub fn pack(buffer: &'b mut [u8]) -> Serializer<'a, 'b> {
        Serializer {
            action: Action::Pack(buffer),
            cursor: 0,
            first: true,
        }
    }

    /// Serializer unpacking from the given buffer.
    pub fn unpack(buffer: &'a [u8]) -> Serializer<'a, 'b> {
        Serializer {
            action: Action::Unpack(buffer),
            cursor: 0,
            first: true,
        }
    }

    /// Serializer that only computes the packed size.
    pub fn size() -> Serializer<'a, 'b> {
        Serializer {
            action: Action::Size,
            cursor: 0,
            first: true,
        }
    }

    /// Serializer writing `field: value` pairs into the output string.
    pub fn stringify(out: &'b mut String) -> Serializer<'a, 'b> {
        Serializer {
            action: Action::Stringify(out),
            cursor: 0,
            first: true,
        }
    }

    /// Current cursor position. After a pack this equals the message size.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    fn check(&self, field: &'static str, requested: usize) -> SerialResult<()> {
        let size = match &self.action {
            Action::Pack(buffer) => buffer.len(),
            Action::Unpack(buffer) => buffer.len(),
            _ => return Ok(()),
        };

        if self.cursor + requested > size {
            return Err(SerialError::Overrun {
                field,
                cursor: self.cursor,
                requested,
                size,
            });
        }

        Ok(())
    }

    apply_scalar!(apply_u32, u32, 4, LittleEndian::write_u32, LittleEndian::read_u32);
    apply_scalar!(apply_i32, i32, 4, LittleEndian::write_i32, LittleEndian::read_i32);
    apply_scalar!(apply_u64, u64, 8, LittleEndian::write_u64, LittleEndian::read_u64);
    apply_scalar!(apply_i64, i64, 8, LittleEndian::write_i64, LittleEndian::read_i64);

    pub fn apply_bool(&mut self, field: &'static str, value: &mut bool) -> SerialResult<()> {
        self.check(field, 1)?;
        match &mut self.action {
            Action::Pack(buffer) => buffer[self.cursor] = *value as u8,
            Action::Unpack(buffer) => *value = buffer[self.cursor] != 0,
            Action::Stringify(out) => {
                let separator = if self.first { "" } else { ", " };
                let _ = write!(out, "{}{}: {}", separator, field, value);
            }
            Action::Size => {}
        }
        self.cursor += 1;
        self.first = false;
        Ok(())
    }

    /// Strings travel as `u64 length including the NUL`, the bytes, then the
    /// NUL itself. Unpacking fails if the terminator is missing.
    pub fn apply_str(&mut self, field: &'static str, value: &mut String) -> SerialResult<()> {
        match &mut self.action {
            Action::Stringify(out) => {
                let separator = if self.first { "" } else { ", " };
                let _ = write!(out, "{}{}: {}", separator, field, value);
                self.first = false;
                return Ok(());
            }
            Action::Size => {
                self.cursor += 8 + value.len() + 1;
                self.first = false;
                return Ok(());
            }
            _ => {}
        }

        let mut length = value.len() as u64 + 1;
        self.apply_u64(field, &mut length)?;
        self.check(field, length as usize)?;

        match &mut self.action {
            Action::Pack(buffer) => {
                let end = self.cursor + value.len();
                buffer[self.cursor..end].copy_from_slice(value.as_bytes());
                buffer[end] = 0;
            }
            Action::Unpack(buffer) => {
                if length == 0 {
                    return Err(SerialError::EmptyString { field });
                }
                let end = self.cursor + length as usize;
                if buffer[end - 1] != 0 {
                    return Err(SerialError::MissingNul { field });
                }
                *value = String::from_utf8_lossy(&buffer[self.cursor..end - 1]).into_owned();
            }
            _ => unreachable!(),
        }

        self.cursor += length as usize;
        self.first = false;
        Ok(())
    }

    /// Fixed size raw byte run, packed and unpacked in place.
    pub fn apply_raw(&mut self, field: &'static str, value: &mut [u8]) -> SerialResult<()> {
        self.check(field, value.len())?;
        match &mut self.action {
            Action::Pack(buffer) => {
                buffer[self.cursor..self.cursor + value.len()].copy_from_slice(value)
            }
            Action::Unpack(buffer) => {
                value.copy_from_slice(&buffer[self.cursor..self.cursor + value.len()])
            }
            Action::Stringify(out) => {
                let separator = if self.first { "" } else { ", " };
                let _ = write!(out, "{}{}: <{} bytes>", separator, field, value.len());
            }
            Action::Size => {}
        }
        self.cursor += value.len();
        self.first = false;
        Ok(())
    }

    /// Raw byte run copied out of the caller, pack side only. Used to gather
    /// multi fragment payloads into one contiguous wire run.
    pub fn apply_bytes(&mut self, field: &'static str, value: &[u8]) -> SerialResult<()> {
        self.check(field, value.len())?;
        match &mut self.action {
            Action::Pack(buffer) => {
                buffer[self.cursor..self.cursor + value.len()].copy_from_slice(value)
            }
            Action::Unpack(_) => panic!("apply_bytes cannot unpack, use apply_data_or_point"),
            Action::Stringify(out) => {
                let separator = if self.first { "" } else { ", " };
                let _ = write!(out, "{}{}: <{} bytes>", separator, field, value.len());
            }
            Action::Size => {}
        }
        self.cursor += value.len();
        self.first = false;
        Ok(())
    }

    /// Variable data run. On unpack this does not copy: the slice points
    /// into the receive buffer and must be consumed before the buffer is
    /// reposted.
    pub fn apply_data_or_point(
        &mut self,
        field: &'static str,
        value: &mut Option<&'a [u8]>,
        size: usize,
    ) -> SerialResult<()> {
        self.check(field, size)?;
        match &mut self.action {
            Action::Pack(buffer) => {
                let data = value.expect("Packing a data run requires the data to be set");
                buffer[self.cursor..self.cursor + size].copy_from_slice(&data[..size]);
            }
            Action::Unpack(buffer) => {
                *value = Some(&buffer[self.cursor..self.cursor + size]);
            }
            Action::Stringify(out) => {
                let separator = if self.first { "" } else { ", " };
                let _ = write!(out, "{}{}: <{} bytes>", separator, field, size);
            }
            Action::Size => {}
        }
        self.cursor += size;
        self.first = false;
        Ok(())
    }

    /// Apply a nested wire structure.
    #[inline]
    pub fn apply<T: WireMessage<'a>>(&mut self, value: &mut T) -> SerialResult<()> {
        value.apply(self)
    }
}

/// Packed size of a message.
pub fn packed_size<'a, T: WireMessage<'a>>(message: &mut T) -> usize {
    let mut serializer = Serializer::size();
    message
        .apply(&mut serializer)
        .expect("Size computation cannot overrun");
    serializer.cursor()
}

/// Pack the message into the buffer and return the number of bytes written.
pub fn pack_into<'a, T: WireMessage<'a>>(
    buffer: &mut [u8],
    message: &mut T,
) -> SerialResult<usize> {
    let mut serializer = Serializer::pack(buffer);
    message.apply(&mut serializer)?;
    Ok(serializer.cursor())
}

/// Unpack a message from the buffer and return it with the bytes consumed.
pub fn unpack_from<'a, T: WireMessage<'a> + Default>(
    buffer: &'a [u8],
) -> SerialResult<(T, usize)> {
    let mut message = T::default();
    let mut serializer = Serializer::unpack(buffer);
    message.apply(&mut serializer)?;
    let consumed = serializer.cursor();
    Ok((message, consumed))
}

/// Render the message as a `field: value` list for debug logs.
pub fn stringify<'a, T: WireMessage<'a>>(message: &mut T) -> String {
    let mut out = String::new();
    let mut serializer = Serializer::stringify(&mut out);
    let _ = message.apply(&mut serializer);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Eq, PartialEq)]
    struct TestMessage {
        count: u64,
        status: i32,
        flag: bool,
        name: String,
    }

    impl<'a> WireMessage<'a> for TestMessage {
        fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
            serializer.apply_u64("count", &mut self.count)?;
            serializer.apply_i32("status", &mut self.status)?;
            serializer.apply_bool("flag", &mut self.flag)?;
            serializer.apply_str("name", &mut self.name)
        }
    }

    #[test]
    fn test_roundtrip() {
        let mut message = TestMessage {
            count: 42,
            status: -3,
            flag: true,
            name: "object".to_string(),
        };

        let size = packed_size(&mut message);
        assert_eq!(size, 8 + 4 + 1 + 8 + 7);

        let mut buffer = vec![0u8; size];
        assert_eq!(pack_into(&mut buffer, &mut message).unwrap(), size);

        let (decoded, consumed) = unpack_from::<TestMessage>(&buffer).unwrap();
        assert_eq!(consumed, size);
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_little_endian() {
        let mut value = 0x0102_0304u32;
        let mut buffer = [0u8; 4];
        let mut serializer = Serializer::pack(&mut buffer);
        serializer.apply_u32("value", &mut value).unwrap();

        assert_eq!(buffer, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_string_carries_nul() {
        let mut message = TestMessage {
            name: "ab".to_string(),
            ..TestMessage::default()
        };

        let size = packed_size(&mut message);
        let mut buffer = vec![0u8; size];
        pack_into(&mut buffer, &mut message).unwrap();

        // Length includes the NUL and the last byte is the NUL itself.
        assert_eq!(&buffer[13..21], &3u64.to_le_bytes());
        assert_eq!(buffer[size - 1], 0);

        // Break the terminator and check the decode fails.
        buffer[size - 1] = b'x';
        let result = unpack_from::<TestMessage>(&buffer);
        assert_eq!(result.unwrap_err(), SerialError::MissingNul { field: "name" });
    }

    #[test]
    fn test_overrun_fails_message() {
        let mut message = TestMessage::default();
        let mut serializer = Serializer::unpack(&[0u8; 4]);

        let result = message.apply(&mut serializer);

        assert_eq!(
            result.unwrap_err(),
            SerialError::Overrun {
                field: "count",
                cursor: 0,
                requested: 8,
                size: 4,
            }
        );
    }

    #[test]
    fn test_data_or_point_borrows() {
        let buffer = [1u8, 2, 3, 4];
        let mut data: Option<&[u8]> = None;
        let mut serializer = Serializer::unpack(&buffer);

        serializer.apply_data_or_point("data", &mut data, 4).unwrap();

        assert_eq!(data.unwrap(), &buffer[..]);
    }

    #[test]
    fn test_stringify() {
        let mut message = TestMessage {
            count: 7,
            status: 0,
            flag: false,
            name: "x".to_string(),
        };

        assert_eq!(
            stringify(&mut message),
            "count: 7, status: 0, flag: false, name: x"
        );
    }
}
