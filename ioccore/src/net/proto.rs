//! Wire protocol: message opcodes and the payload structures exchanged
//! between clients and the server. All fields travel little endian; the
//! exact layouts and sizes are pinned by the tests at the bottom.

use crate::net::serial::{SerialResult, Serializer, WireMessage};
use std::cmp::Ordering;
use std::fmt;

/// Maximal size of a fabric endpoint address on the wire.
pub const MAX_ADDR_LEN: usize = 32;
/// Max eager size for a write operation, larger payloads use RDMA.
pub const EAGER_MAX_WRITE: usize = 32 * 1024;
/// Max eager size for a read operation, larger payloads use RDMA.
pub const EAGER_MAX_READ: usize = 32 * 1024;
/// Considered max size of any payload structure.
pub const STRUCT_MAX: usize = 64;
/// Receive buffers must have room for a header, a payload struct and the
/// largest eager run.
pub const POST_RECEIVE_SIZE: usize = MessageHeader::SIZE + STRUCT_MAX + EAGER_MAX_WRITE;
/// Protocol version, any mismatch is fatal.
pub const PROTOCOL_VERSION: i32 = 2;

/// Message types carried in the header. Types below `ConnectInit..=FatalError`
/// form the low level protocol and bypass client authentication.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    ConnectInit,
    AssignId,
    BadAuth,
    FatalError,
    Ping,
    Pong,
    ObjRead,
    ObjWrite,
    ObjReadWriteAck,
    ObjFlush,
    ObjFlushAck,
    ObjCreate,
    ObjCreateAck,
    ObjRangeRegister,
    ObjRangeRegisterAck,
    ObjRangeUnregister,
    ObjRangeUnregisterAck,
    ObjCow,
    ObjCowAck,
}

impl MessageType {
    /// Decode a raw opcode, `None` for unknown values.
    pub fn from_raw(raw: u64) -> Option<MessageType> {
        Some(match raw {
            0 => MessageType::ConnectInit,
            1 => MessageType::AssignId,
            2 => MessageType::BadAuth,
            3 => MessageType::FatalError,
            10 => MessageType::Ping,
            11 => MessageType::Pong,
            100 => MessageType::ObjRead,
            101 => MessageType::ObjWrite,
            102 => MessageType::ObjReadWriteAck,
            103 => MessageType::ObjFlush,
            104 => MessageType::ObjFlushAck,
            105 => MessageType::ObjCreate,
            106 => MessageType::ObjCreateAck,
            107 => MessageType::ObjRangeRegister,
            108 => MessageType::ObjRangeRegisterAck,
            109 => MessageType::ObjRangeUnregister,
            110 => MessageType::ObjRangeUnregisterAck,
            111 => MessageType::ObjCow,
            112 => MessageType::ObjCowAck,
            _ => return None,
        })
    }

    /// Low level messages are handled by the connection itself and skip the
    /// client authentication check.
    #[inline]
    pub fn is_low_level(self) -> bool {
        u64::from(self) < 4
    }
}

impl From<MessageType> for u64 {
    fn from(message_type: MessageType) -> u64 {
        match message_type {
            MessageType::ConnectInit => 0,
            MessageType::AssignId => 1,
            MessageType::BadAuth => 2,
            MessageType::FatalError => 3,
            MessageType::Ping => 10,
            MessageType::Pong => 11,
            MessageType::ObjRead => 100,
            MessageType::ObjWrite => 101,
            MessageType::ObjReadWriteAck => 102,
            MessageType::ObjFlush => 103,
            MessageType::ObjFlushAck => 104,
            MessageType::ObjCreate => 105,
            MessageType::ObjCreateAck => 106,
            MessageType::ObjRangeRegister => 107,
            MessageType::ObjRangeRegisterAck => 108,
            MessageType::ObjRangeUnregister => 109,
            MessageType::ObjRangeUnregisterAck => 110,
            MessageType::ObjCow => 111,
            MessageType::ObjCowAck => 112,
        }
    }
}

/// Object identifier, ordered lexicographically on `(high, low)`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ObjectId {
    pub low: i64,
    pub high: i64,
}

impl ObjectId {
    pub const SIZE: usize = 16;

    #[inline]
    pub fn new(high: i64, low: i64) -> ObjectId {
        ObjectId { low, high }
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &ObjectId) -> Ordering {
        (self.high, self.low).cmp(&(other.high, other.low))
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &ObjectId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}:{}", self.high, self.low)
    }
}

impl<'a> WireMessage<'a> for ObjectId {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_i64("low", &mut self.low)?;
        serializer.apply_i64("high", &mut self.high)
    }
}

/// Remote memory region description, everything a peer needs to run an RDMA
/// operation against a buffer.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Iov {
    /// Base address of the target memory region.
    pub addr: u64,
    /// Access key of the registration covering the region.
    pub key: u64,
}

impl Iov {
    pub const SIZE: usize = 16;
}

impl<'a> WireMessage<'a> for Iov {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_u64("addr", &mut self.addr)?;
        serializer.apply_u64("key", &mut self.key)
    }
}

/// Header in front of every message.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub msg_type: u64,
    pub lf_client_id: u64,
    pub tcp_client_id: u64,
    pub tcp_client_key: u64,
}

impl MessageHeader {
    pub const SIZE: usize = 32;
}

impl<'a> WireMessage<'a> for MessageHeader {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_u64("msgType", &mut self.msg_type)?;
        serializer.apply_u64("lfClientId", &mut self.lf_client_id)?;
        serializer.apply_u64("tcpClientId", &mut self.tcp_client_id)?;
        serializer.apply_u64("tcpClientKey", &mut self.tcp_client_key)
    }
}

/// Ping request: the server fetches `rdma_size` bytes via RDMA from the
/// given iov and the eager run rides inline in the message.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Ping<'a> {
    pub rdma_size: u64,
    pub eager_size: u64,
    pub rdma_iov: Iov,
    pub eager_data: Option<&'a [u8]>,
}

impl<'a> WireMessage<'a> for Ping<'a> {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_u64("rdmaSize", &mut self.rdma_size)?;
        serializer.apply_u64("eagerSize", &mut self.eager_size)?;
        serializer.apply(&mut self.rdma_iov)?;
        if self.eager_size > 0 {
            let size = self.eager_size as usize;
            serializer.apply_data_or_point("eagerData", &mut self.eager_data, size)?;
        }
        Ok(())
    }
}

/// Read or write request on an object range.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ObjReadWrite<'a> {
    pub object_id: ObjectId,
    pub iov: Iov,
    pub offset: u64,
    pub size: u64,
    /// Eager message: the data to write follows inline, no RDMA needed.
    pub msg_has_data: bool,
    pub data: Option<&'a [u8]>,
}

impl<'a> WireMessage<'a> for ObjReadWrite<'a> {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply(&mut self.object_id)?;
        serializer.apply(&mut self.iov)?;
        serializer.apply_u64("offset", &mut self.offset)?;
        serializer.apply_u64("size", &mut self.size)?;
        serializer.apply_bool("msgHasData", &mut self.msg_has_data)?;
        if self.msg_has_data {
            let size = self.size as usize;
            serializer.apply_data_or_point("data", &mut self.data, size)?;
        }
        Ok(())
    }
}

/// Flush request, `size == 0` flushes the whole object.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ObjFlush {
    pub object_id: ObjectId,
    pub offset: u64,
    pub size: u64,
}

impl ObjFlush {
    pub const SIZE: usize = 32;
}

impl<'a> WireMessage<'a> for ObjFlush {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply(&mut self.object_id)?;
        serializer.apply_u64("offset", &mut self.offset)?;
        serializer.apply_u64("size", &mut self.size)
    }
}

/// Object creation request.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ObjCreate {
    pub object_id: ObjectId,
}

impl ObjCreate {
    pub const SIZE: usize = 16;
}

impl<'a> WireMessage<'a> for ObjCreate {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply(&mut self.object_id)
    }
}

/// Mapping range registration request.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RegisterRange {
    pub object_id: ObjectId,
    pub offset: u64,
    pub size: u64,
    pub write: bool,
}

impl RegisterRange {
    pub const SIZE: usize = 33;
}

impl<'a> WireMessage<'a> for RegisterRange {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply(&mut self.object_id)?;
        serializer.apply_u64("offset", &mut self.offset)?;
        serializer.apply_u64("size", &mut self.size)?;
        serializer.apply_bool("write", &mut self.write)
    }
}

/// Mapping range de-registration, all five fields must match.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct UnregisterRange {
    pub object_id: ObjectId,
    pub offset: u64,
    pub size: u64,
    pub id: i32,
    pub write: bool,
}

impl UnregisterRange {
    pub const SIZE: usize = 37;
}

impl<'a> WireMessage<'a> for UnregisterRange {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply(&mut self.object_id)?;
        serializer.apply_u64("offset", &mut self.offset)?;
        serializer.apply_u64("size", &mut self.size)?;
        serializer.apply_i32("id", &mut self.id)?;
        serializer.apply_bool("write", &mut self.write)
    }
}

/// Copy on write request. A zero `range_size` copies the whole object.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ObjectCow {
    pub source_object_id: ObjectId,
    pub dest_object_id: ObjectId,
    pub allow_exist: bool,
    pub range_offset: u64,
    pub range_size: u64,
}

impl ObjectCow {
    pub const SIZE: usize = 49;
}

impl<'a> WireMessage<'a> for ObjectCow {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply(&mut self.source_object_id)?;
        serializer.apply(&mut self.dest_object_id)?;
        serializer.apply_bool("allowExist", &mut self.allow_exist)?;
        serializer.apply_u64("rangeOffset", &mut self.range_offset)?;
        serializer.apply_u64("rangeSize", &mut self.range_size)
    }
}

/// Answer to most requests: a status plus optional eager data. On the pack
/// side the data can be given as multiple fragments which are gathered into
/// one contiguous run on the wire.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Response<'a> {
    pub msg_data_size: u64,
    pub status: i32,
    pub msg_has_data: bool,
    pub data: Option<&'a [u8]>,
    pub fragments: Option<&'a [&'a [u8]]>,
}

impl<'a> Response<'a> {
    /// Bare form without eager data.
    pub const BARE_SIZE: usize = 13;

    #[inline]
    pub fn status_only(status: i32) -> Response<'a> {
        Response {
            msg_data_size: 0,
            status,
            msg_has_data: false,
            data: None,
            fragments: None,
        }
    }

    #[inline]
    pub fn with_data(status: i32, data: &'a [u8]) -> Response<'a> {
        Response {
            msg_data_size: data.len() as u64,
            status,
            msg_has_data: true,
            data: Some(data),
            fragments: None,
        }
    }

    #[inline]
    pub fn with_fragments(status: i32, fragments: &'a [&'a [u8]]) -> Response<'a> {
        Response {
            msg_data_size: fragments.iter().map(|fragment| fragment.len() as u64).sum(),
            status,
            msg_has_data: true,
            data: None,
            fragments: Some(fragments),
        }
    }
}

impl<'a> WireMessage<'a> for Response<'a> {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_u64("msgDataSize", &mut self.msg_data_size)?;
        serializer.apply_i32("status", &mut self.status)?;
        serializer.apply_bool("msgHasData", &mut self.msg_has_data)?;
        if self.msg_has_data {
            match self.fragments {
                Some(fragments) => {
                    for fragment in fragments {
                        serializer.apply_bytes("dataFragment", fragment)?;
                    }
                }
                None => {
                    let size = self.msg_data_size as usize;
                    serializer.apply_data_or_point("data", &mut self.data, size)?;
                }
            }
        }
        Ok(())
    }
}

/// Sent by the server on fabric connection establishment.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FirstHandshake {
    pub protocol_version: i32,
    pub assign_lf_client_id: u64,
}

impl FirstHandshake {
    pub const SIZE: usize = 12;
}

impl<'a> WireMessage<'a> for FirstHandshake {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_i32("protocolVersion", &mut self.protocol_version)?;
        serializer.apply_u64("assignLfClientId", &mut self.assign_lf_client_id)
    }
}

/// First message sent by a client, carrying its endpoint address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FirstClientMessage {
    pub addr: [u8; MAX_ADDR_LEN],
}

impl FirstClientMessage {
    pub const SIZE: usize = MAX_ADDR_LEN;
}

impl Default for FirstClientMessage {
    fn default() -> FirstClientMessage {
        FirstClientMessage {
            addr: [0; MAX_ADDR_LEN],
        }
    }
}

impl<'a> WireMessage<'a> for FirstClientMessage {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_raw("addr", &mut self.addr)
    }
}

/// Fatal error notification broadcast before the server aborts.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ErrorMessage {
    pub message: String,
}

impl<'a> WireMessage<'a> for ErrorMessage {
    fn apply(&mut self, serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        serializer.apply_str("errorMessage", &mut self.message)
    }
}

/// Payload of messages that carry no data.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Empty;

impl<'a> WireMessage<'a> for Empty {
    fn apply(&mut self, _serializer: &mut Serializer<'a, '_>) -> SerialResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::serial::{pack_into, packed_size, unpack_from};

    fn roundtrip<T>(mut message: T) -> T
    where
        T: for<'x> WireMessage<'x> + Default + Clone,
    {
        let size = packed_size(&mut message);
        let mut buffer = vec![0u8; size];
        assert_eq!(pack_into(&mut buffer, &mut message).unwrap(), size);

        let buffer: &'static [u8] = Box::leak(buffer.into_boxed_slice());
        let (decoded, consumed) = unpack_from::<T>(buffer).unwrap();
        assert_eq!(consumed, size);
        decoded
    }

    #[test]
    fn test_pinned_sizes() {
        assert_eq!(packed_size(&mut MessageHeader::default()), MessageHeader::SIZE);
        assert_eq!(packed_size(&mut ObjectId::default()), ObjectId::SIZE);
        assert_eq!(packed_size(&mut Iov::default()), Iov::SIZE);
        assert_eq!(packed_size(&mut Ping::default()), 32);
        assert_eq!(packed_size(&mut ObjReadWrite::default()), 49);
        assert_eq!(packed_size(&mut ObjFlush::default()), ObjFlush::SIZE);
        assert_eq!(packed_size(&mut ObjCreate::default()), ObjCreate::SIZE);
        assert_eq!(packed_size(&mut RegisterRange::default()), RegisterRange::SIZE);
        assert_eq!(packed_size(&mut UnregisterRange::default()), UnregisterRange::SIZE);
        assert_eq!(packed_size(&mut ObjectCow::default()), ObjectCow::SIZE);
        assert_eq!(packed_size(&mut Response::default()), Response::BARE_SIZE);
        assert_eq!(packed_size(&mut FirstHandshake::default()), FirstHandshake::SIZE);
        assert_eq!(
            packed_size(&mut FirstClientMessage::default()),
            FirstClientMessage::SIZE
        );
        assert_eq!(packed_size(&mut Empty::default()), 0);
    }

    #[test]
    fn test_message_type_raw_values() {
        assert_eq!(u64::from(MessageType::ConnectInit), 0);
        assert_eq!(u64::from(MessageType::AssignId), 1);
        assert_eq!(u64::from(MessageType::BadAuth), 2);
        assert_eq!(u64::from(MessageType::FatalError), 3);
        assert_eq!(u64::from(MessageType::Ping), 10);
        assert_eq!(u64::from(MessageType::Pong), 11);
        assert_eq!(u64::from(MessageType::ObjRead), 100);
        assert_eq!(u64::from(MessageType::ObjCowAck), 112);

        for raw in 0..128u64 {
            if let Some(message_type) = MessageType::from_raw(raw) {
                assert_eq!(u64::from(message_type), raw);
            }
        }

        assert!(MessageType::from_raw(4).is_none());
        assert!(MessageType::from_raw(99).is_none());

        assert!(MessageType::BadAuth.is_low_level());
        assert!(!MessageType::Ping.is_low_level());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = MessageHeader {
            msg_type: MessageType::ObjRead.into(),
            lf_client_id: 3,
            tcp_client_id: 8,
            tcp_client_key: 0xdead_beef,
        };

        assert_eq!(roundtrip(header), header);
    }

    #[test]
    fn test_object_id_order() {
        assert!(ObjectId::new(1, 2) < ObjectId::new(2, 1));
        assert!(ObjectId::new(2, 1) < ObjectId::new(2, 2));
        assert_eq!(ObjectId::new(5, 6), ObjectId::new(5, 6));
    }

    #[test]
    fn test_ping_roundtrip_with_eager() {
        let eager = [7u8; 16];
        let mut ping = Ping {
            rdma_size: 4096,
            eager_size: eager.len() as u64,
            rdma_iov: Iov { addr: 0x1000, key: 42 },
            eager_data: Some(&eager),
        };

        let size = packed_size(&mut ping);
        assert_eq!(size, 32 + eager.len());

        let mut buffer = vec![0u8; size];
        pack_into(&mut buffer, &mut ping).unwrap();

        let (decoded, consumed) = unpack_from::<Ping>(&buffer).unwrap();
        assert_eq!(consumed, size);
        assert_eq!(decoded.rdma_size, ping.rdma_size);
        assert_eq!(decoded.rdma_iov, ping.rdma_iov);
        assert_eq!(decoded.eager_data.unwrap(), &eager[..]);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let payload = [9u8; 32];
        let mut message = ObjReadWrite {
            object_id: ObjectId::new(10, 20),
            iov: Iov { addr: 1, key: 2 },
            offset: 64,
            size: payload.len() as u64,
            msg_has_data: true,
            data: Some(&payload),
        };

        let size = packed_size(&mut message);
        assert_eq!(size, 49 + payload.len());

        let mut buffer = vec![0u8; size];
        pack_into(&mut buffer, &mut message).unwrap();

        let (decoded, consumed) = unpack_from::<ObjReadWrite>(&buffer).unwrap();
        assert_eq!(consumed, size);
        assert_eq!(decoded.object_id, message.object_id);
        assert_eq!(decoded.offset, 64);
        assert_eq!(decoded.data.unwrap(), &payload[..]);
    }

    #[test]
    fn test_range_messages_roundtrip() {
        let register = RegisterRange {
            object_id: ObjectId::new(10, 20),
            offset: 200,
            size: 100,
            write: true,
        };
        assert_eq!(roundtrip(register), register);

        let unregister = UnregisterRange {
            object_id: ObjectId::new(10, 20),
            offset: 200,
            size: 100,
            id: 1,
            write: true,
        };
        assert_eq!(roundtrip(unregister), unregister);
    }

    #[test]
    fn test_cow_roundtrip() {
        let cow = ObjectCow {
            source_object_id: ObjectId::new(10, 20),
            dest_object_id: ObjectId::new(10, 21),
            allow_exist: true,
            range_offset: 0,
            range_size: 0,
        };
        assert_eq!(roundtrip(cow), cow);
    }

    #[test]
    fn test_response_fragments_pack_contiguous() {
        let first = [1u8, 2, 3];
        let second = [4u8, 5];
        let fragments: [&[u8]; 2] = [&first, &second];
        let mut response = Response::with_fragments(0, &fragments);

        let size = packed_size(&mut response);
        assert_eq!(size, Response::BARE_SIZE + 5);

        let mut buffer = vec![0u8; size];
        pack_into(&mut buffer, &mut response).unwrap();

        // The fragments are concatenated after the bare response fields.
        assert_eq!(&buffer[Response::BARE_SIZE..], &[1, 2, 3, 4, 5]);

        // Unpacking yields a single contiguous slice.
        let (decoded, _) = unpack_from::<Response>(&buffer).unwrap();
        assert_eq!(decoded.msg_data_size, 5);
        assert_eq!(decoded.data.unwrap(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_error_message_roundtrip() {
        let error = ErrorMessage {
            message: "segment allocation failure".to_string(),
        };
        assert_eq!(roundtrip(error.clone()), error);
    }

    #[test]
    fn test_first_handshake_roundtrip() {
        let handshake = FirstHandshake {
            protocol_version: PROTOCOL_VERSION,
            assign_lf_client_id: 12,
        };
        assert_eq!(roundtrip(handshake), handshake);
    }
}
