//! Client library: a pool of fabric connections behind a counting gate so
//! several user threads can issue requests concurrently, each holding one
//! connection exclusively for the duration of a single request.

use crate::debug;
use crate::logging::{self, Logger};
use crate::net::connection::{FabricConnection, SERVER_EP};
use crate::net::domain::FabricDomain;
use crate::net::hook::PostAction;
use crate::net::proto::{
    Iov, MessageType, ObjCreate, ObjFlush, ObjReadWrite, ObjectCow, ObjectId, Ping,
    RegisterRange, Response, UnregisterRange, EAGER_MAX_READ, EAGER_MAX_WRITE,
    POST_RECEIVE_SIZE, PROTOCOL_VERSION,
};
use crate::net::support::{NetworkError, NetworkResult};
use crate::net::tcp::connect_auth;
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};

/// Upper bound on pooled fabric connections.
pub const MAX_CONNECTIONS: usize = 8;

/// Receive buffers posted per client connection.
const CLIENT_RECV_COUNT: usize = 4;

struct PoolState {
    idle: Vec<FabricConnection>,
    created: usize,
}

/// Handle to one IO Catcher server. Cloneable across threads through `Arc`;
/// every operation grabs a pooled connection for its own round trip.
pub struct IocClient {
    domain: Arc<FabricDomain>,
    tcp_client_id: u64,
    tcp_client_key: u64,
    // Keeps the auth registration alive server side.
    _tcp_stream: Option<TcpStream>,
    pool: Mutex<PoolState>,
    available: Condvar,
    log: Logger,
}

impl IocClient {
    /// Connect to the server: run the TCP auth handshake on `port + 1`,
    /// then set the fabric side up on `port`.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        ip: &str,
        port: u16,
        log: L,
    ) -> NetworkResult<IocClient> {
        let log = logging::child(log);

        let (stream, handshake) =
            connect_auth(ip, port + 1).map_err(NetworkError::from)?;

        if handshake.protocol_version != PROTOCOL_VERSION as i16 {
            debug::fatal(&format!(
                "Protocol version mismatch on the auth channel, local={}, server={}",
                PROTOCOL_VERSION, handshake.protocol_version
            ));
        }

        logging::debug!(log, "authenticated";
                        "tcp_client_id" => handshake.client_id,
                        "keep_alive" => handshake.keep_alive);

        let tcp_stream = if handshake.keep_alive {
            Some(stream)
        } else {
            None
        };

        Ok(IocClient {
            domain: Arc::new(FabricDomain::new(ip, port, false, Some(&log))),
            tcp_client_id: handshake.client_id,
            tcp_client_key: handshake.key,
            _tcp_stream: tcp_stream,
            pool: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
            }),
            available: Condvar::new(),
            log,
        })
    }

    /// TCP identity assigned during the handshake.
    #[inline]
    pub fn tcp_client_id(&self) -> u64 {
        self.tcp_client_id
    }

    /// Read `buffer.len()` bytes of the object at `offset`. Small reads
    /// arrive inline with the answer, larger ones land in the buffer
    /// through a one sided write from the server.
    pub fn obj_read(
        &self,
        object_id: ObjectId,
        buffer: &mut [u8],
        offset: u64,
    ) -> NetworkResult<i32> {
        let size = buffer.len() as u64;
        let eager = buffer.len() <= EAGER_MAX_READ;
        let domain = self.domain.clone();

        self.with_connection(|connection| {
            let iov = if eager {
                Iov::default()
            } else {
                domain
                    .register_segment(buffer.as_mut_ptr(), buffer.len(), true, true, false)
                    .iov()
            };

            let mut message = ObjReadWrite {
                object_id,
                iov,
                offset,
                size,
                msg_has_data: false,
                data: None,
            };
            connection.send_message(
                MessageType::ObjRead,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::ObjReadWriteAck)?;
            let status = {
                let response: Response = request.unpack()?;
                if eager && response.status == 0 {
                    if let Some(data) = response.data {
                        let count = buffer.len().min(data.len());
                        buffer[..count].copy_from_slice(&data[..count]);
                    }
                }
                response.status
            };
            request.terminate(connection);

            if !eager {
                domain.unregister_segment(buffer.as_mut_ptr(), buffer.len());
            }

            Ok(status)
        })
    }

    /// Write the buffer at `offset`. Small writes ride inline in the
    /// request, larger ones are pulled by the server through a one sided
    /// read.
    pub fn obj_write(
        &self,
        object_id: ObjectId,
        buffer: &[u8],
        offset: u64,
    ) -> NetworkResult<i32> {
        let size = buffer.len() as u64;
        let eager = buffer.len() <= EAGER_MAX_WRITE;
        let domain = self.domain.clone();

        self.with_connection(|connection| {
            let iov = if eager {
                Iov::default()
            } else {
                domain
                    .register_segment(buffer.as_ptr() as *mut u8, buffer.len(), true, false, false)
                    .iov()
            };

            let mut message = ObjReadWrite {
                object_id,
                iov,
                offset,
                size,
                msg_has_data: eager,
                data: if eager { Some(buffer) } else { None },
            };
            connection.send_message(
                MessageType::ObjWrite,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::ObjReadWriteAck)?;
            let status = request.unpack::<Response>()?.status;
            request.terminate(connection);

            if !eager {
                domain.unregister_segment(buffer.as_ptr() as *mut u8, buffer.len());
            }

            Ok(status)
        })
    }

    /// Flush a range of the object, the whole object with a zero size.
    pub fn obj_flush(&self, object_id: ObjectId, offset: u64, size: u64) -> NetworkResult<i32> {
        self.with_connection(|connection| {
            let mut message = ObjFlush {
                object_id,
                offset,
                size,
            };
            connection.send_message(
                MessageType::ObjFlush,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::ObjFlushAck)?;
            let status = request.unpack::<Response>()?.status;
            request.terminate(connection);
            Ok(status)
        })
    }

    /// Create the object on the storage backend.
    pub fn obj_create(&self, object_id: ObjectId) -> NetworkResult<i32> {
        self.with_connection(|connection| {
            let mut message = ObjCreate { object_id };
            connection.send_message(
                MessageType::ObjCreate,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::ObjCreateAck)?;
            let status = request.unpack::<Response>()?.status;
            request.terminate(connection);
            Ok(status)
        })
    }

    /// Declare a mapping over an object range. Returns the range id on
    /// success and -1 on collision.
    pub fn obj_range_register(
        &self,
        object_id: ObjectId,
        offset: u64,
        size: u64,
        write: bool,
    ) -> NetworkResult<i32> {
        self.with_connection(|connection| {
            let mut message = RegisterRange {
                object_id,
                offset,
                size,
                write,
            };
            connection.send_message(
                MessageType::ObjRangeRegister,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::ObjRangeRegisterAck)?;
            let status = request.unpack::<Response>()?.status;
            request.terminate(connection);
            Ok(status)
        })
    }

    /// Withdraw a mapping registration. Every field must match the
    /// registration, including the id it returned.
    pub fn obj_range_unregister(
        &self,
        object_id: ObjectId,
        id: i32,
        offset: u64,
        size: u64,
        write: bool,
    ) -> NetworkResult<i32> {
        self.with_connection(|connection| {
            let mut message = UnregisterRange {
                object_id,
                offset,
                size,
                id,
                write,
            };
            connection.send_message(
                MessageType::ObjRangeUnregister,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::ObjRangeUnregisterAck)?;
            let status = request.unpack::<Response>()?.status;
            request.terminate(connection);
            Ok(status)
        })
    }

    /// Copy on write `source` into `dest`, the full object when `size` is
    /// zero.
    pub fn obj_cow(
        &self,
        source: ObjectId,
        dest: ObjectId,
        allow_exist: bool,
        offset: u64,
        size: u64,
    ) -> NetworkResult<i32> {
        self.with_connection(|connection| {
            let mut message = ObjectCow {
                source_object_id: source,
                dest_object_id: dest,
                allow_exist,
                range_offset: offset,
                range_size: size,
            };
            connection.send_message(
                MessageType::ObjCow,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::ObjCowAck)?;
            let status = request.unpack::<Response>()?.status;
            request.terminate(connection);
            Ok(status)
        })
    }

    /// Latency probe: the server fetches `rdma_size` bytes from a scratch
    /// buffer and `eager_size` bytes ride inline. Both sizes can be zero
    /// for a bare round trip.
    pub fn ping_pong(&self, rdma_size: u64, eager_size: u64) -> NetworkResult<i32> {
        let domain = self.domain.clone();
        let mut rdma_buffer = vec![0u8; rdma_size as usize];
        let eager_buffer = vec![0u8; eager_size as usize];

        self.with_connection(|connection| {
            let iov = if rdma_buffer.is_empty() {
                Iov::default()
            } else {
                domain
                    .register_segment(rdma_buffer.as_mut_ptr(), rdma_buffer.len(), true, true, false)
                    .iov()
            };

            let mut message = Ping {
                rdma_size,
                eager_size,
                rdma_iov: iov,
                eager_data: if eager_size > 0 {
                    Some(&eager_buffer)
                } else {
                    None
                },
            };
            connection.send_message(
                MessageType::Ping,
                SERVER_EP,
                &mut message,
                PostAction::nop(),
            )?;

            let request = connection.poll_message(MessageType::Pong)?;
            let status = request.unpack::<Response>()?.status;
            request.terminate(connection);

            if !rdma_buffer.is_empty() {
                domain.unregister_segment(rdma_buffer.as_mut_ptr(), rdma_buffer.len());
            }

            Ok(status)
        })
    }

    /// Run an operation on an exclusively held pooled connection. A failed
    /// operation retires its connection instead of returning it.
    fn with_connection<R, F>(&self, op: F) -> NetworkResult<R>
    where
        F: FnOnce(&mut FabricConnection) -> NetworkResult<R>,
    {
        let mut connection = self.acquire()?;
        let result = op(&mut connection);

        match result {
            Ok(value) => {
                self.release(connection);
                Ok(value)
            }
            Err(error) => {
                self.retire(connection);
                Err(error)
            }
        }
    }

    fn acquire(&self) -> NetworkResult<FabricConnection> {
        let mut state = self.pool.lock().expect("Client pool lock poisoned");

        loop {
            if let Some(connection) = state.idle.pop() {
                return Ok(connection);
            }

            if state.created < MAX_CONNECTIONS {
                state.created += 1;
                drop(state);

                return match self.open_connection() {
                    Ok(connection) => Ok(connection),
                    Err(error) => {
                        let mut state = self.pool.lock().expect("Client pool lock poisoned");
                        state.created -= 1;
                        drop(state);
                        self.available.notify_one();
                        Err(error)
                    }
                };
            }

            state = self
                .available
                .wait(state)
                .expect("Client pool lock poisoned");
        }
    }

    fn release(&self, connection: FabricConnection) {
        let mut state = self.pool.lock().expect("Client pool lock poisoned");
        state.idle.push(connection);
        drop(state);
        self.available.notify_one();
    }

    fn retire(&self, connection: FabricConnection) {
        drop(connection);
        let mut state = self.pool.lock().expect("Client pool lock poisoned");
        state.created -= 1;
        drop(state);
        self.available.notify_one();
    }

    fn open_connection(&self) -> NetworkResult<FabricConnection> {
        let mut connection = FabricConnection::new(self.domain.clone(), true, Some(&self.log))?;
        connection.post_receives(POST_RECEIVE_SIZE, CLIENT_RECV_COUNT);
        connection.set_tcp_auth(self.tcp_client_id, self.tcp_client_key);
        connection.join_server()?;
        Ok(connection)
    }
}
