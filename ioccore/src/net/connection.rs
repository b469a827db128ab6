//! The fabric connection: a reliable datagram endpoint with a completion
//! queue, pre-posted receive buffers, a message-type hook table and one
//! sided read/write operations against memory registered on the peer's
//! domain.
//!
//! Datagrams and one sided operations ride framed TCP streams, one stream
//! per peer endpoint. The frame kinds carrying one sided operations are
//! serviced inside the connection against the domain's region table and
//! never consume an application receive buffer.

use crate::debug;
use crate::logging::{self, Logger};
use crate::net::buffer::Buffer;
use crate::net::domain::FabricDomain;
use crate::net::hook::{ActionResult, ClientRequest, Hook, PostAction};
use crate::net::proto::{
    ErrorMessage, FirstClientMessage, FirstHandshake, MessageHeader, MessageType, Response,
    MAX_ADDR_LEN, PROTOCOL_VERSION,
};
use crate::net::registry::ClientRegistry;
use crate::net::serial::{pack_into, packed_size, unpack_from, WireMessage};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

pub type EndpointId = u64;

/// Endpoint id under which a client addresses the server.
pub const SERVER_EP: EndpointId = 0;

/// Provider limit on IO vector entries per one sided operation.
pub const MAX_RDMA_SEGMENTS: usize = 256;
/// Byte budget of a single one sided chunk on the wire.
const MAX_RDMA_CHUNK_BYTES: usize = 4 * 1024 * 1024;
/// Buffered egress bytes per endpoint before senders hit back-pressure.
const TX_LIMIT: usize = 16 * 1024 * 1024;
/// Ingress buffer bound per endpoint, an incoming frame can never exceed it.
const RX_LIMIT: usize = 8 * 1024 * 1024 + 4096;
/// Completion queue depth that triggers the back-pressure warning.
const COMPLETION_CACHE_WARN: usize = 1000;

const LISTENER: Token = Token(0);
const FRAME_HEAD: usize = 5;

const FRAME_MSG: u8 = 0;
const FRAME_RDMA_READ_REQ: u8 = 1;
const FRAME_RDMA_READ_RESP: u8 = 2;
const FRAME_RDMA_WRITE: u8 = 3;
const FRAME_RDMA_WRITE_ACK: u8 = 4;

/// One local scatter/gather entry of an IO vector operation.
#[derive(Debug, Copy, Clone)]
pub struct LocalIov {
    pub addr: usize,
    pub len: usize,
}

struct TxEntry {
    head: [u8; FRAME_HEAD],
    head_sent: usize,
    body: Vec<u8>,
    body_len: usize,
    body_sent: usize,
    action: Option<PostAction>,
    pooled: bool,
}

struct Endpoint {
    stream: TcpStream,
    rx: Buffer,
    tx: VecDeque<TxEntry>,
    tx_bytes: usize,
    ep_id: Option<EndpointId>,
}

struct PendingOp {
    group: u64,
    token: usize,
    targets: Vec<LocalIov>,
}

struct OpGroup {
    remaining: usize,
    action: Option<PostAction>,
}

enum Completion {
    Recv {
        token: usize,
        buffer_id: usize,
        size: usize,
    },
    Sent {
        action: Option<PostAction>,
        pooled: Option<Vec<u8>>,
    },
    Rdma {
        action: Option<PostAction>,
    },
}

type EndpointHook = Box<dyn FnMut(EndpointId) + Send>;
type BadAuthHook = Box<dyn FnMut() + Send>;

pub struct FabricConnection {
    domain: Arc<FabricDomain>,
    registry: Arc<ClientRegistry>,

    mio_poll: Poll,
    events: Events,
    listener: Option<TcpListener>,

    endpoints: Vec<Option<Endpoint>>,
    ep_map: HashMap<EndpointId, usize>,
    next_endpoint_id: EndpointId,

    recv_buffers: Vec<Option<Box<[u8]>>>,
    recv_free: Vec<usize>,
    recv_size: usize,
    pending_msgs: VecDeque<(usize, Vec<u8>)>,

    completions: VecDeque<Completion>,
    pending_actions: usize,
    cache_warned: bool,

    pending_ops: HashMap<u64, PendingOp>,
    pending_groups: HashMap<u64, OpGroup>,
    next_op_id: u64,

    hooks: HashMap<u64, Box<dyn Hook>>,
    on_endpoint_connect: Option<EndpointHook>,
    on_bad_auth: Option<BadAuthHook>,

    check_client_auth: bool,
    reception_disabled: bool,
    passive_polling: bool,

    local_lf_id: Option<EndpointId>,
    tcp_client_id: u64,
    tcp_client_key: u64,

    log: Logger,
}

impl FabricConnection {
    /// Create a connection on the given domain. A server domain binds its
    /// listen address here; a client connects lazily in `join_server`.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        domain: Arc<FabricDomain>,
        passive_polling: bool,
        log: L,
    ) -> NetworkResult<FabricConnection> {
        let mio_poll = Poll::new()?;
        let log = logging::child(log);

        let listener = if domain.is_server() {
            let addr: SocketAddr = format!("{}:{}", domain.ip(), domain.port())
                .parse()
                .map_err(NetworkError::from)?;
            let mut listener = TcpListener::bind(addr)?;
            mio_poll
                .registry()
                .register(&mut listener, LISTENER, Interest::READABLE)?;
            logging::debug!(log, "fabric listening"; "addr" => %listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        Ok(FabricConnection {
            domain,
            registry: Arc::new(ClientRegistry::new(Some(&log))),
            mio_poll,
            events: Events::with_capacity(1024),
            listener,
            endpoints: Vec::new(),
            ep_map: HashMap::new(),
            next_endpoint_id: 1,
            recv_buffers: Vec::new(),
            recv_free: Vec::new(),
            recv_size: 0,
            pending_msgs: VecDeque::new(),
            completions: VecDeque::new(),
            pending_actions: 0,
            cache_warned: false,
            pending_ops: HashMap::new(),
            pending_groups: HashMap::new(),
            next_op_id: 1,
            hooks: HashMap::new(),
            on_endpoint_connect: None,
            on_bad_auth: None,
            check_client_auth: false,
            reception_disabled: false,
            passive_polling,
            local_lf_id: None,
            tcp_client_id: 0,
            tcp_client_key: 0,
            log,
        })
    }

    /// Port the server listener is bound to.
    pub fn listen_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    #[inline]
    pub fn client_registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    #[inline]
    pub fn domain(&self) -> &Arc<FabricDomain> {
        &self.domain
    }

    /// Enable validation of the `(tcpClientId, tcpClientKey)` pair carried
    /// by every application message.
    #[inline]
    pub fn set_check_client_auth(&mut self, check: bool) {
        self.check_client_auth = check;
    }

    /// Credentials attached to every outgoing message, obtained from the
    /// TCP handshake on the client side.
    #[inline]
    pub fn set_tcp_auth(&mut self, tcp_client_id: u64, tcp_client_key: u64) {
        self.tcp_client_id = tcp_client_id;
        self.tcp_client_key = tcp_client_key;
    }

    /// Fabric client id assigned by the server, if joined.
    #[inline]
    pub fn local_lf_id(&self) -> Option<EndpointId> {
        self.local_lf_id
    }

    /// Register the hook handling one message type.
    pub fn register_hook(&mut self, message_type: MessageType, hook: Box<dyn Hook>) {
        self.hooks.insert(message_type.into(), hook);
    }

    pub fn unregister_hook(&mut self, message_type: MessageType) {
        self.hooks.remove(&u64::from(message_type));
    }

    /// Called with the endpoint id of every newly connected fabric client.
    pub fn set_on_endpoint_connect(&mut self, hook: EndpointHook) {
        self.on_endpoint_connect = Some(hook);
    }

    /// Client side handler for `BAD_AUTH` replies. Without it the process
    /// aborts on the first authentication rejection.
    pub fn set_on_bad_auth(&mut self, hook: BadAuthHook) {
        self.on_bad_auth = Some(hook);
    }

    /// Allocate and post `count` receive buffers of `size` bytes.
    pub fn post_receives(&mut self, size: usize, count: usize) {
        self.recv_size = size;
        for _ in 0..count {
            let id = self.recv_buffers.len();
            self.recv_buffers
                .push(Some(vec![0u8; size].into_boxed_slice()));
            self.recv_free.push(id);
        }
        logging::debug!(self.log, "posted receive buffers"; "count" => count, "size" => size);
    }

    /// Return a consumed receive buffer to the provider. Must be called
    /// exactly once per dispatched request, after every borrowed slice has
    /// been consumed.
    pub fn repost_receive(&mut self, request: ClientRequest) {
        let id = request.msg_buffer_id;
        assert!(
            self.recv_buffers[id].is_none(),
            "Receive buffer {} reposted twice",
            id
        );
        self.recv_buffers[id] = Some(request.buffer);

        // Feed a queued message straight into the freed buffer.
        if let Some((token, body)) = self.pending_msgs.pop_front() {
            self.fill_receive(token, id, &body);
        } else {
            self.recv_free.push(id);
        }
    }

    /// Client side: connect to the server, announce the endpoint and block
    /// until the id assignment arrives.
    pub fn join_server(&mut self) -> NetworkResult<()> {
        let target = format!("{}:{}", self.domain.ip(), self.domain.port());
        let addr = target
            .to_socket_addrs()
            .map_err(NetworkError::from)?
            .next()
            .ok_or(NetworkError::Fatal(ErrorType::AddrParse))?;

        let stream = TcpStream::connect(addr)?;
        let token = self.add_endpoint(stream, Some(SERVER_EP));
        self.ep_map.insert(SERVER_EP, token);

        // Announce ourselves with our local endpoint address.
        let mut message = FirstClientMessage::default();
        let local = match self.endpoint(token).stream.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => String::new(),
        };
        let bytes = local.as_bytes();
        let count = bytes.len().min(MAX_ADDR_LEN - 1);
        message.addr[..count].copy_from_slice(&bytes[..count]);

        self.send_message(
            MessageType::ConnectInit,
            SERVER_EP,
            &mut message,
            PostAction::nop(),
        )?;

        let request = self.poll_message(MessageType::AssignId)?;
        let handshake: FirstHandshake = request.unpack()?;

        if handshake.protocol_version != PROTOCOL_VERSION {
            debug::fatal(&format!(
                "Protocol version mismatch, local={}, server={}",
                PROTOCOL_VERSION, handshake.protocol_version
            ));
        }

        self.local_lf_id = Some(handshake.assign_lf_client_id);
        request.terminate(self);

        logging::debug!(self.log, "joined server";
                        "lf_client_id" => handshake.assign_lf_client_id);

        Ok(())
    }

    /// Serialize and send a message to the destination endpoint. The post
    /// action fires once the send completes; the pooled buffer carrying the
    /// message returns to the domain automatically.
    pub fn send_message<'a, T: WireMessage<'a>>(
        &mut self,
        message_type: MessageType,
        destination: EndpointId,
        payload: &mut T,
        action: PostAction,
    ) -> NetworkResult<()> {
        let token = *self
            .ep_map
            .get(&destination)
            .ok_or(NetworkError::Fatal(ErrorType::UnknownEndpoint(destination)))?;

        self.send_message_to_token(token, message_type, destination, payload, action)
    }

    /// Send a response message. The server path keeps the poll loop running
    /// (`unblock == false`), tests waiting on the send pass `true`.
    pub fn send_response(
        &mut self,
        message_type: MessageType,
        destination: EndpointId,
        response: &mut Response,
        unblock: bool,
    ) -> NetworkResult<()> {
        let action = if unblock {
            PostAction::unblock()
        } else {
            PostAction::nop()
        };
        self.send_message(message_type, destination, response, action)
    }

    /// One sided read of a single local region from remote memory.
    pub fn rdma_read(
        &mut self,
        destination: EndpointId,
        local: *mut u8,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        action: PostAction,
    ) -> NetworkResult<()> {
        let iov = [LocalIov {
            addr: local as usize,
            len: size,
        }];
        self.rdma_readv(destination, &iov, remote_addr, remote_key, action)
    }

    /// One sided write of a single local region to remote memory.
    pub fn rdma_write(
        &mut self,
        destination: EndpointId,
        local: *const u8,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        action: PostAction,
    ) -> NetworkResult<()> {
        let iov = [LocalIov {
            addr: local as usize,
            len: size,
        }];
        self.rdma_writev(destination, &iov, remote_addr, remote_key, action)
    }

    /// Vectored one sided read: scatter remote bytes into the local IO
    /// vector. Transfers above the provider segment cap are split into
    /// successive chunks, the action fires after the last chunk completes.
    pub fn rdma_readv(
        &mut self,
        destination: EndpointId,
        iov: &[LocalIov],
        remote_addr: u64,
        remote_key: u64,
        action: PostAction,
    ) -> NetworkResult<()> {
        let token = self.token_of(destination)?;
        let chunks = chunk_iov(iov);

        let group = self.new_group(chunks.len(), action);

        let mut consumed = 0u64;
        for chunk in chunks {
            let chunk_bytes: usize = chunk.iter().map(|entry| entry.len).sum();
            let op_id = self.next_op_id;
            self.next_op_id += 1;

            self.pending_ops.insert(
                op_id,
                PendingOp {
                    group,
                    token,
                    targets: chunk,
                },
            );

            let mut body = vec![0u8; 32];
            LittleEndian::write_u64(&mut body[0..], op_id);
            LittleEndian::write_u64(&mut body[8..], remote_addr + consumed);
            LittleEndian::write_u64(&mut body[16..], remote_key);
            LittleEndian::write_u64(&mut body[24..], chunk_bytes as u64);

            self.enqueue_frame(token, FRAME_RDMA_READ_REQ, body, None, None, false, true)?;
            consumed += chunk_bytes as u64;
        }

        Ok(())
    }

    /// Vectored one sided write: gather the local IO vector into remote
    /// memory. Chunking as for `rdma_readv`.
    pub fn rdma_writev(
        &mut self,
        destination: EndpointId,
        iov: &[LocalIov],
        remote_addr: u64,
        remote_key: u64,
        action: PostAction,
    ) -> NetworkResult<()> {
        let token = self.token_of(destination)?;
        let chunks = chunk_iov(iov);

        let group = self.new_group(chunks.len(), action);

        let mut consumed = 0u64;
        for chunk in chunks {
            let chunk_bytes: usize = chunk.iter().map(|entry| entry.len).sum();
            let op_id = self.next_op_id;
            self.next_op_id += 1;

            self.pending_ops.insert(
                op_id,
                PendingOp {
                    group,
                    token,
                    targets: Vec::new(),
                },
            );

            let mut body = vec![0u8; 24 + chunk_bytes];
            LittleEndian::write_u64(&mut body[0..], op_id);
            LittleEndian::write_u64(&mut body[8..], remote_addr + consumed);
            LittleEndian::write_u64(&mut body[16..], remote_key);

            let mut cursor = 24;
            for entry in &chunk {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        entry.addr as *const u8,
                        body.as_mut_ptr().add(cursor),
                        entry.len,
                    );
                }
                cursor += entry.len;
            }

            self.enqueue_frame(token, FRAME_RDMA_WRITE, body, None, None, false, true)?;
            consumed += chunk_bytes as u64;
        }

        Ok(())
    }

    /// Drain the completion queue. With `wait_for_message` the call blocks
    /// (or spins under active polling) until a post action or hook returns
    /// `Unblock`; without it, whatever is ready is serviced and the call
    /// returns.
    pub fn poll(&mut self, wait_for_message: bool) {
        if !wait_for_message {
            self.io_progress(Some(Duration::from_millis(1)));
            while let Some(completion) = self.completions.pop_front() {
                self.process_completion(completion);
            }
            return;
        }

        loop {
            while let Some(completion) = self.completions.pop_front() {
                if self.process_completion(completion) == ActionResult::Unblock {
                    return;
                }
            }

            self.io_progress(self.wait_timeout());
        }
    }

    /// Poll variant used by clients: block until a receive of the expected
    /// type arrives and return it. Sends completing during the wait fire
    /// their post actions but do not unblock the call.
    pub fn poll_message(&mut self, expected: MessageType) -> NetworkResult<ClientRequest> {
        loop {
            while let Some(completion) = self.completions.pop_front() {
                match completion {
                    Completion::Recv {
                        token,
                        buffer_id,
                        size,
                    } => {
                        let request = self.build_request(token, buffer_id, size)?;

                        match MessageType::from_raw(request.header.msg_type) {
                            Some(MessageType::FatalError) => self.on_fatal_error(request),
                            Some(MessageType::BadAuth) => {
                                self.on_bad_auth_message(request);
                            }
                            Some(message_type) if message_type == expected => {
                                return Ok(request);
                            }
                            Some(message_type) => debug::fatal(&format!(
                                "Waiting a message of type {:?} but received {:?}",
                                expected, message_type
                            )),
                            None => debug::fatal(&format!(
                                "Invalid message type {} received",
                                request.header.msg_type
                            )),
                        }
                    }
                    other => {
                        self.process_completion(other);
                    }
                }
            }

            // A client whose server stream died will never see the answer.
            if self.listener.is_none() && !self.ep_map.contains_key(&SERVER_EP) {
                return Err(NetworkError::Fatal(ErrorType::Disconnected));
            }

            self.io_progress(self.wait_timeout());
        }
    }

    /// Drain the completion queue until every pending post action has run.
    /// Used on shutdown.
    pub fn poll_all_pending_actions(&mut self) {
        while self.pending_actions > 0 {
            self.poll(false);
        }
    }

    /// Disable reception, notify every known endpoint that the server is
    /// dying and block until the notifications are flushed out.
    pub fn broadcast_error_message(&mut self, message: &str) {
        self.reception_disabled = true;

        let destinations: Vec<EndpointId> = self.ep_map.keys().copied().collect();
        for destination in destinations {
            let mut payload = ErrorMessage {
                message: message.to_string(),
            };
            let _ = self.send_message(
                MessageType::FatalError,
                destination,
                &mut payload,
                PostAction::nop(),
            );
        }

        // Flush with a bounded number of rounds so a dead peer cannot hang
        // the abort path forever.
        let mut rounds = 0;
        while self.has_pending_tx() && rounds < 5000 {
            self.io_progress(Some(Duration::from_millis(1)));
            rounds += 1;
        }
    }

    #[inline]
    fn wait_timeout(&self) -> Option<Duration> {
        if self.passive_polling {
            None
        } else {
            Some(Duration::from_millis(0))
        }
    }

    #[inline]
    fn token_of(&self, destination: EndpointId) -> NetworkResult<usize> {
        self.ep_map
            .get(&destination)
            .copied()
            .ok_or(NetworkError::Fatal(ErrorType::UnknownEndpoint(destination)))
    }

    #[inline]
    fn endpoint(&mut self, token: usize) -> &mut Endpoint {
        self.endpoints[token - 1]
            .as_mut()
            .expect("Operation on a dead endpoint")
    }

    fn has_pending_tx(&self) -> bool {
        self.endpoints
            .iter()
            .flatten()
            .any(|endpoint| !endpoint.tx.is_empty())
    }

    fn add_endpoint(&mut self, mut stream: TcpStream, ep_id: Option<EndpointId>) -> usize {
        // Reuse a free slot before growing the table.
        let slot = self
            .endpoints
            .iter()
            .position(|endpoint| endpoint.is_none())
            .unwrap_or_else(|| {
                self.endpoints.push(None);
                self.endpoints.len() - 1
            });
        let token = slot + 1;

        self.mio_poll
            .registry()
            .register(
                &mut stream,
                Token(token),
                Interest::READABLE | Interest::WRITABLE,
            )
            .expect("Stream registration failed");

        self.endpoints[slot] = Some(Endpoint {
            stream,
            rx: Buffer::new(RX_LIMIT),
            tx: VecDeque::new(),
            tx_bytes: 0,
            ep_id,
        });

        token
    }

    fn remove_endpoint(&mut self, token: usize) {
        let endpoint = match self.endpoints[token - 1].take() {
            Some(endpoint) => endpoint,
            None => return,
        };

        if let Some(ep_id) = endpoint.ep_id {
            self.ep_map.remove(&ep_id);
        }

        // Release the resources of every transmit entry still queued.
        for entry in endpoint.tx {
            let action = entry.action;
            if entry.pooled {
                self.domain.ret_msg_buffer(entry.body);
            }
            self.release_action(action);
        }

        // One sided operations in flight on this endpoint never complete,
        // release their groups so pending actions can drain.
        let mut dead_groups: Vec<u64> = Vec::new();
        self.pending_ops.retain(|_, op| {
            if op.token == token {
                dead_groups.push(op.group);
                false
            } else {
                true
            }
        });
        for group_id in dead_groups {
            if let Some(group) = self.pending_groups.remove(&group_id) {
                self.release_action(group.action);
            }
        }

        logging::debug!(self.log, "endpoint closed"; "ep_id" => ?endpoint.ep_id);
    }

    fn new_group(&mut self, chunks: usize, action: PostAction) -> u64 {
        let group = self.next_op_id;
        self.next_op_id += 1;
        self.pending_actions += 1;
        self.pending_groups.insert(
            group,
            OpGroup {
                remaining: chunks,
                action: Some(action),
            },
        );
        group
    }

    fn send_message_to_token<'a, T: WireMessage<'a>>(
        &mut self,
        token: usize,
        message_type: MessageType,
        destination: EndpointId,
        payload: &mut T,
        action: PostAction,
    ) -> NetworkResult<()> {
        let mut header = MessageHeader {
            msg_type: message_type.into(),
            lf_client_id: self.local_lf_id.unwrap_or(destination),
            tcp_client_id: self.tcp_client_id,
            tcp_client_key: self.tcp_client_key,
        };

        let size = MessageHeader::SIZE + packed_size(payload);
        let mut buffer = self.domain.get_msg_buffer();
        assert!(
            size <= buffer.len(),
            "Message of {} bytes does not fit the {} byte message buffers",
            size,
            buffer.len()
        );

        pack_into(&mut buffer[..MessageHeader::SIZE], &mut header)?;
        pack_into(&mut buffer[MessageHeader::SIZE..size], payload)?;

        self.enqueue_frame(token, FRAME_MSG, buffer, Some(size), Some(action), true, true)?;

        Ok(())
    }

    /// Queue one frame on the endpoint. `checked` senders retry under
    /// back-pressure by draining ready completions into the queue, frames
    /// generated while servicing peer operations bypass the gate.
    fn enqueue_frame(
        &mut self,
        token: usize,
        kind: u8,
        body: Vec<u8>,
        body_len: Option<usize>,
        action: Option<PostAction>,
        pooled: bool,
        checked: bool,
    ) -> NetworkResult<()> {
        let body_len = body_len.unwrap_or(body.len());

        if action.is_some() {
            self.pending_actions += 1;
        }

        if checked {
            let mut rounds = 0usize;
            while self.endpoint_alive(token) && self.endpoint(token).tx_bytes > TX_LIMIT {
                if self.completions.len() > COMPLETION_CACHE_WARN && !self.cache_warned {
                    self.cache_warned = true;
                    logging::warn!(self.log, "completion cache is getting deep";
                                   "depth" => self.completions.len());
                }
                self.io_progress(Some(Duration::from_millis(1)));
                rounds += 1;
                if rounds > 60_000 {
                    return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::TimedOut)));
                }
            }
        }

        if !self.endpoint_alive(token) {
            if pooled {
                self.domain.ret_msg_buffer(body);
            }
            self.release_action(action);
            return Err(NetworkError::Fatal(ErrorType::Disconnected));
        }

        let mut head = [0u8; FRAME_HEAD];
        LittleEndian::write_u32(&mut head[0..4], body_len as u32 + 1);
        head[4] = kind;

        let entry = TxEntry {
            head,
            head_sent: 0,
            body,
            body_len,
            body_sent: 0,
            action,
            pooled,
        };

        let endpoint = self.endpoint(token);
        endpoint.tx_bytes += body_len + FRAME_HEAD;
        endpoint.tx.push_back(entry);

        self.flush_endpoint(token);
        Ok(())
    }

    #[inline]
    fn endpoint_alive(&self, token: usize) -> bool {
        self.endpoints
            .get(token - 1)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Push ready bytes of the endpoint transmit queue to the socket and
    /// queue send completions for fully written frames.
    fn flush_endpoint(&mut self, token: usize) {
        let mut finished: Vec<TxEntry> = Vec::new();
        let mut failed = false;

        {
            let endpoint = match self.endpoints[token - 1].as_mut() {
                Some(endpoint) => endpoint,
                None => return,
            };

            'outer: while let Some(entry) = endpoint.tx.front_mut() {
                while entry.head_sent < FRAME_HEAD {
                    match endpoint.stream.write(&entry.head[entry.head_sent..]) {
                        Ok(0) => {
                            failed = true;
                            break 'outer;
                        }
                        Ok(count) => entry.head_sent += count,
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break 'outer,
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => {
                            failed = true;
                            break 'outer;
                        }
                    }
                }

                while entry.body_sent < entry.body_len {
                    match endpoint
                        .stream
                        .write(&entry.body[entry.body_sent..entry.body_len])
                    {
                        Ok(0) => {
                            failed = true;
                            break 'outer;
                        }
                        Ok(count) => entry.body_sent += count,
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break 'outer,
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => {
                            failed = true;
                            break 'outer;
                        }
                    }
                }

                let entry = endpoint.tx.pop_front().expect("Transmit queue front vanished");
                endpoint.tx_bytes -= entry.body_len + FRAME_HEAD;
                finished.push(entry);
            }
        }

        for entry in finished {
            let pooled = if entry.pooled { Some(entry.body) } else { None };
            self.completions.push_back(Completion::Sent {
                action: entry.action,
                pooled,
            });
        }

        if failed {
            self.remove_endpoint(token);
        }
    }

    /// Run the event loop once: accept new streams, read frames, flush
    /// transmit queues. New work lands on the completion queue.
    fn io_progress(&mut self, timeout: Option<Duration>) {
        match self.mio_poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => return,
            Err(error) => debug::fatal(&format!("Fabric event loop failure: {}", error)),
        }

        let mut ready: Vec<(Token, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            ready.push((event.token(), event.is_readable(), event.is_writable()));
        }

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_all();
                continue;
            }

            let token = token.0;
            if readable && self.endpoint_alive(token) {
                self.endpoint_read(token);
            }
            if writable && self.endpoint_alive(token) {
                self.flush_endpoint(token);
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, addr)) => {
                    logging::debug!(self.log, "accepted fabric stream"; "peer" => %addr);
                    self.add_endpoint(stream, None);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    logging::error!(self.log, "accept failure"; "error" => %error);
                    return;
                }
            }
        }
    }

    fn endpoint_read(&mut self, token: usize) {
        loop {
            let mut frames: Vec<(u8, Vec<u8>)> = Vec::new();
            let mut disconnect = false;
            let mut progressed = false;

            {
                let endpoint = match self.endpoints[token - 1].as_mut() {
                    Some(endpoint) => endpoint,
                    None => return,
                };

                match endpoint.rx.ingress(&mut endpoint.stream) {
                    Ok(count) => progressed = count > 0,
                    Err(_) => disconnect = true,
                }

                if !disconnect {
                    // Split off every complete frame.
                    loop {
                        let data = endpoint.rx.read_slice();
                        if data.len() < 4 {
                            break;
                        }

                        let frame_len = LittleEndian::read_u32(&data[..4]) as usize;
                        if frame_len == 0 || frame_len > RX_LIMIT - 4 {
                            disconnect = true;
                            break;
                        }
                        if data.len() < 4 + frame_len {
                            break;
                        }

                        let kind = data[4];
                        let body = data[FRAME_HEAD..4 + frame_len].to_vec();
                        endpoint.rx.move_head(4 + frame_len);
                        frames.push((kind, body));
                    }
                }
            }

            for (kind, body) in frames {
                self.handle_frame(token, kind, body);
            }

            if disconnect {
                self.remove_endpoint(token);
                return;
            }
            if !progressed {
                return;
            }
        }
    }

    fn handle_frame(&mut self, token: usize, kind: u8, body: Vec<u8>) {
        match kind {
            FRAME_MSG => self.deliver_msg(token, body),
            FRAME_RDMA_READ_REQ => self.serve_remote_read(token, &body),
            FRAME_RDMA_WRITE => self.serve_remote_write(token, &body),
            FRAME_RDMA_READ_RESP => self.on_read_response(&body),
            FRAME_RDMA_WRITE_ACK => self.on_write_ack(&body),
            _ => debug::fatal(&format!("Invalid fabric frame kind {}", kind)),
        }
    }

    fn deliver_msg(&mut self, token: usize, body: Vec<u8>) {
        match self.recv_free.pop() {
            Some(buffer_id) => self.fill_receive(token, buffer_id, &body),
            None => {
                // Provider back-pressure: park the datagram until a buffer
                // is reposted.
                self.pending_msgs.push_back((token, body));
            }
        }
    }

    fn fill_receive(&mut self, token: usize, buffer_id: usize, body: &[u8]) {
        let buffer = self.recv_buffers[buffer_id]
            .as_mut()
            .expect("Filling a receive buffer that is in flight");

        if body.len() > buffer.len() {
            debug::fatal(&format!(
                "Received a {} byte message exceeding the {} byte receive buffers",
                body.len(),
                buffer.len()
            ));
        }

        buffer[..body.len()].copy_from_slice(body);
        self.completions.push_back(Completion::Recv {
            token,
            buffer_id,
            size: body.len(),
        });
    }

    fn serve_remote_read(&mut self, token: usize, body: &[u8]) {
        if body.len() != 32 {
            debug::fatal("Malformed remote read request");
        }
        let op_id = LittleEndian::read_u64(&body[0..]);
        let addr = LittleEndian::read_u64(&body[8..]);
        let key = LittleEndian::read_u64(&body[16..]);
        let size = LittleEndian::read_u64(&body[24..]) as usize;

        let ptr = match self.domain.resolve(addr, key, size, false) {
            Some(ptr) => ptr,
            None => debug::fatal(&format!(
                "Remote read targets an unregistered region: addr={:#x}, key={}, size={}",
                addr, key, size
            )),
        };

        let mut response = vec![0u8; 8 + size];
        LittleEndian::write_u64(&mut response[0..], op_id);
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, response.as_mut_ptr().add(8), size);
        }

        let _ = self.enqueue_frame(token, FRAME_RDMA_READ_RESP, response, None, None, false, false);
    }

    fn serve_remote_write(&mut self, token: usize, body: &[u8]) {
        if body.len() < 24 {
            debug::fatal("Malformed remote write request");
        }
        let op_id = LittleEndian::read_u64(&body[0..]);
        let addr = LittleEndian::read_u64(&body[8..]);
        let key = LittleEndian::read_u64(&body[16..]);
        let data = &body[24..];

        let ptr = match self.domain.resolve(addr, key, data.len(), true) {
            Some(ptr) => ptr,
            None => debug::fatal(&format!(
                "Remote write targets an unregistered region: addr={:#x}, key={}, size={}",
                addr,
                key,
                data.len()
            )),
        };

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }

        let mut ack = vec![0u8; 8];
        LittleEndian::write_u64(&mut ack[0..], op_id);
        let _ = self.enqueue_frame(token, FRAME_RDMA_WRITE_ACK, ack, None, None, false, false);
    }

    fn on_read_response(&mut self, body: &[u8]) {
        if body.len() < 8 {
            debug::fatal("Malformed remote read response");
        }
        let op_id = LittleEndian::read_u64(&body[0..]);
        let data = &body[8..];

        let op = match self.pending_ops.remove(&op_id) {
            Some(op) => op,
            None => debug::fatal(&format!("Read completion for unknown operation {}", op_id)),
        };

        let expected: usize = op.targets.iter().map(|entry| entry.len).sum();
        if data.len() != expected {
            debug::fatal("Remote read returned an unexpected byte count");
        }

        let mut cursor = 0usize;
        for entry in &op.targets {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(cursor),
                    entry.addr as *mut u8,
                    entry.len,
                );
            }
            cursor += entry.len;
        }

        self.finish_group_chunk(op.group);
    }

    fn on_write_ack(&mut self, body: &[u8]) {
        if body.len() != 8 {
            debug::fatal("Malformed remote write acknowledgement");
        }
        let op_id = LittleEndian::read_u64(&body[0..]);

        let op = match self.pending_ops.remove(&op_id) {
            Some(op) => op,
            None => debug::fatal(&format!("Write completion for unknown operation {}", op_id)),
        };

        self.finish_group_chunk(op.group);
    }

    fn finish_group_chunk(&mut self, group_id: u64) {
        let finished = {
            let group = self
                .pending_groups
                .get_mut(&group_id)
                .expect("Chunk completion for unknown operation group");
            group.remaining -= 1;
            group.remaining == 0
        };

        if finished {
            let group = self
                .pending_groups
                .remove(&group_id)
                .expect("Operation group vanished");
            self.completions
                .push_back(Completion::Rdma { action: group.action });
        }
    }

    fn process_completion(&mut self, completion: Completion) -> ActionResult {
        match completion {
            Completion::Sent { action, pooled } => {
                if let Some(buffer) = pooled {
                    self.domain.ret_msg_buffer(buffer);
                }
                self.run_action(action)
            }
            Completion::Rdma { action } => self.run_action(action),
            Completion::Recv {
                token,
                buffer_id,
                size,
            } => self.on_recv_message(token, buffer_id, size),
        }
    }

    fn run_action(&mut self, action: Option<PostAction>) -> ActionResult {
        let mut action = match action {
            Some(action) => action,
            None => return ActionResult::KeepWaiting,
        };
        self.pending_actions -= 1;

        let result = match action.func.take() {
            Some(func) => func(self),
            None => ActionResult::KeepWaiting,
        };

        if let Some(request) = action.request.take() {
            self.repost_receive(request);
        }

        result
    }

    /// Release the resources of an action without running it. Taken on every
    /// failure path so receive buffers survive dead operations.
    fn release_action(&mut self, action: Option<PostAction>) {
        if let Some(mut action) = action {
            self.pending_actions -= 1;
            if let Some(request) = action.request.take() {
                self.repost_receive(request);
            }
        }
    }

    fn build_request(
        &mut self,
        _token: usize,
        buffer_id: usize,
        size: usize,
    ) -> NetworkResult<ClientRequest> {
        let buffer = self.recv_buffers[buffer_id]
            .take()
            .expect("Receive completion for a buffer in flight");

        let (header, consumed) = match unpack_from::<MessageHeader>(&buffer[..size]) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug::fatal(&format!("Message header deserialization failed: {:?}", error))
            }
        };

        Ok(ClientRequest {
            lf_client_id: header.lf_client_id,
            msg_buffer_id: buffer_id,
            header,
            buffer,
            payload_start: consumed,
            payload_end: size,
        })
    }

    fn on_recv_message(&mut self, token: usize, buffer_id: usize, size: usize) -> ActionResult {
        let request = match self.build_request(token, buffer_id, size) {
            Ok(request) => request,
            Err(error) => debug::fatal(&format!("Malformed message received: {:?}", error)),
        };

        if self.reception_disabled {
            self.repost_receive(request);
            return ActionResult::KeepWaiting;
        }

        let message_type = match MessageType::from_raw(request.header.msg_type) {
            Some(message_type) => message_type,
            None => debug::fatal(&format!(
                "Invalid message type {} received",
                request.header.msg_type
            )),
        };

        match message_type {
            MessageType::ConnectInit => {
                self.on_connect_init(token, request);
                return ActionResult::KeepWaiting;
            }
            MessageType::BadAuth => {
                self.on_bad_auth_message(request);
                return ActionResult::KeepWaiting;
            }
            MessageType::FatalError => self.on_fatal_error(request),
            _ => {}
        }

        // Application messages are validated against the client registry.
        if self.check_client_auth && !message_type.is_low_level() {
            let header = request.header;
            if !self
                .registry
                .check_identification(header.tcp_client_id, header.tcp_client_key)
            {
                logging::warn!(self.log, "rejecting message with bad auth";
                               "tcp_client_id" => header.tcp_client_id,
                               "msg_type" => header.msg_type);
                let destination = header.lf_client_id;
                self.repost_receive(request);
                let mut empty = crate::net::proto::Empty;
                let _ = self.send_message(
                    MessageType::BadAuth,
                    destination,
                    &mut empty,
                    PostAction::nop(),
                );
                return ActionResult::KeepWaiting;
            }
        }

        // Dispatch on the hook table. The hook is taken out for the call so
        // it can borrow the connection.
        let raw = request.header.msg_type;
        let mut hook = match self.hooks.remove(&raw) {
            Some(hook) => hook,
            None => debug::fatal(&format!("No hook registered for message type {}", raw)),
        };

        let result = hook.on_message(self, request);
        self.hooks.insert(raw, hook);

        result
    }

    fn on_connect_init(&mut self, token: usize, request: ClientRequest) {
        // The payload carries the peer address for providers that need an
        // address vector entry; the stream already identifies the peer here.
        let ep_id = self.next_endpoint_id;
        self.next_endpoint_id += 1;

        self.endpoint(token).ep_id = Some(ep_id);
        self.ep_map.insert(ep_id, token);
        self.repost_receive(request);

        let mut handshake = FirstHandshake {
            protocol_version: PROTOCOL_VERSION,
            assign_lf_client_id: ep_id,
        };
        if let Err(error) = self.send_message_to_token(
            token,
            MessageType::AssignId,
            ep_id,
            &mut handshake,
            PostAction::nop(),
        ) {
            logging::error!(self.log, "failed to answer connection init"; "error" => ?error);
            return;
        }

        logging::debug!(self.log, "fabric client connected"; "lf_client_id" => ep_id);

        if let Some(mut hook) = self.on_endpoint_connect.take() {
            hook(ep_id);
            self.on_endpoint_connect = Some(hook);
        }
    }

    fn on_bad_auth_message(&mut self, request: ClientRequest) {
        self.repost_receive(request);

        match self.on_bad_auth.take() {
            Some(mut hook) => {
                hook();
                self.on_bad_auth = Some(hook);
            }
            None => debug::fatal("Client authentication rejected by the server"),
        }
    }

    fn on_fatal_error(&mut self, request: ClientRequest) -> ! {
        let message = request
            .unpack::<ErrorMessage>()
            .map(|error| error.message)
            .unwrap_or_else(|_| "<undecodable>".to_string());

        debug::fatal(&format!("Remote fatal error: {}", message));
    }
}

/// Split an IO vector into chunks below the provider segment and byte caps.
/// Oversized single entries are cut along the byte budget.
fn chunk_iov(iov: &[LocalIov]) -> Vec<Vec<LocalIov>> {
    let mut chunks: Vec<Vec<LocalIov>> = Vec::new();
    let mut current: Vec<LocalIov> = Vec::new();
    let mut current_bytes = 0usize;

    let mut flush =
        |current: &mut Vec<LocalIov>, current_bytes: &mut usize, chunks: &mut Vec<Vec<LocalIov>>| {
            if !current.is_empty() {
                chunks.push(std::mem::take(current));
                *current_bytes = 0;
            }
        };

    for entry in iov {
        let mut addr = entry.addr;
        let mut remaining = entry.len;

        while remaining > 0 {
            let room = MAX_RDMA_CHUNK_BYTES - current_bytes;
            if room == 0 || current.len() == MAX_RDMA_SEGMENTS {
                flush(&mut current, &mut current_bytes, &mut chunks);
                continue;
            }

            let take = remaining.min(room);
            current.push(LocalIov { addr, len: take });
            current_bytes += take;
            addr += take;
            remaining -= take;
        }
    }

    flush(&mut current, &mut current_bytes, &mut chunks);

    if chunks.is_empty() {
        chunks.push(Vec::new());
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_iov_respects_segment_cap() {
        let iov: Vec<LocalIov> = (0..600)
            .map(|index| LocalIov {
                addr: index * 64,
                len: 64,
            })
            .collect();

        let chunks = chunk_iov(&iov);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_RDMA_SEGMENTS);
        assert_eq!(chunks[1].len(), MAX_RDMA_SEGMENTS);
        assert_eq!(chunks[2].len(), 600 - 2 * MAX_RDMA_SEGMENTS);

        let total: usize = chunks.iter().flatten().map(|entry| entry.len).sum();
        assert_eq!(total, 600 * 64);
    }

    #[test]
    fn test_chunk_iov_splits_large_entry() {
        let iov = [LocalIov {
            addr: 0x1000,
            len: MAX_RDMA_CHUNK_BYTES + 100,
        }];

        let chunks = chunk_iov(&iov);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0][0].len, MAX_RDMA_CHUNK_BYTES);
        assert_eq!(chunks[1][0].addr, 0x1000 + MAX_RDMA_CHUNK_BYTES);
        assert_eq!(chunks[1][0].len, 100);
    }

    #[test]
    fn test_chunk_iov_empty() {
        let chunks = chunk_iov(&[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }
}
