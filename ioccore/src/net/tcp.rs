//! TCP side channel used for client authentication. Each incoming
//! connection receives a one shot handshake carrying the protocol version,
//! a fresh client id and a random key. While the socket stays open the
//! client is considered alive; closing it sweeps the client's state.

use crate::logging::{self, Logger};
use crate::net::proto::PROTOCOL_VERSION;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use rand::rngs::OsRng;
use rand::Rng;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Byte exact handshake sent to every accepted client.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TcpHandshake {
    pub protocol_version: i16,
    pub client_id: u64,
    pub key: u64,
    pub keep_alive: bool,
}

impl TcpHandshake {
    pub const SIZE: usize = 19;

    fn write(&self, buffer: &mut [u8; Self::SIZE]) {
        LittleEndian::write_i16(&mut buffer[0..2], self.protocol_version);
        LittleEndian::write_u64(&mut buffer[2..10], self.client_id);
        LittleEndian::write_u64(&mut buffer[10..18], self.key);
        buffer[18] = self.keep_alive as u8;
    }
}

pub type ConnectHandler = Box<dyn Fn(u64, u64) + Send>;
pub type DisconnectHandler = Box<dyn Fn(u64) + Send>;

const LISTENER: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The authentication listener. Runs its own OS thread; handlers are called
/// from that thread, with a fresh `(id, key)` pair on connect and the id on
/// disconnect.
pub struct TcpAuthServer {
    port: u16,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TcpAuthServer {
    /// Bind the first free port in `[port, max_port]` and start serving.
    /// With `keep_alive` the sockets stay open so disconnections can be
    /// observed; without it the handshake is one shot.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        port: u16,
        max_port: u16,
        keep_alive: bool,
        on_connect: ConnectHandler,
        on_disconnect: DisconnectHandler,
        log: L,
    ) -> io::Result<TcpAuthServer> {
        let log = logging::child(log);
        let (listener, bound_port) = Self::bind_in_range(port, max_port)?;
        let running = Arc::new(AtomicBool::new(true));

        logging::debug!(log, "auth listener bound"; "port" => bound_port);

        let thread_running = running.clone();
        let thread = thread::Builder::new()
            .name("ioc-tcp-auth".to_string())
            .spawn(move || {
                server_loop(
                    listener,
                    keep_alive,
                    on_connect,
                    on_disconnect,
                    thread_running,
                    log,
                )
            })?;

        Ok(TcpAuthServer {
            port: bound_port,
            running,
            thread: Some(thread),
        })
    }

    /// Port the listener is bound to.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Ask the serving thread to exit and join it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn bind_in_range(port: u16, max_port: u16) -> io::Result<(TcpListener, u16)> {
        let mut last_error = io::Error::new(io::ErrorKind::AddrInUse, "Empty port range");

        for candidate in port..=max_port {
            let addr: SocketAddr = ([0, 0, 0, 0], candidate).into();
            match TcpListener::bind(addr) {
                Ok(listener) => {
                    let bound = listener.local_addr()?.port();
                    return Ok((listener, bound));
                }
                Err(error) => last_error = error,
            }
        }

        Err(last_error)
    }
}

impl Drop for TcpAuthServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TrackedClient {
    stream: TcpStream,
    client_id: u64,
}

fn server_loop(
    mut listener: TcpListener,
    keep_alive: bool,
    on_connect: ConnectHandler,
    on_disconnect: DisconnectHandler,
    running: Arc<AtomicBool>,
    log: Logger,
) {
    let mut poll = Poll::new().expect("Auth poll creation failed");
    let mut events = Events::with_capacity(256);
    let mut clients: Vec<Option<TrackedClient>> = Vec::new();
    let mut next_client_id = 0u64;

    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)
        .expect("Auth listener registration failed");

    while running.load(Ordering::SeqCst) {
        match poll.poll(&mut events, Some(POLL_INTERVAL)) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                logging::error!(log, "auth poll failure"; "error" => %error);
                return;
            }
        }

        let mut ready: Vec<Token> = Vec::new();
        for event in events.iter() {
            ready.push(event.token());
        }

        for token in ready {
            if token == LISTENER {
                accept_clients(
                    &listener,
                    &poll,
                    keep_alive,
                    &on_connect,
                    &mut clients,
                    &mut next_client_id,
                    &log,
                );
            } else {
                let slot = token.0 - 1;
                if check_disconnected(&mut clients[slot]) {
                    if let Some(client) = clients[slot].take() {
                        logging::debug!(log, "tcp client disconnected";
                                        "client_id" => client.client_id);
                        on_disconnect(client.client_id);
                    }
                }
            }
        }
    }
}

fn accept_clients(
    listener: &TcpListener,
    poll: &Poll,
    keep_alive: bool,
    on_connect: &ConnectHandler,
    clients: &mut Vec<Option<TrackedClient>>,
    next_client_id: &mut u64,
    log: &Logger,
) {
    loop {
        let (mut stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
            Err(error) => {
                logging::error!(log, "auth accept failure"; "error" => %error);
                return;
            }
        };

        let client_id = *next_client_id;
        *next_client_id += 1;
        let key: u64 = OsRng.gen();

        on_connect(client_id, key);

        logging::debug!(log, "tcp client connected";
                        "client_id" => client_id, "peer" => %addr);

        let handshake = TcpHandshake {
            protocol_version: PROTOCOL_VERSION as i16,
            client_id,
            key,
            keep_alive,
        };
        let mut bytes = [0u8; TcpHandshake::SIZE];
        handshake.write(&mut bytes);

        if !write_fully(&mut stream, &bytes) {
            logging::warn!(log, "client dropped during handshake"; "client_id" => client_id);
            continue;
        }

        if keep_alive {
            let slot = clients
                .iter()
                .position(|client| client.is_none())
                .unwrap_or_else(|| {
                    clients.push(None);
                    clients.len() - 1
                });

            poll.registry()
                .register(&mut stream, Token(slot + 1), Interest::READABLE)
                .expect("Auth stream registration failed");

            clients[slot] = Some(TrackedClient { stream, client_id });
        }
        // Without keep alive the socket closes here.
    }
}

/// Write a small buffer to a non blocking stream, retrying on WouldBlock.
fn write_fully(stream: &mut TcpStream, mut bytes: &[u8]) -> bool {
    let mut spins = 0;
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return false,
            Ok(count) => bytes = &bytes[count..],
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                spins += 1;
                if spins > 1000 {
                    return false;
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return false,
        }
    }
    true
}

/// Drain readable data; true once the peer closed or errored.
fn check_disconnected(slot: &mut Option<TrackedClient>) -> bool {
    let client = match slot {
        Some(client) => client,
        None => return false,
    };

    let mut scratch = [0u8; 4096];
    loop {
        match client.stream.read(&mut scratch) {
            Ok(0) => return true,
            // Clients are not expected to talk, drop whatever arrives.
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return true,
        }
    }
}

/// Client side: connect to the auth channel and read the handshake. The
/// returned stream must stay open as long as the client wants to talk to
/// the server.
pub fn connect_auth(ip: &str, port: u16) -> io::Result<(std::net::TcpStream, TcpHandshake)> {
    let stream = std::net::TcpStream::connect((ip, port))?;
    let mut reader = &stream;

    let protocol_version = reader.read_i16::<LittleEndian>()?;
    let client_id = reader.read_u64::<LittleEndian>()?;
    let key = reader.read_u64::<LittleEndian>()?;
    let keep_alive = reader.read_u8()? != 0;

    Ok((
        stream,
        TcpHandshake {
            protocol_version,
            client_id,
            key,
            keep_alive,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handshake_layout() {
        let handshake = TcpHandshake {
            protocol_version: 2,
            client_id: 7,
            key: 0x0102030405060708,
            keep_alive: true,
        };

        let mut bytes = [0u8; TcpHandshake::SIZE];
        handshake.write(&mut bytes);

        assert_eq!(&bytes[0..2], &[2, 0]);
        assert_eq!(&bytes[2..10], &7u64.to_le_bytes());
        assert_eq!(&bytes[10..18], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(bytes[18], 1);
    }

    #[test]
    fn test_connect_and_disconnect_sweep() {
        let connected: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let disconnected: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        let connected_ref = connected.clone();
        let disconnected_ref = disconnected.clone();

        let mut server = TcpAuthServer::new(
            0,
            0,
            true,
            Box::new(move |id, key| connected_ref.lock().unwrap().push((id, key))),
            Box::new(move |id| disconnected_ref.lock().unwrap().push(id)),
            None,
        )
        .unwrap();

        let (stream, handshake) = connect_auth("127.0.0.1", server.port()).unwrap();

        assert_eq!(handshake.protocol_version, PROTOCOL_VERSION as i16);
        assert_eq!(handshake.client_id, 0);
        assert!(handshake.keep_alive);

        // The connect handler saw the same id/key pair.
        let seen = connected.lock().unwrap().clone();
        assert_eq!(seen, vec![(handshake.client_id, handshake.key)]);

        // Dropping the socket triggers the disconnect sweep.
        drop(stream);
        for _ in 0..100 {
            if !disconnected.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(disconnected.lock().unwrap().clone(), vec![0]);

        server.stop();
    }

    #[test]
    fn test_second_client_gets_next_id() {
        let mut server = TcpAuthServer::new(
            0,
            0,
            false,
            Box::new(|_, _| {}),
            Box::new(|_| {}),
            None,
        )
        .unwrap();

        let (_stream_a, first) = connect_auth("127.0.0.1", server.port()).unwrap();
        let (_stream_b, second) = connect_auth("127.0.0.1", server.port()).unwrap();

        assert_eq!(first.client_id, 0);
        assert_eq!(second.client_id, 1);
        assert!(!first.keep_alive);
        assert_ne!(first.key, second.key);

        server.stop();
    }
}
