//! The server: owns the fabric domain and connection, the object container,
//! the client registry and the TCP auth listener, registers one hook per
//! request type and runs the poll loop.

pub mod config;
pub mod hooks;
pub mod stats;

pub use config::ServerConfig;
pub use stats::ServerStats;

use crate::backend::{
    BalanceBackend, CacheBackend, MallocBackend, MemoryBackend, NvdimmBackend, StorageBackend,
};
use crate::container::Container;
use crate::debug;
use crate::logging::{self, Logger};
use crate::net::connection::FabricConnection;
use crate::net::domain::FabricDomain;
use crate::net::proto::MessageType;
use crate::net::registry::ClientRegistry;
use crate::net::support::NetworkResult;
use crate::net::tcp::TcpAuthServer;
use crate::server::hooks::{
    ObjectCowHook, ObjectCreateHook, ObjectFlushHook, ObjectReadHook, ObjectWriteHook,
    PingPongHook, RangeRegisterHook, RangeUnregisterHook,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Default segment alignment of the container.
const DEFAULT_ALIGNMENT: u64 = 8 * 1024 * 1024;
/// Pre-posted receive buffers: count and size.
const RECV_BUFFER_SIZE: usize = 1024 * 1024;
const RECV_BUFFER_COUNT: usize = 128;
/// Width of the port range scanned for the TCP auth listener.
const TCP_PORT_RANGE: u16 = 64;

pub struct Server {
    domain: Arc<FabricDomain>,
    connection: FabricConnection,
    container: Arc<Mutex<Container>>,
    stats: Arc<ServerStats>,
    registry: Arc<ClientRegistry>,
    tcp_server: Option<TcpAuthServer>,
    poll_running: Arc<AtomicBool>,
    stats_running: Arc<AtomicBool>,
    stats_thread: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl Server {
    /// Build the server: bind the fabric listener on `port` (zero picks an
    /// ephemeral port), the TCP auth listener right above it, wire the
    /// memory backends described by the config and register the hooks.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: &ServerConfig,
        port: u16,
        storage: Arc<dyn StorageBackend>,
        log: L,
    ) -> NetworkResult<Server> {
        let log = logging::child(log);

        let domain = Arc::new(FabricDomain::new(
            &config.listen_ip,
            port,
            true,
            Some(&log),
        ));

        let mut connection = FabricConnection::new(domain.clone(), !config.active_polling, Some(&log))?;
        connection.post_receives(RECV_BUFFER_SIZE, RECV_BUFFER_COUNT);
        if config.client_auth {
            connection.set_check_client_auth(true);
        }

        let registry = connection.client_registry();

        // The memory backend stack: plain malloc behind a cache, or a
        // balance tree of cached nvdimm backends when mounts are given.
        let memory: Arc<dyn MemoryBackend> = if config.nvdimm_mount_paths.is_empty() {
            Arc::new(CacheBackend::new(
                Box::new(MallocBackend::new(Some(domain.clone()))),
                Some(&log),
            ))
        } else {
            let mut balance = BalanceBackend::new();
            for path in &config.nvdimm_mount_paths {
                let nvdimm = NvdimmBackend::new(Some(domain.clone()), path.as_str(), Some(&log));
                balance.register_backend(Box::new(CacheBackend::new(
                    Box::new(nvdimm),
                    Some(&log),
                )));
            }
            Arc::new(balance)
        };

        let container = Arc::new(Mutex::new(Container::new(
            storage,
            memory,
            DEFAULT_ALIGNMENT,
        )));
        let stats = Arc::new(ServerStats::new());

        // TCP auth listener right above the fabric port.
        let fabric_port = connection
            .listen_port()
            .expect("Server connection has no listener");
        let tcp_server = {
            let registry = registry.clone();
            let container = container.clone();
            let connect_registry = registry.clone();
            TcpAuthServer::new(
                fabric_port + 1,
                fabric_port + TCP_PORT_RANGE,
                config.client_auth,
                Box::new(move |id, key| connect_registry.register_client(id, key)),
                Box::new(move |id| {
                    registry.disconnect_client(id);
                    container
                        .lock()
                        .expect("Container lock poisoned")
                        .on_client_disconnect(id);
                }),
                Some(&log),
            )
            .map_err(crate::net::support::NetworkError::from)?
        };

        logging::info!(log, "server listening";
                       "fabric_port" => fabric_port, "tcp_port" => tcp_server.port());

        // One hook per request type.
        connection.register_hook(
            MessageType::Ping,
            Box::new(PingPongHook::new(domain.clone())),
        );
        connection.register_hook(
            MessageType::ObjFlush,
            Box::new(ObjectFlushHook::new(container.clone())),
        );
        connection.register_hook(
            MessageType::ObjRangeRegister,
            Box::new(RangeRegisterHook::new(
                container.clone(),
                config.consistency_check,
            )),
        );
        connection.register_hook(
            MessageType::ObjRangeUnregister,
            Box::new(RangeUnregisterHook::new(
                container.clone(),
                config.consistency_check,
            )),
        );
        connection.register_hook(
            MessageType::ObjCreate,
            Box::new(ObjectCreateHook::new(container.clone())),
        );
        connection.register_hook(
            MessageType::ObjRead,
            Box::new(ObjectReadHook::new(container.clone(), stats.clone())),
        );
        connection.register_hook(
            MessageType::ObjWrite,
            Box::new(ObjectWriteHook::new(container.clone(), stats.clone())),
        );
        connection.register_hook(
            MessageType::ObjCow,
            Box::new(ObjectCowHook::new(container.clone())),
        );

        let connect_log = log.clone();
        connection.set_on_endpoint_connect(Box::new(move |lf_client_id| {
            logging::info!(connect_log, "fabric client connected"; "lf_client_id" => lf_client_id);
        }));

        Ok(Server {
            domain,
            connection,
            container,
            stats,
            registry,
            tcp_server: Some(tcp_server),
            poll_running: Arc::new(AtomicBool::new(false)),
            stats_running: Arc::new(AtomicBool::new(false)),
            stats_thread: None,
            log,
        })
    }

    /// Fabric listen port.
    pub fn fabric_port(&self) -> u16 {
        self.connection
            .listen_port()
            .expect("Server connection has no listener")
    }

    /// TCP auth listener port.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_server
            .as_ref()
            .expect("TCP server already stopped")
            .port()
    }

    #[inline]
    pub fn container(&self) -> Arc<Mutex<Container>> {
        self.container.clone()
    }

    #[inline]
    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    #[inline]
    pub fn domain(&self) -> Arc<FabricDomain> {
        self.domain.clone()
    }

    #[inline]
    pub fn client_registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// A flag observers can clear to stop the poll loop.
    pub fn poll_running_flag(&self) -> Arc<AtomicBool> {
        self.poll_running.clone()
    }

    /// Run the network loop until `stop` is called. Fatal errors broadcast
    /// to every connected client before the process dies.
    pub fn poll(&mut self) {
        self.poll_running.store(true, Ordering::SeqCst);

        // Fatal paths all run on this thread, where the connection lives.
        let connection_addr = &mut self.connection as *mut FabricConnection as usize;
        debug::set_pre_abort_hook(Box::new(move |message| {
            let connection = unsafe { &mut *(connection_addr as *mut FabricConnection) };
            connection.broadcast_error_message(message);
        }));

        while self.poll_running.load(Ordering::SeqCst) {
            self.connection.poll(false);
        }

        debug::clear_pre_abort_hook();

        // Drain whatever is still in flight before returning.
        self.connection.poll_all_pending_actions();
    }

    /// Ask the poll loop to exit and tear the helper threads down.
    pub fn stop(&mut self) {
        self.poll_running.store(false, Ordering::SeqCst);

        if self.stats_running.swap(false, Ordering::SeqCst) {
            if let Some(thread) = self.stats_thread.take() {
                let _ = thread.join();
            }
        }

        if let Some(mut tcp_server) = self.tcp_server.take() {
            tcp_server.stop();
        }
    }

    /// Start the statistics thread printing the per second bandwidths. It
    /// runs until `stop`.
    pub fn start_stats_thread(&mut self) {
        if self.stats_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let stats = self.stats.clone();
        let running = self.stats_running.clone();
        let log = self.log.clone();

        self.stats_thread = Some(
            thread::Builder::new()
                .name("ioc-stats".to_string())
                .spawn(move || {
                    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
                    while running.load(Ordering::SeqCst) {
                        for _ in 0..10 {
                            if !running.load(Ordering::SeqCst) {
                                return;
                            }
                            thread::sleep(Duration::from_millis(100));
                        }

                        let read = stats.take_read() as f64 / GIB;
                        let write = stats.take_write() as f64 / GIB;
                        logging::info!(log, "bandwidth";
                                       "read_gib_per_sec" => read,
                                       "write_gib_per_sec" => write);
                    }
                })
                .expect("Failed to spawn the stats thread"),
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
