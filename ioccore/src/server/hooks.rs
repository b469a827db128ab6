//! The request hooks wired on the server connection, one per message type.
//! Hooks never raise across the network boundary: recoverable failures map
//! to a negative response status, protocol violations are fatal.

use crate::container::{build_iov, copy_into_segments, AccessMode, Container};
use crate::container::ConsistencyAccessMode;
use crate::debug;
use crate::net::connection::FabricConnection;
use crate::net::domain::{FabricDomain, MemoryRegion};
use crate::net::hook::{ActionResult, ClientRequest, Hook, PostAction};
use crate::net::proto::{
    MessageType, ObjCreate, ObjFlush, ObjReadWrite, ObjectCow, Ping, RegisterRange, Response,
    UnregisterRange, EAGER_MAX_READ,
};
use crate::net::serial::WireMessage;
use crate::server::stats::ServerStats;
use std::sync::{Arc, Mutex};

fn unpack_or_die<'a, T: WireMessage<'a> + Default>(request: &'a ClientRequest) -> T {
    match request.unpack::<T>() {
        Ok(message) => message,
        Err(error) => debug::fatal(&format!(
            "Request payload deserialization failed: {:?}",
            error
        )),
    }
}

fn respond_status(
    connection: &mut FabricConnection,
    message_type: MessageType,
    destination: u64,
    status: i32,
) {
    let mut response = Response::status_only(status);
    let _ = connection.send_response(message_type, destination, &mut response, false);
}

/// Ping-pong: fetch the requested bytes from the client buffer via RDMA and
/// answer with a pong. A zero RDMA size degenerates to a pure round trip.
pub struct PingPongHook {
    domain: Arc<FabricDomain>,
    rma_buffer: Vec<u8>,
    registered: Option<MemoryRegion>,
}

impl PingPongHook {
    pub fn new(domain: Arc<FabricDomain>) -> PingPongHook {
        PingPongHook {
            domain,
            rma_buffer: Vec::new(),
            registered: None,
        }
    }
}

impl Hook for PingPongHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let ping: Ping = unpack_or_die(&request);
        let destination = request.lf_client_id;
        let rdma_size = ping.rdma_size as usize;
        let rdma_iov = ping.rdma_iov;

        if rdma_size == 0 {
            respond_status(connection, MessageType::Pong, destination, 0);
            request.terminate(connection);
            return ActionResult::KeepWaiting;
        }

        // Size the local staging buffer to the request.
        if rdma_size > self.rma_buffer.len() {
            if let Some(region) = self.registered.take() {
                self.domain
                    .unregister_segment(region.addr as *mut u8, region.size);
            }
            self.rma_buffer = vec![0u8; rdma_size];
            self.registered = Some(self.domain.register_segment(
                self.rma_buffer.as_mut_ptr(),
                self.rma_buffer.len(),
                true,
                true,
                false,
            ));
        }

        let result = connection.rdma_read(
            destination,
            self.rma_buffer.as_mut_ptr(),
            rdma_size,
            rdma_iov.addr,
            rdma_iov.key,
            PostAction::new(move |conn: &mut FabricConnection| {
                respond_status(conn, MessageType::Pong, destination, 0);
                ActionResult::KeepWaiting
            })
            .with_request(request),
        );
        let _ = result;

        ActionResult::KeepWaiting
    }
}

/// Object creation.
pub struct ObjectCreateHook {
    container: Arc<Mutex<Container>>,
}

impl ObjectCreateHook {
    pub fn new(container: Arc<Mutex<Container>>) -> ObjectCreateHook {
        ObjectCreateHook { container }
    }
}

impl Hook for ObjectCreateHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let message: ObjCreate = unpack_or_die(&request);
        let destination = request.lf_client_id;

        let status = {
            let mut container = self.container.lock().expect("Container lock poisoned");
            match container.get_object(message.object_id).create() {
                Ok(()) => 0,
                Err(_) => -1,
            }
        };

        respond_status(connection, MessageType::ObjCreateAck, destination, status);
        request.terminate(connection);
        ActionResult::KeepWaiting
    }
}

/// Flush a range of an object back to storage.
pub struct ObjectFlushHook {
    container: Arc<Mutex<Container>>,
}

impl ObjectFlushHook {
    pub fn new(container: Arc<Mutex<Container>>) -> ObjectFlushHook {
        ObjectFlushHook { container }
    }
}

impl Hook for ObjectFlushHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let message: ObjFlush = unpack_or_die(&request);
        let destination = request.lf_client_id;

        let status = {
            let mut container = self.container.lock().expect("Container lock poisoned");
            container
                .get_object(message.object_id)
                .flush(message.offset, message.size)
        };

        respond_status(connection, MessageType::ObjFlushAck, destination, status);
        request.terminate(connection);
        ActionResult::KeepWaiting
    }
}

/// Register a mapping range on the consistency tracker. The answer carries
/// the assigned range id, or -1 on collision. With the consistency check
/// disabled every registration succeeds with id zero.
pub struct RangeRegisterHook {
    container: Arc<Mutex<Container>>,
    consistency_check: bool,
}

impl RangeRegisterHook {
    pub fn new(container: Arc<Mutex<Container>>, consistency_check: bool) -> RangeRegisterHook {
        RangeRegisterHook {
            container,
            consistency_check,
        }
    }
}

impl Hook for RangeRegisterHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let message: RegisterRange = unpack_or_die(&request);
        let destination = request.lf_client_id;
        let tcp_client_id = request.header.tcp_client_id;

        let status = if self.consistency_check {
            let mode = if message.write {
                ConsistencyAccessMode::Write
            } else {
                ConsistencyAccessMode::Read
            };
            let mut container = self.container.lock().expect("Container lock poisoned");
            container
                .get_object(message.object_id)
                .consistency_tracker()
                .register_range(tcp_client_id, message.offset, message.size, mode)
        } else {
            0
        };

        respond_status(
            connection,
            MessageType::ObjRangeRegisterAck,
            destination,
            status,
        );
        request.terminate(connection);
        ActionResult::KeepWaiting
    }
}

/// Remove a mapping range; the five identifying fields must match.
pub struct RangeUnregisterHook {
    container: Arc<Mutex<Container>>,
    consistency_check: bool,
}

impl RangeUnregisterHook {
    pub fn new(container: Arc<Mutex<Container>>, consistency_check: bool) -> RangeUnregisterHook {
        RangeUnregisterHook {
            container,
            consistency_check,
        }
    }
}

impl Hook for RangeUnregisterHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let message: UnregisterRange = unpack_or_die(&request);
        let destination = request.lf_client_id;
        let tcp_client_id = request.header.tcp_client_id;

        let status = if self.consistency_check {
            let mode = if message.write {
                ConsistencyAccessMode::Write
            } else {
                ConsistencyAccessMode::Read
            };
            let mut container = self.container.lock().expect("Container lock poisoned");
            let removed = container
                .get_object(message.object_id)
                .consistency_tracker()
                .unregister_range(
                    tcp_client_id,
                    message.id,
                    message.offset,
                    message.size,
                    mode,
                );
            if removed {
                0
            } else {
                -1
            }
        } else {
            0
        };

        respond_status(
            connection,
            MessageType::ObjRangeUnregisterAck,
            destination,
            status,
        );
        request.terminate(connection);
        ActionResult::KeepWaiting
    }
}

/// Copy on write, full object when the range size is zero.
pub struct ObjectCowHook {
    container: Arc<Mutex<Container>>,
}

impl ObjectCowHook {
    pub fn new(container: Arc<Mutex<Container>>) -> ObjectCowHook {
        ObjectCowHook { container }
    }
}

impl Hook for ObjectCowHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let message: ObjectCow = unpack_or_die(&request);
        let destination = request.lf_client_id;

        let result = {
            let mut container = self.container.lock().expect("Container lock poisoned");
            if message.range_size == 0 {
                container.make_object_full_cow(
                    message.source_object_id,
                    message.dest_object_id,
                    message.allow_exist,
                )
            } else {
                container.make_object_range_cow(
                    message.source_object_id,
                    message.dest_object_id,
                    message.range_offset,
                    message.range_size,
                )
            }
        };

        let status = match result {
            Ok(true) => 0,
            _ => -1,
        };

        respond_status(connection, MessageType::ObjCowAck, destination, status);
        request.terminate(connection);
        ActionResult::KeepWaiting
    }
}

/// Object read: eager payloads ride inline after the response, larger ones
/// are pushed to the client buffer with a vectored one sided write.
pub struct ObjectReadHook {
    container: Arc<Mutex<Container>>,
    stats: Arc<ServerStats>,
}

impl ObjectReadHook {
    pub fn new(container: Arc<Mutex<Container>>, stats: Arc<ServerStats>) -> ObjectReadHook {
        ObjectReadHook { container, stats }
    }
}

impl Hook for ObjectReadHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let message: ObjReadWrite = unpack_or_die(&request);
        let destination = request.lf_client_id;
        let object_id = message.object_id;
        let offset = message.offset;
        let size = message.size;
        let client_iov = message.iov;

        let container = self.container.clone();
        let mut guard = container.lock().expect("Container lock poisoned");
        let descrs = match guard
            .get_object(object_id)
            .get_buffers(offset, size, AccessMode::Read, true, false)
        {
            Ok(descrs) => descrs,
            Err(_) => {
                drop(guard);
                respond_status(connection, MessageType::ObjReadWriteAck, destination, -1);
                request.terminate(connection);
                return ActionResult::KeepWaiting;
            }
        };

        let iov = build_iov(&descrs, offset, size);

        if size as usize <= EAGER_MAX_READ {
            let fragments: Vec<&[u8]> = iov
                .iter()
                .map(|entry| unsafe {
                    std::slice::from_raw_parts(entry.addr as *const u8, entry.len)
                })
                .collect();

            let mut response = Response::with_fragments(0, &fragments);
            let _ = connection.send_response(
                MessageType::ObjReadWriteAck,
                destination,
                &mut response,
                false,
            );
            drop(guard);

            self.stats.add_read(size);
            request.terminate(connection);
            return ActionResult::KeepWaiting;
        }

        drop(guard);

        let stats = self.stats.clone();
        let result = connection.rdma_writev(
            destination,
            &iov,
            client_iov.addr,
            client_iov.key,
            PostAction::new(move |conn: &mut FabricConnection| {
                respond_status(conn, MessageType::ObjReadWriteAck, destination, 0);
                stats.add_read(size);
                ActionResult::KeepWaiting
            })
            .with_request(request),
        );
        let _ = result;

        ActionResult::KeepWaiting
    }
}

/// Object write: eager payloads are copied straight into the segments, the
/// rest is pulled from the client buffer with a vectored one sided read.
/// Segments entirely covered by the write skip the storage load.
pub struct ObjectWriteHook {
    container: Arc<Mutex<Container>>,
    stats: Arc<ServerStats>,
}

impl ObjectWriteHook {
    pub fn new(container: Arc<Mutex<Container>>, stats: Arc<ServerStats>) -> ObjectWriteHook {
        ObjectWriteHook { container, stats }
    }
}

impl Hook for ObjectWriteHook {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        let message: ObjReadWrite = unpack_or_die(&request);
        let destination = request.lf_client_id;
        let object_id = message.object_id;
        let offset = message.offset;
        let size = message.size;
        let client_iov = message.iov;
        let has_data = message.msg_has_data;

        let container = self.container.clone();

        if has_data {
            let data = message.data.expect("Eager write without data run");

            let status = {
                let mut guard = container.lock().expect("Container lock poisoned");
                let object = guard.get_object(object_id);
                let load = write_needs_load(object.alignment(), offset, size);

                match object.get_buffers(offset, size, AccessMode::Write, load, true) {
                    Ok(descrs) => {
                        copy_into_segments(&descrs, offset, data);
                        object.mark_dirty(offset, size);
                        0
                    }
                    Err(_) => -1,
                }
            };

            if status == 0 {
                self.stats.add_write(size);
            }
            respond_status(connection, MessageType::ObjReadWriteAck, destination, status);
            request.terminate(connection);
            return ActionResult::KeepWaiting;
        }

        let iov = {
            let mut guard = container.lock().expect("Container lock poisoned");
            let object = guard.get_object(object_id);
            let load = write_needs_load(object.alignment(), offset, size);

            match object.get_buffers(offset, size, AccessMode::Write, load, true) {
                Ok(descrs) => build_iov(&descrs, offset, size),
                Err(_) => {
                    drop(guard);
                    respond_status(connection, MessageType::ObjReadWriteAck, destination, -1);
                    request.terminate(connection);
                    return ActionResult::KeepWaiting;
                }
            }
        };

        let stats = self.stats.clone();
        let result = connection.rdma_readv(
            destination,
            &iov,
            client_iov.addr,
            client_iov.key,
            PostAction::new(move |conn: &mut FabricConnection| {
                {
                    let mut guard = container.lock().expect("Container lock poisoned");
                    guard.get_object(object_id).mark_dirty(offset, size);
                }
                respond_status(conn, MessageType::ObjReadWriteAck, destination, 0);
                stats.add_write(size);
                ActionResult::KeepWaiting
            })
            .with_request(request),
        );
        let _ = result;

        ActionResult::KeepWaiting
    }
}

/// A write needs the old storage content only when its bounds do not sit on
/// the segment alignment: freshly faulted segments then carry bytes around
/// the written span which must come from storage, not read as zeroes.
fn write_needs_load(alignment: u64, offset: u64, size: u64) -> bool {
    match alignment {
        0 => false,
        alignment => offset % alignment != 0 || size % alignment != 0,
    }
}
