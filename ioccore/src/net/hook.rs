//! Message hooks and post actions. A hook is attached to one message type
//! and runs on the network thread when such a message arrives. A post action
//! is attached to an asynchronous network operation and owns the borrowed
//! network resources (receive buffer, pooled send buffer) until completion.

use crate::net::connection::FabricConnection;
use crate::net::proto::MessageHeader;
use crate::net::serial::{unpack_from, SerialResult, WireMessage};

/// Returned by hooks and post actions to drive `poll(wait)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ActionResult {
    /// The waiting poll loop keeps polling.
    KeepWaiting,
    /// The waiting poll loop returns after the callback exits.
    Unblock,
}

/// An incoming request: the client identification, the message header and
/// the receive buffer the payload lives in. The request owns the buffer, it
/// must be handed back exactly once through
/// [`FabricConnection::repost_receive`], either directly or by attaching the
/// request to a post action.
pub struct ClientRequest {
    pub lf_client_id: u64,
    pub msg_buffer_id: usize,
    pub header: MessageHeader,
    pub(crate) buffer: Box<[u8]>,
    pub(crate) payload_start: usize,
    pub(crate) payload_end: usize,
}

impl ClientRequest {
    /// Payload bytes following the message header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_start..self.payload_end]
    }

    /// Deserialize the payload. Slices returned through pointing fields
    /// borrow the receive buffer and die with this request.
    #[inline]
    pub fn unpack<'a, T: WireMessage<'a> + Default>(&'a self) -> SerialResult<T> {
        let (message, _) = unpack_from::<T>(self.payload())?;
        Ok(message)
    }

    /// Finish the request and repost its receive buffer.
    #[inline]
    pub fn terminate(self, connection: &mut FabricConnection) {
        connection.repost_receive(self);
    }
}

/// Hook called when a message of the registered type arrives. Hooks travel
/// with the connection across threads, hence the `Send` bound.
pub trait Hook: Send {
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult;
}

impl<F> Hook for F
where
    F: FnMut(&mut FabricConnection, ClientRequest) -> ActionResult + Send,
{
    fn on_message(
        &mut self,
        connection: &mut FabricConnection,
        request: ClientRequest,
    ) -> ActionResult {
        self(connection, request)
    }
}

type PostActionFn = Box<dyn FnOnce(&mut FabricConnection) -> ActionResult + Send>;

/// Action attached to an asynchronous network operation. When the operation
/// completes the function runs first, then every attached resource is
/// released: the receive buffer is reposted and the pooled send buffer is
/// returned to the domain. Release happens on every completion path.
pub struct PostAction {
    pub(crate) func: Option<PostActionFn>,
    pub(crate) request: Option<ClientRequest>,
}

impl PostAction {
    /// Action that only releases its attachments.
    #[inline]
    pub fn nop() -> PostAction {
        PostAction {
            func: None,
            request: None,
        }
    }

    /// Action running the given function on completion.
    #[inline]
    pub fn new<F>(func: F) -> PostAction
    where
        F: FnOnce(&mut FabricConnection) -> ActionResult + Send + 'static,
    {
        PostAction {
            func: Some(Box::new(func)),
            request: None,
        }
    }

    /// Action that unblocks a waiting poll on completion.
    #[inline]
    pub fn unblock() -> PostAction {
        PostAction::new(|_| ActionResult::Unblock)
    }

    /// Attach a request whose receive buffer is reposted on completion.
    #[inline]
    pub fn with_request(mut self, request: ClientRequest) -> PostAction {
        self.request = Some(request);
        self
    }
}
