//! In-flight request message handed to handlers, plus the per-connection
//! client handle it carries.

use crate::proto::{
    AddRequest, BindRequest, CompareRequest, Control, DelRequest, ExtendedRequest, LdapMessage,
    ModifyDNRequest, ModifyRequest, OpKind, ProtocolOp, SearchRequest,
};
use crate::registry::OperationRegistry;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// One parsed request, registered for the duration of its handler.
///
/// `done()` is the abort signal: it fires when the client abandons or
/// cancels the operation, or when the connection is shutting down.
/// Handlers that may run long must observe it; the engine never
/// terminates handler code externally.
pub struct Message {
    message_id: i32,
    protocol_op: ProtocolOp,
    controls: Option<Vec<Control>>,
    done: CancellationToken,
    client: Client,
}

impl Message {
    pub(crate) fn new(msg: LdapMessage, client: Client) -> Self {
        Self {
            message_id: msg.message_id,
            protocol_op: msg.protocol_op,
            controls: msg.controls,
            done: CancellationToken::new(),
            client,
        }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn protocol_op(&self) -> &ProtocolOp {
        &self.protocol_op
    }

    /// Request type name, e.g. "SearchRequest".
    pub fn protocol_op_name(&self) -> &'static str {
        self.protocol_op.name()
    }

    pub fn kind(&self) -> OpKind {
        self.protocol_op.kind()
    }

    pub fn controls(&self) -> Option<&[Control]> {
        self.controls.as_deref()
    }

    /// The abort signal. Observe with `done().cancelled().await` inside a
    /// select, or poll `done().is_cancelled()`.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Signal the abort edge. Idempotent; a second call is a no-op.
    pub fn abandon(&self) {
        self.done.cancel();
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn get_bind_request(&self) -> Option<&BindRequest> {
        match &self.protocol_op {
            ProtocolOp::BindRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_search_request(&self) -> Option<&SearchRequest> {
        match &self.protocol_op {
            ProtocolOp::SearchRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_modify_request(&self) -> Option<&ModifyRequest> {
        match &self.protocol_op {
            ProtocolOp::ModifyRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_add_request(&self) -> Option<&AddRequest> {
        match &self.protocol_op {
            ProtocolOp::AddRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_delete_request(&self) -> Option<&DelRequest> {
        match &self.protocol_op {
            ProtocolOp::DelRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_modify_dn_request(&self) -> Option<&ModifyDNRequest> {
        match &self.protocol_op {
            ProtocolOp::ModifyDNRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_compare_request(&self) -> Option<&CompareRequest> {
        match &self.protocol_op {
            ProtocolOp::CompareRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_extended_request(&self) -> Option<&ExtendedRequest> {
        match &self.protocol_op {
            ProtocolOp::ExtendedRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_abandon_request(&self) -> Option<i32> {
        match self.protocol_op {
            ProtocolOp::AbandonRequest(id) => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_id", &self.message_id)
            .field("protocol_op", &self.protocol_op.name())
            .finish()
    }
}

type UserData = Arc<dyn Any + Send + Sync>;

/// Handle to connection-scoped state, carried on every [`Message`].
#[derive(Clone)]
pub struct Client {
    id: u64,
    peer_addr: SocketAddr,
    registry: Arc<OperationRegistry>,
    data: Arc<Mutex<Option<UserData>>>,
}

impl Client {
    pub(crate) fn new(id: u64, peer_addr: SocketAddr, registry: Arc<OperationRegistry>) -> Self {
        Self {
            id,
            peer_addr,
            registry,
            data: Arc::new(Mutex::new(None)),
        }
    }

    /// Connection number assigned by the server, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Attach opaque application state to this connection. Replaces any
    /// previously attached value.
    pub fn set_data<T: Any + Send + Sync>(&self, value: T) {
        let mut slot = self.data.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(value));
    }

    /// Fetch the attached state, if any of the requested type.
    pub fn get_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.data.lock().unwrap_or_else(|e| e.into_inner());
        slot.clone().and_then(|d| d.downcast::<T>().ok())
    }

    /// Look up an in-flight operation on this connection by message id.
    /// Takes the registry lock.
    pub fn get_message_by_id(&self, message_id: i32) -> Option<Arc<Message>> {
        self.registry.get(message_id)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
