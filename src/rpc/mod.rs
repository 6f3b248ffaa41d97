//! JSON-RPC engine: identity, pending calls correlation and middleware dispatch.

pub mod config;
pub mod middleware;
mod pending;

use std::fmt::{self, Debug, Formatter};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::common::{Address, Contact, Id, RoutingTable, Storage, StorageError};
use crate::messenger::{Inbound, Message, Messenger, Outbound};
use crate::transport::Transport;

use middleware::Stacks;
use pending::PendingCalls;

pub use config::Config;
pub use middleware::{
    Context, ErrorMiddleware, Middleware, Reply, Request, Response, DEFAULT_ERROR_CODE,
    INTERNAL_ERROR_CODE, METHOD_NOT_FOUND_CODE, WILDCARD,
};

/// Upper bound of packets handled in a single [Rpc::tick].
const MAX_PACKETS_PER_TICK: usize = 32;

/// Handler of a standalone [Rpc], called with the outcome of a call.
pub type Callback = Box<dyn FnOnce(Result<Value, RpcError>) + Send>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Outcome of a failed call, or the error a middleware halts a request with.
pub enum RpcError {
    #[error("Timed out waiting for response")]
    /// The target did not answer in time, and was removed from the routing table.
    Timeout,

    #[error("{message}")]
    /// The target answered with a JSON-RPC error.
    Remote { message: String, code: i64 },

    #[error("{0}")]
    /// Request parameters failed validation.
    InvalidParams(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RpcError {
    /// JSON-RPC error code to reply with.
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Remote { code, .. } => *code,
            _ => INTERNAL_ERROR_CODE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout)
    }
}

/// What happened during one [Rpc::tick].
pub struct RpcTickReport<H> {
    /// Every node that sent us a message, in order of arrival.
    pub senders: Vec<Contact>,
    /// Handlers of calls that got a response or timed out, with their outcome.
    pub resolved: Vec<(H, Result<Value, RpcError>)>,
}

impl<H> Default for RpcTickReport<H> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            resolved: Vec::new(),
        }
    }
}

impl<H> Debug for RpcTickReport<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTickReport")
            .field("senders", &self.senders)
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

/// Generic RPC node.
///
/// Sends requests and correlates their responses by id, dispatches incoming
/// requests through the registered middlewares, and evicts contacts that time out.
/// `H` is the type of handlers attached to outgoing calls, resolved handlers
/// are handed back through [RpcTickReport] for the owner to run.
pub struct Rpc<H = Callback> {
    contact: Contact,
    routing_table: RoutingTable,
    messenger: Messenger,
    transport: Box<dyn Transport>,
    storage: Box<dyn Storage>,

    pending: PendingCalls<H>,
    stacks: Stacks,

    /// Insert every sender straight into the routing table.
    admit_senders: bool,
    listening: bool,
    last_sweep: Instant,
}

impl<H> Rpc<H> {
    pub fn new(
        id: Id,
        transport: Box<dyn Transport>,
        storage: Box<dyn Storage>,
        config: &Config,
    ) -> Self {
        let contact = Contact::new(id, transport.local_address());

        Rpc {
            contact,
            routing_table: RoutingTable::with_bucket_size(id, config.k),
            messenger: Messenger::new(),
            transport,
            storage,

            pending: PendingCalls::new(config.response_timeout),
            stacks: Stacks::default(),

            admit_senders: true,
            listening: false,
            last_sweep: Instant::now(),
        }
    }

    // === Options ===

    /// Advertise `address` instead of the transport's local address.
    pub fn with_address(mut self, address: Address) -> Self {
        self.contact = Contact::new(*self.contact.id(), address);
        self
    }

    /// Whether senders of incoming messages are inserted into the routing table
    /// directly. Defaults to `true`.
    pub fn set_admit_senders(&mut self, admit: bool) {
        self.admit_senders = admit;
    }

    // === Getters ===

    /// Returns this node's [Id]
    pub fn id(&self) -> &Id {
        self.contact.id()
    }

    /// Returns the contact other nodes know this node by.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn routing_table_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing_table
    }

    pub fn messenger_mut(&mut self) -> &mut Messenger {
        &mut self.messenger
    }

    pub fn storage(&self) -> &dyn Storage {
        &*self.storage
    }

    pub fn storage_mut(&mut self) -> &mut dyn Storage {
        &mut *self.storage
    }

    /// Number of calls still waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    // === Public Methods ===

    /// Append `middleware` to the stack of `method`, or of every method for [WILDCARD].
    pub fn use_middleware(&mut self, method: &str, middleware: impl Middleware + 'static) {
        self.stacks.push_middleware(method, Box::new(middleware));
    }

    /// Append `handler` to the error stack of `method`, or of every method for [WILDCARD].
    pub fn use_error_handler(&mut self, method: &str, handler: impl ErrorMiddleware + 'static) {
        self.stacks.push_error_handler(method, Box::new(handler));
    }

    /// Install the default error handlers, replying to unhandled requests and
    /// to requests halted by an error.
    pub fn listen(&mut self) {
        if self.listening {
            return;
        }

        self.use_error_handler(WILDCARD, middleware::method_not_found);
        self.use_error_handler(WILDCARD, middleware::internal_error);
        self.listening = true;

        info!(context = "rpc", contact = %self.contact, "Listening");
    }

    /// Call `method` on `target`, returning the id of the call.
    ///
    /// `handler` is resolved in a later [Self::tick] with the response or
    /// [RpcError::Timeout].
    pub fn send(&mut self, method: &str, params: Value, target: &Contact, handler: H) -> String {
        let message = Message::request(method, params);
        let id = message.id().to_string();

        trace!(context = "rpc_send", %id, method, target = %target, "Sending request");

        self.pending.add(id.clone(), target.clone(), handler);
        self.write(message, target.clone());

        id
    }

    /// Sweep timed out calls, then read and dispatch available messages.
    pub fn tick(&mut self) -> RpcTickReport<H> {
        self.tick_at(Instant::now())
    }

    pub(crate) fn tick_at(&mut self, now: Instant) -> RpcTickReport<H> {
        let mut report = RpcTickReport::default();

        if now.saturating_duration_since(self.last_sweep) >= self.pending.timeout() {
            self.last_sweep = now;
            self.sweep(now, &mut report);
        }

        for _ in 0..MAX_PACKETS_PER_TICK {
            let buffer = match self.transport.read() {
                Ok(Some(buffer)) => buffer,
                Ok(None) => break,
                Err(error) => {
                    warn!(context = "rpc_transport", ?error, "Failed to read from transport");
                    break;
                }
            };

            if let Some(inbound) = self.messenger.deserialize(buffer) {
                self.receive(inbound, &mut report);
            }
        }

        report
    }

    // === Private Methods ===

    fn sweep(&mut self, now: Instant, report: &mut RpcTickReport<H>) {
        for call in self.pending.expired_at(now) {
            debug!(context = "rpc_timeout", target = %call.target, "Request timed out");

            if self.routing_table.remove_contact(call.target.id()).is_some() {
                debug!(context = "rpc_timeout", target = %call.target, "Removed unresponsive contact");
            }

            report.resolved.push((call.handler, Err(RpcError::Timeout)));
        }
    }

    fn receive(&mut self, inbound: Inbound, report: &mut RpcTickReport<H>) {
        let Inbound { message, sender } = inbound;

        if sender.id() != self.contact.id() {
            if self.admit_senders {
                self.routing_table.add_contact(sender.clone());
            }

            report.senders.push(sender.clone());
        }

        match message {
            Message::Request { id, method, params } => {
                trace!(context = "rpc_receive", %id, %method, from = %sender, "Received request");

                let request = Request {
                    id,
                    method,
                    params,
                    contact: sender,
                };

                self.handle_request(request);
            }
            Message::Success { id, result } => self.resolve(&id, Ok(result), report),
            Message::Error { id, error } => self.resolve(
                &id,
                Err(RpcError::Remote {
                    message: error.message,
                    code: error.code,
                }),
                report,
            ),
        }
    }

    fn handle_request(&mut self, request: Request) {
        let mut response = Response::new();

        let mut ctx = Context {
            identity: self.contact.id(),
            contact: &self.contact,
            routing_table: &self.routing_table,
            storage: &mut *self.storage,
        };

        self.stacks.dispatch(&mut ctx, &request, &mut response);

        let message = match response.into_reply() {
            Some(Reply::Result(result)) => Message::success(request.id, result),
            Some(Reply::Error { message, code }) => Message::error(request.id, message, code),
            None => {
                debug!(context = "rpc_receive", method = %request.method, "Request left without a reply");
                return;
            }
        };

        self.write(message, request.contact);
    }

    fn resolve(&mut self, id: &str, result: Result<Value, RpcError>, report: &mut RpcTickReport<H>) {
        match self.pending.remove(id) {
            Some(call) => {
                trace!(context = "rpc_receive", %id, from = %call.target, "Received response");
                report.resolved.push((call.handler, result));
            }
            None => {
                warn!(context = "rpc_receive", %id, "Received late or invalid response");
            }
        }
    }

    fn write(&mut self, message: Message, receiver: Contact) {
        let outbound = Outbound {
            message,
            sender: self.contact.clone(),
            receiver,
        };

        let Some(packet) = self.messenger.serialize(outbound) else {
            return;
        };

        if let Err(error) = self.transport.write(&packet) {
            warn!(context = "rpc_transport", ?error, receiver = %packet.receiver, "Failed to send packet");
        }
    }
}

impl Rpc<Callback> {
    /// [Self::tick] and run every resolved callback.
    ///
    /// Returns the senders of the messages received.
    pub fn poll(&mut self) -> Vec<Contact> {
        let report = self.tick();

        for (callback, result) in report.resolved {
            callback(result);
        }

        report.senders
    }
}

impl<H> Debug for Rpc<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("contact", &self.contact)
            .field("routing_table_size", &self.routing_table.size())
            .field("transport", &self.transport)
            .field("pending", &self.pending)
            .field("stacks", &self.stacks)
            .field("listening", &self.listening)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use flume::Receiver;
    use serde_json::json;

    use crate::common::MemoryStorage;
    use crate::transport::MemoryTransport;

    use super::*;

    fn node() -> Rpc {
        let transport = MemoryTransport::bind()
            .unwrap()
            .with_poll_interval(Duration::ZERO);

        Rpc::new(
            Id::random(),
            Box::new(transport),
            Box::new(MemoryStorage::default()),
            &Config::default(),
        )
    }

    fn echo(rpc: &mut Rpc) {
        rpc.use_middleware(
            "ECHO",
            |_: &mut Context<'_>, request: &Request, response: &mut Response| -> Result<(), RpcError> {
                response.send(request.params.clone());
                Ok(())
            },
        );
        rpc.listen();
    }

    fn call(rpc: &mut Rpc, method: &str, target: &Contact) -> Receiver<Result<Value, RpcError>> {
        let (sender, receiver) = flume::bounded(1);

        rpc.send(
            method,
            json!(["hello"]),
            target,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );

        receiver
    }

    #[test]
    fn request_response() {
        let mut a = node();
        let mut b = node();
        echo(&mut b);

        let receiver = call(&mut a, "ECHO", b.contact());

        let senders = b.poll();
        assert_eq!(senders, vec![a.contact().clone()]);
        assert!(b.routing_table().get_contact(a.id()).is_some());

        a.poll();

        assert_eq!(receiver.try_recv().unwrap(), Ok(json!(["hello"])));
        assert_eq!(a.pending_len(), 0);
        assert!(a.routing_table().get_contact(b.id()).is_some());
    }

    #[test]
    fn method_not_found() {
        let mut a = node();
        let mut b = node();
        echo(&mut b);

        let receiver = call(&mut a, "NOPE", b.contact());

        b.poll();
        a.poll();

        assert_eq!(
            receiver.try_recv().unwrap(),
            Err(RpcError::Remote {
                message: "Method not found".into(),
                code: METHOD_NOT_FOUND_CODE
            })
        );
    }

    #[test]
    fn no_reply_before_listen() {
        let mut a = node();
        let mut b = node();

        let _receiver = call(&mut a, "ECHO", b.contact());

        b.poll();
        a.poll();

        assert_eq!(a.pending_len(), 1);
    }

    #[test]
    fn timeout_evicts_target() {
        let mut a = node();
        let target = Contact::new(Id::random(), Address::new("memory-nowhere", 0));

        a.routing_table_mut().add_contact(target.clone());

        let receiver = call(&mut a, "PING", &target);
        let (sender, resolved) = flume::unbounded();

        let report = a.tick_at(Instant::now() + Config::default().response_timeout);
        for (callback, result) in report.resolved {
            let _ = sender.send(a.routing_table().get_contact(target.id()).is_some());
            callback(result);
        }

        assert_eq!(receiver.try_recv().unwrap(), Err(RpcError::Timeout));
        assert_eq!(resolved.try_recv(), Ok(false));
        assert_eq!(a.pending_len(), 0);
    }

    #[test]
    fn late_response_is_discarded() {
        let mut a = node();
        let mut b = node();
        echo(&mut b);

        let receiver = call(&mut a, "ECHO", b.contact());

        let report = a.tick_at(Instant::now() + Config::default().response_timeout);
        assert_eq!(report.resolved.len(), 1);

        b.poll();
        let report = a.tick();

        assert!(report.resolved.is_empty());
        assert_eq!(report.senders, vec![b.contact().clone()]);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn ignores_own_messages_as_senders() {
        let mut a = node();
        echo(&mut a);

        let contact = a.contact().clone();
        let receiver = call(&mut a, "ECHO", &contact);

        assert!(a.poll().is_empty());

        assert_eq!(receiver.try_recv().unwrap(), Ok(json!(["hello"])));
        assert!(a.routing_table().is_empty());
    }

    #[test]
    fn advertised_address() {
        let rpc = node().with_address(Address::new("example.com", 1337));

        assert_eq!(rpc.contact().address().to_string(), "example.com:1337");
    }
}
