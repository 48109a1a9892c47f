//! A bidirectional message channel to one peer process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use ipclink_message::{
    AsyncReplyId, Decoder, EncodedMessage, Encoder, Frame, FrameReader, FrameWriter, Message,
    MessageError, MessageKind, MessageName, MessageRegistry, MessageWithReply,
    ShouldDispatchWhenWaitingForSyncReply, SyncRequestId,
};
use ipclink_transport::{Identifier, IpcStream, MAX_ATTACHMENTS_PER_MESSAGE};
use tracing::{debug, trace, warn};

use crate::client::Client;
use crate::config::ConnectionConfig;
use crate::dispatcher::{run_or_dispatch, Dispatcher};
use crate::error::{Error, Result};
use crate::options::{SendOptions, SendSyncOptions};
use crate::reply::ReplyPromise;
use crate::run_loop::RunLoop;
use crate::throttler::Throttler;
use crate::work_queue::WorkQueue;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which half of an identifier pair a connection was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// One end of an IPC channel.
///
/// A connection starts unopened: messages sent before [`open`](Self::open)
/// are queued and go out after the handshake frame. Opening binds it to the
/// calling thread's [`RunLoop`], where every [`Client`] callback runs. Once
/// invalidated, locally or because the peer went away, it never becomes
/// usable again.
///
/// Two threads per open connection move bytes: a reader that hands frames
/// to a per-connection receive queue, and a writer that drains the
/// outgoing queue.
pub struct Connection {
    id: ConnectionId,
    role: Role,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    weak_self: Weak<Connection>,
    next_sync_request_id: AtomicU64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Wakes the writer thread.
    outgoing_ready: Condvar,
    /// Wakes threads blocked on a sync reply, a flush, or a wait-for.
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum State {
    Unopened(IpcStream),
    Open,
    Invalidated,
}

struct Inner {
    state: State,
    client: Option<Arc<dyn Client>>,
    run_loop: Option<RunLoop>,
    receive_queue: Option<Arc<WorkQueue>>,
    socket: Option<IpcStream>,

    outgoing: VecDeque<EncodedMessage>,
    sending: bool,
    send_failed: bool,
    writer_done: bool,

    incoming: VecDeque<Decoder>,
    out_of_order: VecDeque<Decoder>,
    dispatch_scheduled: bool,
    throttler: Option<Throttler>,
    ignore_invalid_messages: bool,

    sync_waiters: usize,
    unbounded_sync_waiters: usize,
    sync_replies: HashMap<SyncRequestId, Option<Result<Decoder>>>,
    dispatch_while_waiting: VecDeque<WaitingDispatch>,
    wait_for: Option<PendingWaitFor>,

    async_replies: BTreeMap<AsyncReplyId, AsyncReplyHandler>,

    peer_initialized: bool,
    peer_closed: bool,
    did_close_delivered: bool,
}

/// A message a sync waiter may dispatch on its own thread.
struct WaitingDispatch {
    decoder: Decoder,
    unbounded_only: bool,
}

struct PendingWaitFor {
    name: MessageName,
    destination_id: u64,
    decoder: Option<Decoder>,
}

type ReplyCompletion = Box<dyn FnOnce(Result<Decoder>) + Send + 'static>;

struct AsyncReplyHandler {
    completion: ReplyCompletion,
    dispatcher: Arc<dyn Dispatcher>,
    /// Delivered through the connection's own incoming queue, in order with
    /// the other messages from the peer.
    ordered: bool,
}

impl AsyncReplyHandler {
    fn deliver(self, decoder: Decoder) {
        let AsyncReplyHandler {
            completion,
            dispatcher,
            ..
        } = self;
        run_or_dispatch(&dispatcher, move || completion(Ok(decoder)));
    }

    fn cancel(self, error: Error) {
        let AsyncReplyHandler {
            completion,
            dispatcher,
            ..
        } = self;
        dispatcher.dispatch(Box::new(move || completion(Err(error))));
    }
}

fn cancel_reply_handlers(handlers: BTreeMap<AsyncReplyId, AsyncReplyHandler>) {
    for handler in handlers.into_values() {
        handler.cancel(Error::InvalidConnection);
    }
}

impl Inner {
    fn new(stream: IpcStream, throttler: Option<Throttler>, ignore_invalid_messages: bool) -> Self {
        Self {
            state: State::Unopened(stream),
            client: None,
            run_loop: None,
            receive_queue: None,
            socket: None,
            outgoing: VecDeque::new(),
            sending: false,
            send_failed: false,
            writer_done: false,
            incoming: VecDeque::new(),
            out_of_order: VecDeque::new(),
            dispatch_scheduled: false,
            throttler,
            ignore_invalid_messages,
            sync_waiters: 0,
            unbounded_sync_waiters: 0,
            sync_replies: HashMap::new(),
            dispatch_while_waiting: VecDeque::new(),
            wait_for: None,
            async_replies: BTreeMap::new(),
            peer_initialized: false,
            peer_closed: false,
            did_close_delivered: false,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, State::Open)
    }

    fn can_send(&self) -> bool {
        match self.state {
            State::Unopened(_) => true,
            State::Open => !self.peer_closed && !self.send_failed,
            State::Invalidated => false,
        }
    }

    fn pending_incoming(&self) -> usize {
        self.incoming.len() + self.out_of_order.len()
    }

    fn take_next_incoming(&mut self) -> Option<Decoder> {
        self.out_of_order
            .pop_front()
            .or_else(|| self.incoming.pop_front())
    }

    fn take_matching_incoming(&mut self, name: MessageName, destination_id: u64) -> Option<Decoder> {
        let matches = |decoder: &Decoder| {
            decoder.message_name() == name && decoder.destination_id() == destination_id
        };
        if let Some(index) = self.out_of_order.iter().position(matches) {
            return self.out_of_order.remove(index);
        }
        let index = self.incoming.iter().position(matches)?;
        self.incoming.remove(index)
    }

    fn take_dispatch_while_waiting(&mut self, unbounded: bool) -> Option<Decoder> {
        let index = self
            .dispatch_while_waiting
            .iter()
            .position(|waiting| unbounded || !waiting.unbounded_only)?;
        self.dispatch_while_waiting
            .remove(index)
            .map(|waiting| waiting.decoder)
    }

    fn take_reply_handlers(
        &mut self,
        mut take: impl FnMut(&AsyncReplyHandler) -> bool,
    ) -> BTreeMap<AsyncReplyId, AsyncReplyHandler> {
        let (taken, kept) = mem::take(&mut self.async_replies)
            .into_iter()
            .partition(|(_, handler)| take(handler));
        self.async_replies = kept;
        taken
    }

    fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(run_loop) = &self.run_loop {
            run_loop.dispatch(task);
        }
    }

    /// Close the socket now unless the writer still has frames to flush.
    fn shutdown_if_idle(&self) {
        if self.outgoing.is_empty() && !self.sending {
            if let Some(socket) = &self.socket {
                let _ = socket.shutdown();
            }
        }
    }
}

impl Connection {
    /// Create the server end from its half of an identifier pair.
    pub fn server(identifier: Identifier, config: ConnectionConfig) -> Arc<Self> {
        Self::new(identifier, Role::Server, config)
    }

    /// Create the client end from its half of an identifier pair.
    pub fn client(identifier: Identifier, config: ConnectionConfig) -> Arc<Self> {
        Self::new(identifier, Role::Client, config)
    }

    fn new(identifier: Identifier, role: Role, config: ConnectionConfig) -> Arc<Self> {
        let throttler = config.throttle_incoming_messages.then(Throttler::default);
        let inner = Inner::new(
            identifier.into_stream(),
            throttler,
            config.ignore_invalid_messages_for_testing,
        );
        Arc::new_cyclic(|weak_self| Self {
            id: ConnectionId::generate(),
            role,
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                outgoing_ready: Condvar::new(),
                changed: Condvar::new(),
            }),
            weak_self: weak_self.clone(),
            next_sync_request_id: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.config.registry
    }

    /// True until the connection is invalidated or the peer goes away.
    pub fn is_valid(&self) -> bool {
        let inner = self.lock();
        !matches!(inner.state, State::Invalidated) && !inner.peer_closed
    }

    /// Start the I/O threads and bind the connection to the calling
    /// thread's run loop.
    ///
    /// Returns false if the connection was already opened or invalidated,
    /// or if the I/O threads could not be started. In the last case the
    /// connection is invalidated.
    pub fn open(&self, client: Arc<dyn Client>) -> bool {
        let mut inner = self.lock();
        let stream = match mem::replace(&mut inner.state, State::Invalidated) {
            State::Unopened(stream) => stream,
            other => {
                inner.state = other;
                warn!(connection = %self.id, "open called on a connection that is not unopened");
                return false;
            }
        };

        let receive_queue = match self.start_io(&stream) {
            Ok(queue) => queue,
            Err(err) => {
                warn!(connection = %self.id, error = %err, "failed to start connection I/O");
                let _ = stream.shutdown();
                inner.outgoing.clear();
                let handlers = mem::take(&mut inner.async_replies);
                drop(inner);
                cancel_reply_handlers(handlers);
                return false;
            }
        };

        inner.state = State::Open;
        inner.client = Some(client);
        inner.run_loop = Some(RunLoop::current());
        inner.receive_queue = Some(receive_queue);
        inner.socket = Some(stream);
        inner
            .outgoing
            .push_front(Encoder::new(MessageName::INITIALIZE_CONNECTION, 0).finish());
        self.shared.outgoing_ready.notify_all();
        debug!(connection = %self.id, role = %self.role, queued = inner.outgoing.len(), "connection opened");
        true
    }

    fn start_io(&self, stream: &IpcStream) -> std::result::Result<Arc<WorkQueue>, MessageError> {
        let reader = FrameReader::with_config_ipc(stream.try_clone()?, self.config.frame.clone())?;
        let writer = FrameWriter::with_config_ipc(stream.try_clone()?, self.config.frame.clone())?;
        let receive_queue = WorkQueue::new(format!("ipclink-receive-{}", self.id))?;

        let id = self.id;
        let connection = self.weak_self.clone();
        let queue = Arc::clone(&receive_queue);
        thread::Builder::new()
            .name(format!("ipclink-reader-{id}"))
            .spawn(move || receive_loop(id, connection, reader, queue))?;

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("ipclink-writer-{id}"))
            .spawn(move || send_loop(id, shared, writer))?;

        Ok(receive_queue)
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Queued outgoing messages are still flushed to the peer, each write
    /// bounded by the frame write timeout. Pending async replies are
    /// cancelled on their dispatchers, and this side never receives
    /// [`Client::did_close`].
    pub fn invalidate(&self) {
        let (handlers, _receive_queue) = {
            let mut inner = self.lock();
            match mem::replace(&mut inner.state, State::Invalidated) {
                State::Invalidated => return,
                State::Unopened(stream) => {
                    debug!(connection = %self.id, "invalidating unopened connection");
                    drop(stream);
                    inner.outgoing.clear();
                }
                State::Open => {
                    debug!(connection = %self.id, "invalidating connection");
                }
            }
            inner.client = None;
            inner.incoming.clear();
            inner.out_of_order.clear();
            inner.dispatch_while_waiting.clear();
            inner.shutdown_if_idle();
            self.shared.outgoing_ready.notify_all();
            self.shared.changed.notify_all();
            (
                mem::take(&mut inner.async_replies),
                inner.receive_queue.take(),
            )
        };
        cancel_reply_handlers(handlers);
    }

    /// Send an async message.
    pub fn send<M: Message>(&self, message: M, destination_id: u64) -> Result<()> {
        self.send_with_options(message, destination_id, SendOptions::empty())
    }

    pub fn send_with_options<M: Message>(
        &self,
        message: M,
        destination_id: u64,
        options: SendOptions,
    ) -> Result<()> {
        self.check_sync_kind(M::NAME, false)?;
        let mut encoder = Encoder::new(M::NAME, destination_id);
        if options.contains(SendOptions::DISPATCH_WHEN_WAITING_FOR_SYNC_REPLY) {
            encoder.set_should_dispatch_message_when_waiting_for_sync_reply(
                ShouldDispatchWhenWaitingForSyncReply::Yes,
            );
        } else if options.contains(SendOptions::DISPATCH_WHEN_WAITING_FOR_UNBOUNDED_SYNC_REPLY) {
            encoder.set_should_dispatch_message_when_waiting_for_sync_reply(
                ShouldDispatchWhenWaitingForSyncReply::YesDuringUnboundedSyncReply,
            );
        }
        message.encode(&mut encoder);
        self.send_message(encoder)
    }

    /// Queue a hand-built message.
    ///
    /// Fails with [`Error::CantEncodeMessage`] if the message is over the
    /// frame limits and with [`Error::InvalidConnection`] once the
    /// connection can no longer send.
    pub fn send_message(&self, encoder: Encoder) -> Result<()> {
        let message = self.finish_for_transport(encoder)?;
        let mut inner = self.lock();
        if !inner.can_send() {
            return Err(Error::InvalidConnection);
        }
        trace!(connection = %self.id, message = %message.name, destination = message.destination_id, "queued message");
        inner.outgoing.push_back(message);
        self.shared.outgoing_ready.notify_all();
        Ok(())
    }

    /// Send a reply encoder taken out of
    /// [`Client::did_receive_sync_message`], or one built with
    /// [`Encoder::for_async_reply`].
    pub fn send_reply(&self, encoder: Encoder) -> Result<()> {
        self.send_message(encoder)
    }

    /// Sync sends are only allowed for names the registry marks sync, and
    /// async sends only for names it does not.
    fn check_sync_kind(&self, name: MessageName, sync: bool) -> Result<()> {
        if self.config.registry.is_sync(name) == sync {
            return Ok(());
        }
        warn!(connection = %self.id, message = %name, sync, "send kind disagrees with registry");
        Err(Error::CantEncodeMessage)
    }

    fn finish_for_transport(&self, encoder: Encoder) -> Result<EncodedMessage> {
        let attachments = encoder.attachment_count();
        let size = encoder.len();
        if attachments > MAX_ATTACHMENTS_PER_MESSAGE || size > self.config.frame.max_payload_size {
            warn!(
                connection = %self.id,
                message = %encoder.message_name(),
                attachments,
                size,
                "message exceeds frame limits"
            );
            return Err(Error::CantEncodeMessage);
        }
        Ok(encoder.finish())
    }

    /// Send a sync request and block for the reply.
    ///
    /// `None` waits without a deadline. While blocked, the calling thread
    /// dispatches incoming messages that are allowed to run during a sync
    /// wait.
    pub fn send_sync<M: MessageWithReply>(
        &self,
        message: M,
        destination_id: u64,
        timeout: Option<Duration>,
        options: SendSyncOptions,
    ) -> Result<M::Reply> {
        self.check_sync_kind(M::NAME, true)?;
        let request_id =
            SyncRequestId::new(self.next_sync_request_id.fetch_add(1, Ordering::Relaxed));
        let mut encoder = Encoder::new(M::NAME, destination_id);
        encoder.set_is_sync(true);
        if options.contains(SendSyncOptions::MAINTAIN_ORDERING_WITH_ASYNC_MESSAGES) {
            encoder.set_should_maintain_ordering_with_async_messages();
        }
        encoder.encode(request_id);
        message.encode(&mut encoder);
        let encoder = if options.contains(SendSyncOptions::USE_FULLY_SYNCHRONOUS_MODE_FOR_TESTING) {
            Encoder::wrap_for_testing(encoder)
        } else {
            encoder
        };

        let mut reply = self.send_sync_message(request_id, encoder, timeout)?;
        reply
            .decode::<M::Reply>()
            .ok_or(Error::FailedToDecodeReplyArguments)
    }

    fn send_sync_message(
        &self,
        request_id: SyncRequestId,
        encoder: Encoder,
        timeout: Option<Duration>,
    ) -> Result<Decoder> {
        let message = self.finish_for_transport(encoder)?;
        let unbounded = timeout.is_none();
        {
            let mut inner = self.lock();
            if !inner.is_open() || inner.peer_closed || inner.send_failed {
                return Err(Error::InvalidConnection);
            }
            inner.sync_replies.insert(request_id, None);
            inner.sync_waiters += 1;
            if unbounded {
                inner.unbounded_sync_waiters += 1;
            }
            trace!(connection = %self.id, message = %message.name, request = %request_id, "sending sync message");
            inner.outgoing.push_back(message);
            self.shared.outgoing_ready.notify_all();
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let result = self.wait_for_sync_reply(request_id, deadline, unbounded);

        let mut inner = self.lock();
        inner.sync_replies.remove(&request_id);
        inner.sync_waiters -= 1;
        if unbounded {
            inner.unbounded_sync_waiters -= 1;
        }
        self.requeue_stranded_waiting_dispatches(&mut inner);
        result
    }

    fn wait_for_sync_reply(
        &self,
        request_id: SyncRequestId,
        deadline: Option<Instant>,
        unbounded: bool,
    ) -> Result<Decoder> {
        let mut inner = self.lock();
        loop {
            // Messages that arrived ahead of the reply run first.
            if inner.is_open() {
                if let Some(decoder) = inner.take_dispatch_while_waiting(unbounded) {
                    drop(inner);
                    self.dispatch_message(decoder);
                    inner = self.lock();
                    continue;
                }
            }
            if let Some(slot) = inner.sync_replies.get_mut(&request_id) {
                if let Some(result) = slot.take() {
                    return result;
                }
            }
            if !inner.is_open() || inner.peer_closed {
                return Err(Error::InvalidConnection);
            }
            inner = match deadline {
                None => self
                    .shared
                    .changed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(connection = %self.id, request = %request_id, "sync message timed out");
                        return Err(Error::Timeout);
                    }
                    self.shared
                        .changed
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Hand messages no remaining sync waiter may take back to the run loop.
    fn requeue_stranded_waiting_dispatches(&self, inner: &mut Inner) {
        if inner.dispatch_while_waiting.is_empty() {
            return;
        }
        let waiters = inner.sync_waiters;
        let unbounded_waiters = inner.unbounded_sync_waiters;
        let (kept, stranded): (VecDeque<_>, VecDeque<_>) =
            mem::take(&mut inner.dispatch_while_waiting)
                .into_iter()
                .partition(|waiting| {
                    waiters > 0 && (unbounded_waiters > 0 || !waiting.unbounded_only)
                });
        inner.dispatch_while_waiting = kept;
        for waiting in stranded {
            self.enqueue_incoming(inner, waiting.decoder);
        }
    }

    /// Send a request whose reply is delivered to `completion`.
    ///
    /// The completion runs on the run loop the connection was opened on, in
    /// order with the peer's other messages. For an unopened connection it
    /// runs on the calling thread's run loop. It always runs exactly once,
    /// with [`Error::InvalidConnection`] if the request is cancelled.
    pub fn send_with_async_reply<M, F>(
        &self,
        message: M,
        destination_id: u64,
        completion: F,
    ) -> AsyncReplyId
    where
        M: MessageWithReply + 'static,
        F: FnOnce(Result<M::Reply>) + Send + 'static,
    {
        let bound = self.lock().run_loop.clone();
        let (dispatcher, ordered): (Arc<dyn Dispatcher>, bool) = match bound {
            Some(run_loop) => (Arc::new(run_loop), true),
            None => (Arc::new(RunLoop::current()), false),
        };
        self.send_with_async_reply_impl(message, destination_id, dispatcher, ordered, completion)
    }

    /// Like [`send_with_async_reply`](Self::send_with_async_reply), but the
    /// completion runs on `dispatcher`.
    pub fn send_with_async_reply_on<M, F>(
        &self,
        message: M,
        destination_id: u64,
        dispatcher: Arc<dyn Dispatcher>,
        completion: F,
    ) -> AsyncReplyId
    where
        M: MessageWithReply + 'static,
        F: FnOnce(Result<M::Reply>) + Send + 'static,
    {
        self.send_with_async_reply_impl(message, destination_id, dispatcher, false, completion)
    }

    /// Send a request and get its reply as a [`ReplyPromise`].
    pub fn send_with_promised_reply<M>(
        &self,
        message: M,
        destination_id: u64,
    ) -> ReplyPromise<M::Reply>
    where
        M: MessageWithReply + 'static,
    {
        let (promise, resolver) = ReplyPromise::new();
        self.send_with_async_reply(message, destination_id, move |result| {
            resolver.settle(result)
        });
        promise
    }

    fn send_with_async_reply_impl<M, F>(
        &self,
        message: M,
        destination_id: u64,
        dispatcher: Arc<dyn Dispatcher>,
        ordered: bool,
        completion: F,
    ) -> AsyncReplyId
    where
        M: MessageWithReply + 'static,
        F: FnOnce(Result<M::Reply>) + Send + 'static,
    {
        let reply_id = AsyncReplyId::generate();
        let mut encoder = Encoder::new(M::NAME, destination_id);
        encoder.encode(reply_id);
        message.encode(&mut encoder);

        let handler = AsyncReplyHandler {
            completion: Box::new(move |result: Result<Decoder>| {
                completion(result.and_then(|mut decoder| {
                    decoder
                        .decode::<M::Reply>()
                        .ok_or(Error::FailedToDecodeReplyArguments)
                }))
            }),
            dispatcher,
            ordered,
        };

        let message = match self
            .check_sync_kind(M::NAME, false)
            .and_then(|()| self.finish_for_transport(encoder))
        {
            Ok(message) => message,
            Err(err) => {
                handler.cancel(err);
                return reply_id;
            }
        };

        let mut inner = self.lock();
        if !inner.can_send() {
            drop(inner);
            trace!(connection = %self.id, reply = %reply_id, "cancelling async reply on invalid connection");
            handler.cancel(Error::InvalidConnection);
            return reply_id;
        }
        inner.async_replies.insert(reply_id, handler);
        inner.outgoing.push_back(message);
        self.shared.outgoing_ready.notify_all();
        reply_id
    }

    /// Block until a `M` addressed to `destination_id` arrives, then
    /// dispatch it on the calling thread ahead of everything queued.
    pub fn wait_for_and_dispatch_immediately<M: Message>(
        &self,
        destination_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let decoder = {
            let mut inner = self.lock();
            if !inner.is_open() {
                return Err(Error::InvalidConnection);
            }
            match inner.take_matching_incoming(M::NAME, destination_id) {
                Some(decoder) => decoder,
                None => {
                    if inner.peer_closed {
                        return Err(Error::InvalidConnection);
                    }
                    if inner.wait_for.is_some() {
                        warn!(connection = %self.id, message = %M::NAME, "already waiting for a message");
                        return Err(Error::Timeout);
                    }
                    inner.wait_for = Some(PendingWaitFor {
                        name: M::NAME,
                        destination_id,
                        decoder: None,
                    });
                    loop {
                        if let Some(decoder) = inner
                            .wait_for
                            .as_mut()
                            .and_then(|waiting| waiting.decoder.take())
                        {
                            inner.wait_for = None;
                            break decoder;
                        }
                        if !inner.is_open() || inner.peer_closed {
                            inner.wait_for = None;
                            return Err(Error::InvalidConnection);
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            inner.wait_for = None;
                            return Err(Error::Timeout);
                        }
                        inner = self
                            .shared
                            .changed
                            .wait_timeout(inner, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
        };
        self.dispatch_message(decoder);
        Ok(())
    }

    /// Block until every queued outgoing message has been written.
    pub fn flush_sent_messages(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if !inner.is_open() {
                return Err(Error::InvalidConnection);
            }
            if inner.outgoing.is_empty() && !inner.sending {
                return Ok(());
            }
            if inner.writer_done {
                return Err(Error::InvalidConnection);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Cap how many incoming messages each run loop pass dispatches.
    pub fn enable_incoming_messages_throttling(&self) {
        let mut inner = self.lock();
        if inner.throttler.is_none() {
            inner.throttler = Some(Throttler::default());
        }
    }

    pub fn set_ignore_invalid_messages_for_testing(&self) {
        self.lock().ignore_invalid_messages = true;
    }

    /// Messages received but not yet dispatched.
    pub fn pending_message_count_for_testing(&self) -> usize {
        self.lock().pending_incoming()
    }

    /// Run `task` on the receive queue, behind every frame already handed
    /// to it. Runs inline on an unopened connection.
    pub fn dispatch_on_receive_queue_for_testing<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.lock().receive_queue.clone();
        match queue {
            Some(queue) => queue.dispatch(task),
            None => task(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock()
    }

    fn current_client(&self) -> Option<Arc<dyn Client>> {
        self.lock().client.clone()
    }

    // Receive queue side.

    fn process_incoming_frame(&self, frame: Frame) {
        let decoder = match Decoder::new(frame.payload, frame.attachments) {
            Ok(decoder) => decoder,
            Err(err) => {
                warn!(connection = %self.id, error = %err, "received malformed message");
                self.did_receive_malformed_frame();
                return;
            }
        };
        let name = decoder.message_name();
        trace!(connection = %self.id, message = %name, destination = decoder.destination_id(), "received message");

        let mut inner = self.lock();
        if !inner.is_open() {
            return;
        }

        match name {
            MessageName::INITIALIZE_CONNECTION => {
                inner.peer_initialized = true;
                return;
            }
            MessageName::SYNC_MESSAGE_REPLY | MessageName::CANCEL_SYNC_MESSAGE_REPLY => {
                let request_id = SyncRequestId::new(decoder.destination_id());
                match inner.sync_replies.get_mut(&request_id) {
                    Some(slot) if slot.is_none() => {
                        *slot = Some(if name == MessageName::SYNC_MESSAGE_REPLY {
                            Ok(decoder)
                        } else {
                            Err(Error::SyncMessageCancelled)
                        });
                        self.shared.changed.notify_all();
                    }
                    _ => {
                        trace!(connection = %self.id, request = %request_id, "dropping reply to finished sync request");
                    }
                }
                return;
            }
            _ => {}
        }

        if let Some(waiting) = inner.wait_for.as_mut() {
            if waiting.decoder.is_none()
                && waiting.name == name
                && waiting.destination_id == decoder.destination_id()
            {
                waiting.decoder = Some(decoder);
                self.shared.changed.notify_all();
                return;
            }
        }

        let registry = &self.config.registry;
        if registry
            .get(name)
            .is_some_and(|info| info.kind == MessageKind::AsyncReply)
        {
            let reply_id = AsyncReplyId::new(decoder.destination_id());
            match inner.async_replies.get(&reply_id).map(|handler| handler.ordered) {
                None => {
                    trace!(connection = %self.id, reply = %reply_id, "dropping reply without a pending handler");
                    return;
                }
                Some(false) => {
                    let handler = inner.async_replies.remove(&reply_id);
                    drop(inner);
                    if let Some(handler) = handler {
                        handler.deliver(decoder);
                    }
                    return;
                }
                Some(true) => {}
            }
        }

        if let Some(unbounded_only) = self.dispatch_while_waiting_mode(&inner, &decoder) {
            inner.dispatch_while_waiting.push_back(WaitingDispatch {
                decoder,
                unbounded_only,
            });
            self.shared.changed.notify_all();
            return;
        }

        self.enqueue_incoming(&mut inner, decoder);
    }

    /// `Some(unbounded_only)` when a thread blocked in a sync send may
    /// dispatch this message.
    fn dispatch_while_waiting_mode(&self, inner: &Inner, decoder: &Decoder) -> Option<bool> {
        if inner.sync_waiters == 0 || decoder.should_maintain_ordering_with_async_messages() {
            return None;
        }
        let registry = &self.config.registry;
        let name = decoder.message_name();
        if decoder.should_dispatch_when_waiting_for_sync_reply()
            || decoder.is_fully_synchronous_mode_for_testing()
            || registry.is_allowed_when_waiting_for_sync_reply(name)
        {
            return Some(false);
        }
        let unbounded = decoder.should_dispatch_when_waiting_for_unbounded_sync_reply()
            || registry.is_allowed_when_waiting_for_unbounded_sync_reply(name);
        (unbounded && inner.unbounded_sync_waiters > 0).then_some(true)
    }

    fn enqueue_incoming(&self, inner: &mut Inner, decoder: Decoder) {
        if self
            .config
            .registry
            .can_dispatch_out_of_order(decoder.message_name())
        {
            inner.out_of_order.push_back(decoder);
        } else {
            inner.incoming.push_back(decoder);
        }
        self.schedule_dispatch(inner);
    }

    fn schedule_dispatch(&self, inner: &mut Inner) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        if inner.throttler.is_some() {
            if inner.dispatch_scheduled {
                return;
            }
            inner.dispatch_scheduled = true;
            inner.post(move || this.dispatch_incoming_messages_throttled());
        } else {
            inner.post(move || this.dispatch_one_incoming_message());
        }
    }

    fn did_receive_malformed_frame(&self) {
        let inner = self.lock();
        if inner.ignore_invalid_messages || !inner.is_open() {
            return;
        }
        if let Some(this) = self.weak_self.upgrade() {
            inner.post(move || this.invalidate());
        }
    }

    fn peer_did_close(&self) {
        let handlers = {
            let mut inner = self.lock();
            if inner.peer_closed {
                return;
            }
            inner.peer_closed = true;
            inner.outgoing.clear();
            self.shared.outgoing_ready.notify_all();
            self.shared.changed.notify_all();
            if !inner.is_open() {
                return;
            }
            debug!(connection = %self.id, initialized = inner.peer_initialized, "peer closed the connection");
            if let Some(this) = self.weak_self.upgrade() {
                inner.post(move || this.dispatch_did_close());
            }
            inner.take_reply_handlers(|handler| !handler.ordered)
        };
        cancel_reply_handlers(handlers);
    }

    // Run loop side.

    fn dispatch_did_close(&self) {
        // Everything the peer sent before closing is dispatched first.
        loop {
            let next = {
                let mut inner = self.lock();
                if !inner.is_open() {
                    return;
                }
                inner.take_next_incoming()
            };
            match next {
                Some(decoder) => self.dispatch_message(decoder),
                None => break,
            }
        }

        let (client, handlers) = {
            let mut inner = self.lock();
            if !inner.is_open() {
                return;
            }
            let handlers = mem::take(&mut inner.async_replies);
            let client = if inner.peer_initialized && !inner.did_close_delivered {
                inner.did_close_delivered = true;
                inner.client.clone()
            } else {
                None
            };
            (client, handlers)
        };
        cancel_reply_handlers(handlers);
        if let Some(client) = client {
            client.did_close(self);
        }
        self.invalidate();
    }

    fn dispatch_one_incoming_message(&self) {
        let decoder = self.lock().take_next_incoming();
        if let Some(decoder) = decoder {
            self.dispatch_message(decoder);
        }
    }

    fn dispatch_incoming_messages_throttled(&self) {
        let (first, count) = {
            let mut inner = self.lock();
            inner.dispatch_scheduled = false;
            let Some(first) = inner.take_next_incoming() else {
                return;
            };
            let remaining = inner.pending_incoming();
            let count = match inner.throttler.as_mut() {
                Some(throttler) => throttler.plan(remaining),
                None => remaining + 1,
            };
            if remaining + 1 > count {
                trace!(connection = %self.id, remaining, count, "throttling incoming messages");
                self.schedule_dispatch(&mut inner);
            }
            (first, count)
        };

        self.dispatch_message(first);
        for _ in 1..count {
            let next = self.lock().take_next_incoming();
            match next {
                Some(decoder) => self.dispatch_message(decoder),
                None => break,
            }
        }
    }

    fn dispatch_message(&self, mut decoder: Decoder) {
        let name = decoder.message_name();
        if name == MessageName::WRAPPED_ASYNC_MESSAGE_FOR_TESTING {
            match decoder.unwrap_for_testing() {
                Some(unwrapped) => self.dispatch_message(unwrapped),
                None => self.did_receive_invalid_message(name, None),
            }
            return;
        }

        let Some(kind) = self.config.registry.get(name).map(|info| info.kind) else {
            let request = sync_request_id(&mut decoder);
            self.did_receive_invalid_message(name, request);
            return;
        };

        match kind {
            MessageKind::AsyncReply => self.dispatch_async_reply(decoder),
            MessageKind::Internal => self.did_receive_invalid_message(name, None),
            MessageKind::Sync if decoder.is_sync() => self.dispatch_sync_message(name, decoder),
            MessageKind::Sync => {
                warn!(connection = %self.id, message = %name, "sync message arrived without sync header");
                self.did_receive_invalid_message(name, None);
            }
            MessageKind::Async if decoder.is_sync() => {
                warn!(connection = %self.id, message = %name, "async message arrived with sync header");
                let request = sync_request_id(&mut decoder);
                self.did_receive_invalid_message(name, request);
            }
            MessageKind::Async => {
                let Some(client) = self.current_client() else {
                    return;
                };
                client.did_receive_message(self, &mut decoder);
                if !decoder.is_valid() {
                    self.did_receive_invalid_message(name, None);
                }
            }
        }
    }

    fn dispatch_sync_message(&self, name: MessageName, mut decoder: Decoder) {
        let Some(client) = self.current_client() else {
            return;
        };
        let Some(request_id) = decoder.decode::<SyncRequestId>() else {
            self.did_receive_invalid_message(name, None);
            return;
        };

        let mut reply = Some(Box::new(Encoder::new(
            MessageName::SYNC_MESSAGE_REPLY,
            request_id.get(),
        )));
        let handled = client.did_receive_sync_message(self, &mut decoder, &mut reply);
        if !decoder.is_valid() {
            self.did_receive_invalid_message(name, Some(request_id));
            return;
        }
        if !handled {
            trace!(connection = %self.id, message = %name, request = %request_id, "sync message not handled");
            self.send_sync_cancel(request_id);
            return;
        }
        if let Some(reply) = reply {
            if let Err(err) = self.send_reply(*reply) {
                debug!(connection = %self.id, request = %request_id, error = %err, "failed to send sync reply");
            }
        }
    }

    fn send_sync_cancel(&self, request_id: SyncRequestId) {
        let cancel = Encoder::new(MessageName::CANCEL_SYNC_MESSAGE_REPLY, request_id.get());
        if let Err(err) = self.send_message(cancel) {
            debug!(connection = %self.id, request = %request_id, error = %err, "failed to cancel sync message");
        }
    }

    fn dispatch_async_reply(&self, decoder: Decoder) {
        let reply_id = AsyncReplyId::new(decoder.destination_id());
        let handler = self.lock().async_replies.remove(&reply_id);
        match handler {
            Some(handler) => handler.deliver(decoder),
            None => {
                trace!(connection = %self.id, reply = %reply_id, "dropping reply without a pending handler");
            }
        }
    }

    fn did_receive_invalid_message(&self, name: MessageName, request: Option<SyncRequestId>) {
        let description = self.config.registry.description(name);
        let ignore = self.lock().ignore_invalid_messages;
        if ignore {
            warn!(connection = %self.id, message = %name, description, "ignoring invalid message");
            if let Some(request_id) = request {
                self.send_sync_cancel(request_id);
            }
            return;
        }

        warn!(connection = %self.id, message = %name, description, "received invalid message, invalidating");
        if let Some(client) = self.current_client() {
            client.did_receive_invalid_message(self, name);
        }
        self.invalidate();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        let state = match inner.state {
            State::Unopened(_) => "unopened",
            State::Open if inner.peer_closed => "peer-closed",
            State::Open => "open",
            State::Invalidated => "invalidated",
        };
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// The request id that follows the header of a sync-flagged message.
fn sync_request_id(decoder: &mut Decoder) -> Option<SyncRequestId> {
    if decoder.is_sync() {
        decoder.decode()
    } else {
        None
    }
}

fn receive_loop(
    id: ConnectionId,
    connection: Weak<Connection>,
    mut reader: FrameReader<IpcStream>,
    queue: Arc<WorkQueue>,
) {
    loop {
        match reader.read_frame() {
            Ok(frame) => {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                queue.dispatch(move || connection.process_incoming_frame(frame));
            }
            Err(MessageError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                if connection.strong_count() == 0 {
                    break;
                }
            }
            Err(err) => {
                match err {
                    MessageError::ConnectionClosed => {
                        debug!(connection = %id, "socket closed");
                    }
                    other => {
                        warn!(connection = %id, error = %other, "receive failed, closing");
                    }
                }
                if let Some(connection) = connection.upgrade() {
                    queue.dispatch(move || connection.peer_did_close());
                }
                break;
            }
        }
    }
    debug!(connection = %id, "reader thread exiting");
}

fn send_loop(id: ConnectionId, shared: Arc<Shared>, mut writer: FrameWriter<IpcStream>) {
    loop {
        let message = {
            let mut inner = shared.lock();
            loop {
                if let Some(message) = inner.outgoing.pop_front() {
                    inner.sending = true;
                    break Some(message);
                }
                if !inner.is_open() || inner.peer_closed {
                    break None;
                }
                inner = shared
                    .outgoing_ready
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(message) = message else {
            break;
        };

        let name = message.name;
        let result = writer.write_message(message);
        let mut inner = shared.lock();
        inner.sending = false;
        shared.changed.notify_all();
        if let Err(err) = result {
            debug!(connection = %id, message = %name, error = %err, "send failed, dropping queued messages");
            inner.outgoing.clear();
            inner.send_failed = true;
            break;
        }
    }

    let _ = writer.get_ref().shutdown();
    shared.lock().writer_done = true;
    shared.changed.notify_all();
    debug!(connection = %id, "writer thread exiting");
}
