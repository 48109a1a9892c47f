#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use ipclink_connection::{Client, Connection, ConnectionConfig, RunLoop};
use ipclink_message::{
    Decoder, Encoder, Message, MessageInfo, MessageName, MessageRegistry, MessageWithReply,
};
use ipclink_transport::{create_identifier_pair, Identifier};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const ABSENCE_TIMEOUT: Duration = Duration::from_millis(300);

pub struct MockTestMessage1;

impl Message for MockTestMessage1 {
    const NAME: MessageName = MessageName(300);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

pub struct MockTestMessageWithAsyncReply1;

impl Message for MockTestMessageWithAsyncReply1 {
    const NAME: MessageName = MessageName(301);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

impl MessageWithReply for MockTestMessageWithAsyncReply1 {
    const REPLY_NAME: MessageName = MessageName(302);
    type Reply = u64;
}

pub struct MockTestSyncMessage;

impl Message for MockTestSyncMessage {
    const NAME: MessageName = MessageName(303);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

impl MessageWithReply for MockTestSyncMessage {
    type Reply = ();
}

pub struct MockTestMessageWithConnection(pub Identifier);

impl Message for MockTestMessageWithConnection {
    const NAME: MessageName = MessageName(304);

    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.0);
    }

    fn decode(decoder: &mut Decoder) -> Option<Self> {
        Some(Self(decoder.decode()?))
    }
}

pub struct MockTestSyncMessageWithDataReply;

impl Message for MockTestSyncMessageWithDataReply {
    const NAME: MessageName = MessageName(305);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

impl MessageWithReply for MockTestSyncMessageWithDataReply {
    type Reply = Bytes;
}

/// Registered to run ahead of earlier queued messages.
pub struct MockTestOutOfOrderMessage;

impl Message for MockTestOutOfOrderMessage {
    const NAME: MessageName = MessageName(306);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

/// Its reply, not the request, is registered out of order.
pub struct MockTestMessageWithOutOfOrderReply;

impl Message for MockTestMessageWithOutOfOrderReply {
    const NAME: MessageName = MessageName(307);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

impl MessageWithReply for MockTestMessageWithOutOfOrderReply {
    const REPLY_NAME: MessageName = MessageName(308);
    type Reply = u64;
}

/// Registered to run while the receiver waits on a sync reply without timeout.
pub struct MockTestUnboundedWaitMessage;

impl Message for MockTestUnboundedWaitMessage {
    const NAME: MessageName = MessageName(309);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

/// Sync message registered to run while the receiver waits on any sync reply.
pub struct MockTestSyncMessageWhileWaiting;

impl Message for MockTestSyncMessageWhileWaiting {
    const NAME: MessageName = MessageName(310);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

impl MessageWithReply for MockTestSyncMessageWhileWaiting {
    type Reply = ();
}

pub fn test_registry() -> Arc<MessageRegistry> {
    MessageRegistry::builder()
        .register(
            MockTestMessage1::NAME,
            MessageInfo::asynchronous("MockTestMessage1", "Test"),
        )
        .register(
            MockTestMessageWithAsyncReply1::NAME,
            MessageInfo::asynchronous("MockTestMessageWithAsyncReply1", "Test"),
        )
        .register(
            MockTestMessageWithAsyncReply1::REPLY_NAME,
            MessageInfo::async_reply("MockTestMessageWithAsyncReply1Reply", "Test"),
        )
        .register(
            MockTestSyncMessage::NAME,
            MessageInfo::synchronous("MockTestSyncMessage", "Test"),
        )
        .register(
            MockTestMessageWithConnection::NAME,
            MessageInfo::asynchronous("MockTestMessageWithConnection", "Test"),
        )
        .register(
            MockTestSyncMessageWithDataReply::NAME,
            MessageInfo::synchronous("MockTestSyncMessageWithDataReply", "Test"),
        )
        .register(
            MockTestOutOfOrderMessage::NAME,
            MessageInfo::asynchronous("MockTestOutOfOrderMessage", "Test").out_of_order(),
        )
        .register(
            MockTestMessageWithOutOfOrderReply::NAME,
            MessageInfo::asynchronous("MockTestMessageWithOutOfOrderReply", "Test"),
        )
        .register(
            MockTestMessageWithOutOfOrderReply::REPLY_NAME,
            MessageInfo::async_reply("MockTestMessageWithOutOfOrderReplyReply", "Test")
                .out_of_order(),
        )
        .register(
            MockTestUnboundedWaitMessage::NAME,
            MessageInfo::asynchronous("MockTestUnboundedWaitMessage", "Test")
                .when_waiting_for_unbounded_sync_reply(),
        )
        .register(
            MockTestSyncMessageWhileWaiting::NAME,
            MessageInfo::synchronous("MockTestSyncMessageWhileWaiting", "Test")
                .when_waiting_for_sync_reply(),
        )
        .build()
        .expect("test registry should build")
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::new(test_registry())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub name: MessageName,
    pub destination_id: u64,
}

/// Returns true when the message was consumed and should not be recorded.
pub type AsyncHandler = Arc<dyn Fn(&Connection, &mut Decoder) -> bool + Send + Sync>;

pub type SyncHandler =
    Arc<dyn Fn(&Connection, &mut Decoder, &mut Option<Box<Encoder>>) -> bool + Send + Sync>;

#[derive(Default)]
struct MockState {
    messages: VecDeque<ReceivedMessage>,
    invalid_messages: Vec<MessageName>,
    async_handler: Option<AsyncHandler>,
    sync_handler: Option<SyncHandler>,
}

/// Records what a connection delivers.
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
    did_close: AtomicBool,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_async_handler(
        &self,
        handler: impl Fn(&Connection, &mut Decoder) -> bool + Send + Sync + 'static,
    ) {
        self.lock().async_handler = Some(Arc::new(handler));
    }

    pub fn set_sync_handler(
        &self,
        handler: impl Fn(&Connection, &mut Decoder, &mut Option<Box<Encoder>>) -> bool
            + Send
            + Sync
            + 'static,
    ) {
        self.lock().sync_handler = Some(Arc::new(handler));
    }

    pub fn take_messages(&self) -> Vec<ReceivedMessage> {
        self.lock().messages.drain(..).collect()
    }

    pub fn invalid_messages(&self) -> Vec<MessageName> {
        self.lock().invalid_messages.clone()
    }

    /// Pop the oldest recorded message, cycling the calling thread's run
    /// loop until one shows up.
    pub fn wait_for_message(&self, timeout: Duration) -> Option<ReceivedMessage> {
        if let Some(message) = self.lock().messages.pop_front() {
            return Some(message);
        }
        RunLoop::current().run_until(timeout, || !self.lock().messages.is_empty());
        self.lock().messages.pop_front()
    }

    pub fn got_did_close(&self) -> bool {
        self.did_close.load(Ordering::SeqCst)
    }

    pub fn wait_for_did_close(&self, timeout: Duration) -> bool {
        RunLoop::current().run_until(timeout, || self.got_did_close())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Client for MockClient {
    fn did_receive_message(&self, connection: &Connection, decoder: &mut Decoder) {
        let handler = self.lock().async_handler.clone();
        if let Some(handler) = handler {
            if handler(connection, decoder) {
                return;
            }
        }
        self.lock().messages.push_back(ReceivedMessage {
            name: decoder.message_name(),
            destination_id: decoder.destination_id(),
        });
    }

    fn did_receive_sync_message(
        &self,
        connection: &Connection,
        decoder: &mut Decoder,
        reply: &mut Option<Box<Encoder>>,
    ) -> bool {
        let handler = self.lock().sync_handler.clone();
        match handler {
            Some(handler) => handler(connection, decoder, reply),
            None => false,
        }
    }

    fn did_close(&self, _: &Connection) {
        self.did_close.store(true, Ordering::SeqCst);
    }

    fn did_receive_invalid_message(&self, _: &Connection, name: MessageName) {
        self.lock().invalid_messages.push(name);
    }
}

/// Answer every `MockTestMessageWithAsyncReply1` with its destination id.
pub fn echo_destination(connection: &Connection, decoder: &mut Decoder) -> bool {
    let Some(reply_id) = decoder.decode::<u64>() else {
        return false;
    };
    let mut encoder = Encoder::new(MockTestMessageWithAsyncReply1::REPLY_NAME, reply_id);
    encoder.encode(decoder.destination_id());
    // The requester may already be gone.
    let _ = connection.send_reply(encoder);
    true
}

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    ServerIsA,
    ClientIsA,
}

/// Two connected, unopened connections with a mock client each.
pub struct ConnectionPair {
    pub a: Arc<Connection>,
    pub b: Arc<Connection>,
    pub a_client: Arc<MockClient>,
    pub b_client: Arc<MockClient>,
}

impl ConnectionPair {
    pub fn new(direction: Direction) -> Self {
        let identifiers = create_identifier_pair().expect("identifier pair should be created");
        let server = Connection::server(identifiers.server, test_config());
        let client = Connection::client(identifiers.client, test_config());
        let (a, b) = match direction {
            Direction::ServerIsA => (server, client),
            Direction::ClientIsA => (client, server),
        };
        Self {
            a,
            b,
            a_client: MockClient::new(),
            b_client: MockClient::new(),
        }
    }

    pub fn open_a(&self) -> bool {
        self.a.open(self.a_client.clone())
    }

    pub fn open_b(&self) -> bool {
        self.b.open(self.b_client.clone())
    }

    pub fn open_both(&self) -> bool {
        self.open_a() && self.open_b()
    }
}

impl Drop for ConnectionPair {
    fn drop(&mut self) {
        self.a.invalidate();
        self.b.invalidate();
    }
}

/// A spawned run loop that stops when dropped.
pub struct TestRunLoop(pub RunLoop);

impl TestRunLoop {
    pub fn spawn(name: &str) -> Self {
        Self(RunLoop::spawn(name).expect("run loop thread should spawn"))
    }

    pub fn dispatcher(&self) -> Arc<RunLoop> {
        Arc::new(self.0.clone())
    }

    /// Run `task` on the loop and block until it returns.
    pub fn dispatch_sync<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.0.dispatch(move || {
            task();
            let _ = tx.send(());
        });
        rx.recv_timeout(DEFAULT_TIMEOUT * 3)
            .expect("run loop task should finish");
    }

    /// Run `task` on the loop while cycling the caller's loop until it
    /// returns.
    pub fn dispatch_and_wait<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let finished = Arc::clone(&done);
        self.0.dispatch(move || {
            task();
            finished.store(true, Ordering::SeqCst);
        });
        assert!(
            RunLoop::current().run_until(DEFAULT_TIMEOUT * 3, || done.load(Ordering::SeqCst)),
            "run loop task should finish"
        );
    }
}

impl Drop for TestRunLoop {
    fn drop(&mut self) {
        self.0.stop();
    }
}
