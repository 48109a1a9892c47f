//! In-process probe protocol shared by `bench` and `doctor`.
//!
//! A responder connection runs on its own run loop thread. The caller's
//! connection is opened on the calling thread, so async replies complete on
//! the caller's run loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use ipclink_connection::{Client, Connection, ConnectionConfig, RunLoop};
use ipclink_message::{
    AsyncReplyId, Decoder, Encoder, Message, MessageInfo, MessageName, MessageRegistry,
    MessageWithReply, USER_MESSAGE_START,
};
use ipclink_transport::{create_identifier_pair, Identifier};
use tracing::{debug, warn};

use crate::exit::{
    connection_error, io_error, message_error, transport_error, CliError, CliResult, TIMEOUT,
    TRANSPORT_ERROR,
};

/// Fire-and-forget payload counted by the responder.
pub struct Ping(pub Bytes);

impl Message for Ping {
    const NAME: MessageName = MessageName(USER_MESSAGE_START);

    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.0);
    }

    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.decode().map(Self)
    }
}

/// Synchronous request answered with its own payload.
pub struct Echo(pub Bytes);

impl Message for Echo {
    const NAME: MessageName = MessageName(USER_MESSAGE_START + 1);

    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.0);
    }

    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.decode().map(Self)
    }
}

impl MessageWithReply for Echo {
    type Reply = Bytes;
}

/// Async request answered with the number of pings seen so far.
pub struct PingCount;

impl Message for PingCount {
    const NAME: MessageName = MessageName(USER_MESSAGE_START + 2);

    fn encode(self, _: &mut Encoder) {}

    fn decode(_: &mut Decoder) -> Option<Self> {
        Some(Self)
    }
}

impl MessageWithReply for PingCount {
    const REPLY_NAME: MessageName = MessageName(USER_MESSAGE_START + 3);
    type Reply = u64;
}

/// Hands the responder one end of a fresh identifier pair to serve on.
pub struct Bootstrap(pub Identifier);

impl Message for Bootstrap {
    const NAME: MessageName = MessageName(USER_MESSAGE_START + 4);

    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.0);
    }

    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.decode().map(Self)
    }
}

pub fn registry() -> CliResult<Arc<MessageRegistry>> {
    MessageRegistry::builder()
        .register(Ping::NAME, MessageInfo::asynchronous("Ping", "Probe"))
        .register(Echo::NAME, MessageInfo::synchronous("Echo", "Probe"))
        .register(
            PingCount::NAME,
            MessageInfo::asynchronous("PingCount", "Probe"),
        )
        .register(
            PingCount::REPLY_NAME,
            MessageInfo::async_reply("PingCountReply", "Probe"),
        )
        .register(
            Bootstrap::NAME,
            MessageInfo::asynchronous("Bootstrap", "Probe"),
        )
        .build()
        .map_err(|err| message_error("probe registry", err))
}

/// Answers the probe protocol on the responder's run loop.
struct Responder {
    config: ConnectionConfig,
    pings: AtomicU64,
    children: Mutex<Vec<Arc<Connection>>>,
}

impl Responder {
    fn invalidate_children(&self) {
        let children = std::mem::take(
            &mut *self
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children {
            child.invalidate();
        }
    }
}

impl Client for Responder {
    fn did_receive_message(&self, connection: &Connection, decoder: &mut Decoder) {
        match decoder.message_name() {
            name if name == Ping::NAME => {
                if Ping::decode(decoder).is_some() {
                    self.pings.fetch_add(1, Ordering::Relaxed);
                }
            }
            name if name == PingCount::NAME => {
                let Some(reply_id) = decoder.decode::<AsyncReplyId>() else {
                    return;
                };
                let mut reply = Encoder::for_async_reply::<PingCount>(reply_id);
                reply.encode(self.pings.load(Ordering::Relaxed));
                if let Err(err) = connection.send_reply(reply) {
                    warn!(error = %err, "probe count reply failed");
                }
            }
            name if name == Bootstrap::NAME => {
                let Some(Bootstrap(identifier)) = Bootstrap::decode(decoder) else {
                    return;
                };
                let child = Connection::server(identifier, self.config.clone());
                let responder = Arc::new(Responder {
                    config: self.config.clone(),
                    pings: AtomicU64::new(0),
                    children: Mutex::new(Vec::new()),
                });
                if child.open(responder) {
                    debug!(parent = %connection.id(), child = %child.id(), "probe sub-connection opened");
                    self.children
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(child);
                }
            }
            _ => decoder.mark_invalid(),
        }
    }

    fn did_receive_sync_message(
        &self,
        _: &Connection,
        decoder: &mut Decoder,
        reply: &mut Option<Box<Encoder>>,
    ) -> bool {
        if decoder.message_name() != Echo::NAME {
            return false;
        }
        let Some(Echo(payload)) = Echo::decode(decoder) else {
            return false;
        };
        if let Some(encoder) = reply.as_mut() {
            encoder.encode(payload);
        }
        true
    }

    fn did_close(&self, _: &Connection) {
        self.invalidate_children();
    }
}

/// Caller side; only watches for the responder going away.
#[derive(Default)]
pub struct Requester;

impl Client for Requester {
    fn did_receive_message(&self, _: &Connection, decoder: &mut Decoder) {
        decoder.mark_invalid();
    }

    fn did_close(&self, connection: &Connection) {
        warn!(connection = %connection.id(), "probe responder closed the connection");
    }
}

/// A connected requester/responder pair.
pub struct ProbePair {
    pub requester: Arc<Connection>,
    responder: Arc<Connection>,
    responder_client: Arc<Responder>,
    responder_loop: RunLoop,
}

impl ProbePair {
    /// Open both ends. The requester is bound to the calling thread's run loop.
    pub fn open(config: ConnectionConfig, timeout: Duration) -> CliResult<Self> {
        let identifiers =
            create_identifier_pair().map_err(|err| transport_error("identifier pair", err))?;
        let responder_loop =
            RunLoop::spawn("ipclink-probe").map_err(|err| io_error("probe run loop", err))?;

        let responder = Connection::server(identifiers.server, config.clone());
        let responder_client = Arc::new(Responder {
            config: config.clone(),
            pings: AtomicU64::new(0),
            children: Mutex::new(Vec::new()),
        });

        let (tx, rx) = mpsc::channel();
        {
            let responder = Arc::clone(&responder);
            let client = Arc::clone(&responder_client);
            responder_loop.dispatch(move || {
                let _ = tx.send(responder.open(client));
            });
        }
        let opened = rx.recv_timeout(timeout).unwrap_or(false);

        let requester = Connection::client(identifiers.client, config);
        let pair = Self {
            requester,
            responder,
            responder_client,
            responder_loop,
        };
        if !opened {
            return Err(CliError::new(TIMEOUT, "probe responder did not open"));
        }
        if !pair.requester.open(Arc::new(Requester)) {
            return Err(CliError::new(
                TRANSPORT_ERROR,
                "probe requester did not open",
            ));
        }
        Ok(pair)
    }

    /// Throttle dispatch on the responder side.
    pub fn throttle_responder(&self) {
        self.responder.enable_incoming_messages_throttling();
    }
}

impl Drop for ProbePair {
    fn drop(&mut self) {
        self.requester.invalidate();
        self.responder_client.invalidate_children();
        self.responder.invalidate();
        self.responder_loop.stop();
    }
}

/// Ask for the responder's ping count, cycling the calling thread's run
/// loop until the reply arrives.
pub fn ping_count(connection: &Connection, timeout: Duration) -> CliResult<u64> {
    let slot = Arc::new(Mutex::new(None));
    let result = Arc::clone(&slot);
    connection.send_with_async_reply(PingCount, 0, move |reply| {
        *result.lock().unwrap_or_else(PoisonError::into_inner) = Some(reply);
    });

    let run_loop = RunLoop::current();
    run_loop.run_until(timeout, || {
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    });
    let reply = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    match reply {
        Some(reply) => reply.map_err(|err| connection_error("ping count", err)),
        None => Err(CliError::new(TIMEOUT, "ping count reply timed out")),
    }
}
