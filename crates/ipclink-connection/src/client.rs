use ipclink_message::{Decoder, Encoder, MessageName};

use crate::connection::Connection;

/// Receiver of a connection's incoming traffic.
///
/// Every callback runs on the run loop the connection was opened on, or on
/// a thread blocked in [`Connection::send_sync`] for messages allowed to
/// dispatch while waiting.
pub trait Client: Send + Sync {
    /// An asynchronous message arrived.
    ///
    /// Leaving `decoder` invalid marks the message as malformed.
    fn did_receive_message(&self, connection: &Connection, decoder: &mut Decoder);

    /// A synchronous message arrived.
    ///
    /// `reply` starts out holding the reply encoder. Return `false` to
    /// decline the message, which resolves the sender's call as
    /// [`Error::SyncMessageCancelled`](crate::Error::SyncMessageCancelled).
    /// Return `true` and leave the encoder in place to have it sent once the
    /// handler returns, or take it and pass it to
    /// [`Connection::send_reply`] to reply yourself.
    fn did_receive_sync_message(
        &self,
        connection: &Connection,
        decoder: &mut Decoder,
        reply: &mut Option<Box<Encoder>>,
    ) -> bool {
        let _ = (connection, decoder, reply);
        false
    }

    /// The peer went away. Delivered at most once, and never after the
    /// local side invalidated.
    fn did_close(&self, connection: &Connection);

    /// A message was unknown or failed to decode. The connection is
    /// invalidated right after this returns.
    fn did_receive_invalid_message(&self, connection: &Connection, name: MessageName) {
        let _ = (connection, name);
    }
}
