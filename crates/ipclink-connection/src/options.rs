use bitflags::bitflags;

bitflags! {
    /// Per-send dispatch overrides carried in the message header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendOptions: u8 {
        /// The peer may dispatch this message while blocked in a sync call.
        const DISPATCH_WHEN_WAITING_FOR_SYNC_REPLY = 1 << 0;
        /// As above, but only while the peer's sync call has no timeout.
        const DISPATCH_WHEN_WAITING_FOR_UNBOUNDED_SYNC_REPLY = 1 << 1;
    }
}

bitflags! {
    /// Options for [`Connection::send_sync`](crate::Connection::send_sync).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendSyncOptions: u8 {
        /// Send the request wrapped, so the peer dispatches it in order with
        /// its async traffic.
        const USE_FULLY_SYNCHRONOUS_MODE_FOR_TESTING = 1 << 0;
        /// Never let the peer dispatch this request on a thread that is
        /// itself waiting for a sync reply.
        const MAINTAIN_ORDERING_WITH_ASYNC_MESSAGES = 1 << 1;
    }
}
