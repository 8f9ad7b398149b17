//! # Connections
//!
//! A connection is a bidirectional byte stream to another device,
//! multiplexed with other connections over a single transceiver.
//!
//! ## Lifecycle
//!
//! ```text
//!              accepted()
//! Requested ──────────────► Open ──── closed() ────► Closed
//!     │                      │
//!     ├── rejected() ──► Rejected
//!     │                      │
//!     └──────── timed_out() ─┴──────────────────────► Timeout
//! ```
//!
//! Terminal connections never reopen. Data already received stays readable
//! after the connection ended.
//!
//! ## Flow Control
//!
//! Each direction runs stop-and-wait: one [`ConnectionData`] chunk of at
//! most 30 bytes is outstanding until the peer answers with a
//! [`ConnectionReceived`] receipt. Chunks are peeked from the transmit
//! buffer and only flushed once the receipt confirms them, so a retry resends
//! exactly the same bytes. A single odd/even bit per direction lets the
//! receiver drop resent chunks it already stored.

use log::{trace, warn};
use serde::{de::DeserializeOwned, Serialize};

use crate::buffer::RingBuffer;
use crate::protocol::{ConnectionData, ConnectionReceived, DeviceId, DATA_PAYLOAD_SIZE};

/// Size of each connection's transmit and receive buffer
pub const CONNECTION_BUFFER_SIZE: usize = 512;

/// Largest encoded value accepted by [`Connection::write_value`]
pub const MAX_VALUE_SIZE: usize = 256;

/// Length prefix of a framed value
const VALUE_HEADER_SIZE: usize = 2;

/// Connection id as used by one of the two devices
pub type ConnectionId = u8;

const TX_ODD: u8 = 0x01;
const TX_PENDING: u8 = 0x02;
const RX_ODD: u8 = 0x04;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Requested locally, the peer did not answer yet
    Requested,
    /// Can be written to and read from
    Open,
    /// The peer declined the request
    Rejected,
    /// Communication failure
    Timeout,
    /// Closed by either side
    Closed,
}

impl State {
    /// No further data will flow in either direction
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Rejected | State::Timeout | State::Closed)
    }
}

/// Errors of the connection's stream interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionError {
    #[error("connection is not open")]
    NotOpen,
    /// Not enough data buffered or not enough room, try again later
    #[error("operation would block")]
    WouldBlock,
    #[error("value exceeds the maximum framed size")]
    TooLarge,
    #[error("value could not be serialized")]
    Serialize,
    #[error("value could not be deserialized")]
    Deserialize,
}

impl embedded_io::Error for ConnectionError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            ConnectionError::NotOpen => embedded_io::ErrorKind::NotConnected,
            ConnectionError::TooLarge => embedded_io::ErrorKind::InvalidInput,
            ConnectionError::Serialize | ConnectionError::Deserialize => {
                embedded_io::ErrorKind::InvalidData
            }
            ConnectionError::WouldBlock => embedded_io::ErrorKind::Other,
        }
    }
}

/// One logical stream to another device.
///
/// Connections are created and driven by the
/// [`Controller`](crate::controller::Controller); applications only read
/// from and write to them.
pub struct Connection {
    state: State,
    own_id: ConnectionId,
    other_id: ConnectionId,
    other: DeviceId,
    param: u8,
    rx: RingBuffer<CONNECTION_BUFFER_SIZE>,
    tx: RingBuffer<CONNECTION_BUFFER_SIZE>,
    comm_state: u8,
    /// Length of the chunk awaiting its receipt
    in_flight: u8,
    /// Consecutive transmit failures since the last receipt
    failures: u8,
    reject_reason: Option<u16>,
    metadata: Option<u32>,
    /// Bytes of an oversized value still to be skipped as they arrive
    discard: usize,
    /// Open or receipt deadline, owned by the controller
    pub(crate) deadline: Option<u64>,
    /// Swept by the controller once terminal
    pub(crate) released: bool,
    /// A data message for this connection sits in the outbox or awaits its
    /// link ack
    pub(crate) queued: bool,
}

impl Connection {
    /// Connection requested locally, waiting for the peer
    pub(crate) fn requested(own_id: ConnectionId, other: DeviceId, param: u8) -> Self {
        Self {
            state: State::Requested,
            own_id,
            other_id: 0,
            other,
            param,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            comm_state: RX_ODD,
            in_flight: 0,
            failures: 0,
            reject_reason: None,
            metadata: None,
            discard: 0,
            deadline: None,
            released: false,
            queued: false,
        }
    }

    /// Connection requested by `other` and accepted locally
    pub(crate) fn incoming(
        own_id: ConnectionId,
        other_id: ConnectionId,
        other: DeviceId,
        param: u8,
    ) -> Self {
        let mut conn = Self::requested(own_id, other, param);
        conn.other_id = other_id;
        conn.state = State::Open;
        conn
    }

    /// Connection type chosen by the requester
    pub fn param(&self) -> u8 {
        self.param
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Id of the connection on this device
    pub fn own_id(&self) -> ConnectionId {
        self.own_id
    }

    /// Id of the connection on the other device, valid once accepted
    pub fn other_id(&self) -> ConnectionId {
        self.other_id
    }

    /// The device at the other end
    pub fn other(&self) -> DeviceId {
        self.other
    }

    /// Reason code sent by the peer when it rejected the request
    pub fn reject_reason(&self) -> Option<u16> {
        self.reject_reason
    }

    pub fn can_read(&self) -> usize {
        self.rx.can_read()
    }

    pub fn can_read_continuous(&self) -> usize {
        self.rx.can_read_continuous()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.rx.read(buf)
    }

    /// Copy received data without consuming it
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        self.rx.peek(buf)
    }

    /// Contiguous received data, release it with [`Connection::consume`]
    pub fn read_buffer(&self) -> &[u8] {
        self.rx.read_buffer()
    }

    pub fn consume(&mut self, len: usize) -> usize {
        self.rx.flush(len)
    }

    /// Free transmit space, always zero unless the connection is open
    pub fn can_write(&self) -> usize {
        if self.is_open() {
            self.tx.can_write()
        } else {
            0
        }
    }

    /// Queue data for transmission, returns the number of bytes accepted.
    ///
    /// # Panics
    ///
    /// Writing to a connection that is not open is a caller bug.
    pub fn write(&mut self, data: &[u8]) -> usize {
        assert!(self.is_open(), "write to connection {} which is not open", self.own_id);
        self.tx.write(data)
    }

    /// Queued data not yet confirmed by the peer
    pub fn unsent(&self) -> usize {
        self.tx.can_read()
    }

    /// Whether a chunk is waiting for its receipt
    pub fn is_transmit_pending(&self) -> bool {
        self.comm_state & TX_PENDING != 0
    }

    /// Serialize `value` with postcard and queue it with a little-endian
    /// `u16` length prefix. Either the whole value is queued or nothing.
    pub fn write_value<T: Serialize>(&mut self, value: &T) -> Result<usize, ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotOpen);
        }
        let mut scratch = [0u8; VALUE_HEADER_SIZE + MAX_VALUE_SIZE];
        let len = match postcard::to_slice(value, &mut scratch[VALUE_HEADER_SIZE..]) {
            Ok(encoded) => encoded.len(),
            Err(postcard::Error::SerializeBufferFull) => return Err(ConnectionError::TooLarge),
            Err(_) => return Err(ConnectionError::Serialize),
        };
        let total = VALUE_HEADER_SIZE + len;
        if self.tx.can_write() < total {
            return Err(ConnectionError::WouldBlock);
        }
        scratch[..VALUE_HEADER_SIZE].copy_from_slice(&(len as u16).to_le_bytes());
        Ok(self.tx.write(&scratch[..total]))
    }

    /// Whether a complete framed value has been received
    pub fn can_read_value(&self) -> bool {
        self.framed_len().is_some_and(|len| {
            len <= MAX_VALUE_SIZE && VALUE_HEADER_SIZE + len <= self.rx.can_read()
        })
    }

    /// Read the next value written by the peer's [`Connection::write_value`].
    ///
    /// A frame longer than [`MAX_VALUE_SIZE`] is skipped, including the
    /// part not received yet, and reported as [`ConnectionError::TooLarge`].
    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T, ConnectionError> {
        let len = self.framed_len().ok_or(ConnectionError::WouldBlock)?;
        if len > MAX_VALUE_SIZE {
            let total = VALUE_HEADER_SIZE + len;
            self.discard = total - self.rx.flush(total);
            warn!("skipping {} byte value on connection {}", len, self.own_id);
            return Err(ConnectionError::TooLarge);
        }
        let total = VALUE_HEADER_SIZE + len;
        if self.rx.can_read() < total {
            return Err(ConnectionError::WouldBlock);
        }
        let mut scratch = [0u8; VALUE_HEADER_SIZE + MAX_VALUE_SIZE];
        self.rx.read(&mut scratch[..total]);
        postcard::from_bytes(&scratch[VALUE_HEADER_SIZE..total])
            .map_err(|_| ConnectionError::Deserialize)
    }

    fn framed_len(&self) -> Option<usize> {
        let lo = self.rx.peek_at(0)?;
        let hi = self.rx.peek_at(1)?;
        Some(u16::from_le_bytes([lo, hi]) as usize)
    }

    pub fn metadata(&self) -> Option<u32> {
        self.metadata
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Attach an application handle to the connection
    pub fn set_metadata(&mut self, value: u32) {
        self.metadata = Some(value);
    }

    pub fn take_metadata(&mut self) -> Option<u32> {
        self.metadata.take()
    }

    pub(crate) fn accepted(&mut self, other_id: ConnectionId) {
        assert_eq!(self.state, State::Requested, "accepting connection {}", self.own_id);
        self.other_id = other_id;
        self.state = State::Open;
    }

    pub(crate) fn rejected(&mut self, reason: u16) {
        assert_eq!(self.state, State::Requested, "rejecting connection {}", self.own_id);
        self.reject_reason = Some(reason);
        self.state = State::Rejected;
    }

    pub(crate) fn closed(&mut self) {
        assert_eq!(self.state, State::Open, "closing connection {}", self.own_id);
        self.state = State::Closed;
    }

    pub(crate) fn timed_out(&mut self) {
        assert!(
            matches!(self.state, State::Requested | State::Open),
            "timing out connection {} in state {:?}",
            self.own_id,
            self.state
        );
        self.state = State::Timeout;
    }

    /// Odd/even bit of the next (or pending) chunk
    pub(crate) fn tx_odd(&self) -> bool {
        self.comm_state & TX_ODD != 0
    }

    /// Prepare the next chunk of at most `available` bytes.
    ///
    /// `available` is the budget granted by the caller, usually the free
    /// space last reported by the peer. Returns `None` while a chunk is
    /// pending or when there is nothing to send. The returned chunk must be
    /// handed to the transceiver; if that fails call
    /// [`Connection::transmit_failed`].
    pub(crate) fn transmit(&mut self, available: usize) -> Option<ConnectionData> {
        if self.is_transmit_pending() || !self.is_open() {
            return None;
        }
        let len = available.min(self.tx.can_read()).min(DATA_PAYLOAD_SIZE);
        if len == 0 {
            return None;
        }
        let mut payload = [0u8; DATA_PAYLOAD_SIZE];
        self.tx.peek(&mut payload[..len]);
        trace!(
            "transmitting {} bytes on connection {}, other id {}",
            len,
            self.own_id,
            self.other_id
        );
        self.comm_state |= TX_PENDING;
        self.in_flight = len as u8;
        Some(ConnectionData::new(self.other_id, self.tx_odd(), &payload[..len]))
    }

    /// The peer's receipt for the pending chunk arrived.
    ///
    /// A non zero `len` confirms the chunk, which is then flushed and the
    /// odd/even bit flipped. Zero means the peer had no room and the same
    /// window is sent again. Either way the next chunk is prepared right
    /// away within the `available` budget.
    pub(crate) fn transmit_ack(&mut self, len: u8, available: usize) -> Option<ConnectionData> {
        if !self.is_transmit_pending() {
            trace!("stray receipt on connection {}", self.own_id);
            return None;
        }
        self.comm_state &= !TX_PENDING;
        self.failures = 0;
        if len > 0 {
            if len != self.in_flight {
                warn!(
                    "connection {}: receipt for {} bytes, {} were sent",
                    self.own_id, len, self.in_flight
                );
            }
            self.comm_state ^= TX_ODD;
            self.tx.flush(len as usize);
        }
        self.in_flight = 0;
        self.transmit(available)
    }

    /// The pending chunk was not delivered. Clears the pending marker so the
    /// same window is retried and returns the number of consecutive failures.
    pub(crate) fn transmit_failed(&mut self) -> u8 {
        self.abort_transmit();
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    /// Forget the pending chunk without counting a failure
    pub(crate) fn abort_transmit(&mut self) {
        self.comm_state &= !TX_PENDING;
        self.in_flight = 0;
    }

    /// Store an incoming chunk.
    ///
    /// Returns whether the chunk fit together with the receipt to send back.
    /// A resent chunk (same odd/even bit as the last stored one) is not
    /// stored again but still acknowledged with its full length, so the
    /// sender moves on.
    pub(crate) fn receive(&mut self, payload: &[u8], odd: bool) -> (bool, ConnectionReceived) {
        let len = payload.len();
        let available = self.rx.can_write();
        if available >= len {
            if (self.comm_state & RX_ODD != 0) != odd {
                let skip = self.discard.min(len);
                self.discard -= skip;
                self.rx.write(&payload[skip..]);
                self.comm_state ^= RX_ODD;
            } else {
                trace!("duplicate chunk on connection {}", self.own_id);
            }
            let receipt = ConnectionReceived {
                connection_id: self.other_id,
                length: len as u8,
                available: (available - len) as u32,
            };
            (true, receipt)
        } else {
            let receipt = ConnectionReceived {
                connection_id: self.other_id,
                length: 0,
                available: available as u32,
            };
            (false, receipt)
        }
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("own_id", &self.own_id)
            .field("other_id", &self.other_id)
            .field("other", &self.other)
            .field("param", &self.param)
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .field("comm_state", &self.comm_state)
            .finish()
    }
}

impl embedded_io::ErrorType for Connection {
    type Error = ConnectionError;
}

/// Never blocks: with nothing buffered on a live connection the read fails
/// with [`ConnectionError::WouldBlock`]. Check
/// [`ReadReady`](embedded_io::ReadReady) first when polling.
impl embedded_io::Read for Connection {
    /// Returns `Ok(0)` only once the connection ended and was drained
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.rx.read(buf) {
            0 if self.state.is_terminal() => Ok(0),
            0 => Err(ConnectionError::WouldBlock),
            n => Ok(n),
        }
    }
}

impl embedded_io::ReadReady for Connection {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.rx.is_empty() || self.state.is_terminal())
    }
}

impl embedded_io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if !self.is_open() {
            return Err(ConnectionError::NotOpen);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match self.tx.write(buf) {
            0 => Err(ConnectionError::WouldBlock),
            n => Ok(n),
        }
    }

    /// Succeeds once the peer confirmed every queued byte
    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.tx.is_empty() {
            Ok(())
        } else if !self.is_open() {
            Err(ConnectionError::NotOpen)
        } else {
            Err(ConnectionError::WouldBlock)
        }
    }
}

impl embedded_io::WriteReady for Connection {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.can_write() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn open_connection() -> Connection {
        Connection::incoming(0, 5, 68, 1)
    }

    #[test]
    fn test_lifecycle() {
        let mut conn = Connection::requested(3, 68, 9);
        assert_eq!(conn.state(), State::Requested);
        assert_eq!(conn.param(), 9);
        assert_eq!(conn.other(), 68);
        assert_eq!(conn.can_write(), 0);

        conn.accepted(11);
        assert!(conn.is_open());
        assert_eq!(conn.other_id(), 11);
        assert_eq!(conn.can_write(), CONNECTION_BUFFER_SIZE - 1);

        conn.closed();
        assert_eq!(conn.state(), State::Closed);
        assert!(conn.state().is_terminal());
        assert_eq!(conn.can_write(), 0);
    }

    #[test]
    fn test_rejected_keeps_reason() {
        let mut conn = Connection::requested(0, 68, 0);
        conn.rejected(42);
        assert_eq!(conn.state(), State::Rejected);
        assert_eq!(conn.reject_reason(), Some(42));
    }

    #[test]
    #[should_panic(expected = "accepting connection")]
    fn test_double_accept_panics() {
        let mut conn = Connection::requested(0, 68, 0);
        conn.accepted(1);
        conn.accepted(1);
    }

    #[test]
    #[should_panic(expected = "not open")]
    fn test_write_requires_open() {
        let mut conn = Connection::requested(0, 68, 0);
        conn.write(b"nope");
    }

    #[test]
    fn test_transmit_chunks_and_ack() {
        let mut conn = open_connection();
        assert_eq!(conn.write(&[7u8; 50]), 50);

        let first = conn.transmit(30).expect("first chunk");
        assert_eq!(first.connection_id, 5);
        assert_eq!(first.payload.len(), 30);
        assert!(!first.odd);
        assert!(conn.is_transmit_pending());

        let next = conn.transmit_ack(30, 500).expect("second chunk");
        assert_eq!(conn.unsent(), 20);
        assert_eq!(next.payload.len(), 20);
        assert!(next.odd);
    }

    #[test]
    fn test_single_chunk_in_flight() {
        let mut conn = open_connection();
        conn.write(&[1u8; 100]);
        assert!(conn.transmit(30).is_some());
        assert!(conn.transmit(30).is_none());
        assert_eq!(conn.unsent(), 100);
    }

    #[test]
    fn test_transmit_respects_budget() {
        let mut conn = open_connection();
        conn.write(&[1u8; 100]);
        assert_eq!(conn.transmit(4).map(|d| d.payload.len()), Some(4));
        assert!(conn.transmit_ack(4, 0).is_none());
        assert_eq!(conn.unsent(), 96);

        let mut empty = open_connection();
        assert!(empty.transmit(30).is_none());
        assert!(!empty.is_transmit_pending());
    }

    #[test]
    fn test_zero_receipt_resends_same_window() {
        let mut conn = open_connection();
        conn.write(b"0123456789");
        let first = conn.transmit(30).expect("chunk");

        let retry = conn.transmit_ack(0, 30).expect("retry");
        assert_eq!(conn.unsent(), 10);
        assert_eq!(retry, first);
    }

    #[test]
    fn test_transmit_failure_retries_same_window() {
        let mut conn = open_connection();
        conn.write(b"abc");
        let first = conn.transmit(30).expect("chunk");
        assert_eq!(conn.transmit_failed(), 1);
        assert!(!conn.is_transmit_pending());
        assert_eq!(conn.transmit(30), Some(first));
        assert_eq!(conn.transmit_failed(), 2);

        // a receipt resets the failure count
        conn.transmit(30);
        conn.transmit_ack(3, 100);
        conn.write(b"d");
        conn.transmit(30);
        assert_eq!(conn.transmit_failed(), 1);
    }

    #[test]
    fn test_stray_receipt_ignored() {
        let mut conn = open_connection();
        conn.write(b"abc");
        assert!(conn.transmit_ack(3, 100).is_none());
        assert_eq!(conn.unsent(), 3);
    }

    #[test]
    fn test_receive_suppresses_duplicates() {
        let mut conn = open_connection();
        let payload = [9u8; 10];

        let (stored, receipt) = conn.receive(&payload, false);
        assert!(stored);
        assert_eq!(receipt.connection_id, 5);
        assert_eq!(receipt.length, 10);
        assert_eq!(receipt.available, 511 - 10);
        assert_eq!(conn.can_read(), 10);

        // resend of the same chunk is acknowledged but not stored again
        let (stored, receipt) = conn.receive(&payload, false);
        assert!(stored);
        assert_eq!(receipt.length, 10);
        assert_eq!(receipt.available, 501 - 10);
        assert_eq!(conn.can_read(), 10);

        let (_, receipt) = conn.receive(&[1, 2], true);
        assert_eq!(receipt.length, 2);
        assert_eq!(conn.can_read(), 12);
    }

    #[test]
    fn test_receive_without_space() {
        let mut conn = open_connection();
        let mut odd = false;
        for _ in 0..17 {
            conn.receive(&[0u8; 30], odd);
            odd = !odd;
        }
        assert_eq!(conn.can_read(), 510);

        let (stored, receipt) = conn.receive(&[0u8; 30], odd);
        assert!(!stored);
        assert_eq!(receipt.length, 0);
        assert_eq!(receipt.available, 1);
        assert_eq!(conn.can_read(), 510);
    }

    #[test]
    fn test_closed_connection_stays_readable() {
        let mut conn = open_connection();
        conn.receive(b"bye", false);
        conn.closed();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf), 3);
        assert_eq!(&buf[..3], b"bye");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Score {
        player: u8,
        points: u32,
        name: heapless::String<16>,
    }

    #[test]
    fn test_values_framed_over_stream() {
        let mut sender = open_connection();
        let mut receiver = open_connection();
        let score = Score {
            player: 2,
            points: 1200,
            name: heapless::String::try_from("ada").unwrap(),
        };
        let written = sender.write_value(&score).unwrap();

        // move the bytes over in two halves
        let mut wire = [0u8; 64];
        let n = sender.tx.read(&mut wire[..written]);
        receiver.receive(&wire[..3], false);
        assert!(!receiver.can_read_value());
        assert_eq!(receiver.read_value::<Score>(), Err(ConnectionError::WouldBlock));
        receiver.receive(&wire[3..n], true);
        assert!(receiver.can_read_value());
        assert_eq!(receiver.read_value::<Score>(), Ok(score));
        assert_eq!(receiver.can_read(), 0);
    }

    #[test]
    fn test_oversized_value_skipped() {
        let mut conn = open_connection();
        // a 300 byte frame followed by a framed 7u8
        let mut wire = [0u8; 305];
        wire[..2].copy_from_slice(&300u16.to_le_bytes());
        wire[302..].copy_from_slice(&[1, 0, 7]);

        let mut chunks = wire.chunks(30);
        let mut odd = false;
        conn.receive(chunks.next().unwrap(), odd);
        assert!(!conn.can_read_value());
        assert_eq!(conn.read_value::<u8>(), Err(ConnectionError::TooLarge));
        assert_eq!(conn.can_read(), 0);

        for chunk in chunks {
            odd = !odd;
            let (stored, receipt) = conn.receive(chunk, odd);
            assert!(stored);
            assert_eq!(receipt.length as usize, chunk.len());
        }
        assert_eq!(conn.can_read(), 3);
        assert!(conn.can_read_value());
        assert_eq!(conn.read_value::<u8>(), Ok(7));
    }

    #[test]
    fn test_peek_consume_and_metadata() {
        let mut conn = open_connection();
        conn.receive(b"hello", false);
        let mut buf = [0u8; 2];
        assert_eq!(conn.peek(&mut buf), 2);
        assert_eq!(&buf, b"he");
        assert_eq!(conn.can_read(), 5);
        assert_eq!(conn.read_buffer(), b"hello");
        assert_eq!(conn.consume(2), 2);
        assert_eq!(conn.read_buffer(), b"llo");
        assert_eq!(conn.consume(10), 3);
        assert_eq!(conn.can_read(), 0);

        assert!(!conn.has_metadata());
        conn.set_metadata(5);
        assert!(conn.has_metadata());
        assert_eq!(conn.take_metadata(), Some(5));
        assert_eq!(conn.metadata(), None);
    }

    #[test]
    fn test_stream_traits() {
        use embedded_io::{Read, Write};

        let mut conn = Connection::requested(0, 68, 0);
        assert_eq!(Write::write(&mut conn, b"x"), Err(ConnectionError::NotOpen));
        assert_eq!(conn.write_value(&1u8), Err(ConnectionError::NotOpen));

        let mut conn = open_connection();
        let mut buf = [0u8; 4];
        assert_eq!(Read::read(&mut conn, &mut buf), Err(ConnectionError::WouldBlock));
        assert_eq!(Write::write(&mut conn, b"hey"), Ok(3));
        assert_eq!(Write::flush(&mut conn), Err(ConnectionError::WouldBlock));

        conn.closed();
        assert_eq!(Read::read(&mut conn, &mut buf), Ok(0));
    }
}
