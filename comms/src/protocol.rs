//! # Protocol Message Definitions
//!
//! Every transmission is a single 32-byte [`Packet`]. The first byte
//! identifies the message and, for the two data carrying messages, also
//! packs the payload length.
//!
//! ## Id Byte
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! ┌───┬───┬───┬───────────────────┐
//! │ 0 │ 0 │odd│      length       │  ConnectionData   (length <= 30)
//! ├───┼───┼───┼───────────────────┤
//! │ 0 │ 1 │ - │      length       │  BroadcastData    (length <= 30)
//! ├───┼───┼───┴───────────────────┤
//! │ 1 │ 0 │      message id       │  control messages (0x80 ..= 0xBF)
//! ├───┴───┴───────────────────────┤
//! │          0xFF                 │  DebugPrint
//! └───────────────────────────────┘
//! ```
//!
//! All multi-byte fields are little-endian and the layout is tightly packed.
//! Text fields are zero padded and always contain a terminating zero byte.

use heapless::{String, Vec};

/// Identifies a physical device sharing the medium
pub type DeviceId = u8;

/// Reserved device id addressing everyone in range
pub const BROADCAST_ID: DeviceId = 0xff;

/// Size of every packet on the medium
pub const PACKET_SIZE: usize = 32;

/// Raw packet as exchanged with the hardware
pub type Packet = [u8; PACKET_SIZE];

/// Maximum payload of a single data message
pub const DATA_PAYLOAD_SIZE: usize = 30;

const LENGTH_MASK: u8 = 0b0001_1111;
const ODD_BIT: u8 = 0b0010_0000;
const KIND_MASK: u8 = 0b1100_0000;

/// Message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageId {
    ConnectionData = 0x00,
    BroadcastData = 0x40,
    Ping = 0x80,
    ConnectionOpen = 0x81,
    ConnectionAccept = 0x82,
    ConnectionReject = 0x83,
    ConnectionReceived = 0x84,
    ConnectionClose = 0x85,
    BroadcastStart = 0x86,
    BroadcastEnd = 0x87,
    DebugPrint = 0xFF,
}

impl MessageId {
    /// Extract the message id from the leading byte of a packet
    pub fn from_header(byte: u8) -> Result<Self, DecodeError> {
        if byte < 0x80 {
            return match byte & KIND_MASK {
                0x00 => Ok(Self::ConnectionData),
                _ => Ok(Self::BroadcastData),
            };
        }
        match byte {
            0x80 => Ok(Self::Ping),
            0x81 => Ok(Self::ConnectionOpen),
            0x82 => Ok(Self::ConnectionAccept),
            0x83 => Ok(Self::ConnectionReject),
            0x84 => Ok(Self::ConnectionReceived),
            0x85 => Ok(Self::ConnectionClose),
            0x86 => Ok(Self::BroadcastStart),
            0x87 => Ok(Self::BroadcastEnd),
            0xFF => Ok(Self::DebugPrint),
            other => Err(DecodeError::UnknownId(other)),
        }
    }

    /// Whether the receiving hardware must acknowledge this message.
    ///
    /// Broadcasts may have any number of listeners, so they and debug
    /// prints are fire and forget.
    pub const fn requires_ack(self) -> bool {
        match self {
            Self::ConnectionData
            | Self::Ping
            | Self::ConnectionOpen
            | Self::ConnectionAccept
            | Self::ConnectionReject
            | Self::ConnectionReceived
            | Self::ConnectionClose => true,
            Self::BroadcastData | Self::BroadcastStart | Self::BroadcastEnd | Self::DebugPrint => {
                false
            }
        }
    }
}

/// Errors while decoding a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The id byte does not belong to any message
    #[error("unknown message id 0x{0:02X}")]
    UnknownId(u8),
    /// Packed payload length larger than a packet can carry
    #[error("payload length {0} exceeds 30 bytes")]
    InvalidLength(u8),
    /// Text field is not valid UTF-8
    #[error("text field is not valid UTF-8")]
    InvalidText,
}

/// Chunk of a connection's byte stream.
///
/// `connection_id` is the id the *receiving* device uses for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionData {
    pub connection_id: u8,
    pub odd: bool,
    pub payload: Vec<u8, DATA_PAYLOAD_SIZE>,
}

impl ConnectionData {
    pub const SIZE: usize = 1 + 1 + DATA_PAYLOAD_SIZE;

    /// Payload beyond [`DATA_PAYLOAD_SIZE`] bytes is truncated
    pub fn new(connection_id: u8, odd: bool, payload: &[u8]) -> Self {
        Self {
            connection_id,
            odd,
            payload: truncated_bytes(payload),
        }
    }
}

/// Chunk of a broadcast, numbered by `index` for de-duplication of resends
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BroadcastData {
    pub index: u8,
    pub payload: Vec<u8, DATA_PAYLOAD_SIZE>,
}

impl BroadcastData {
    pub const SIZE: usize = 1 + 1 + DATA_PAYLOAD_SIZE;

    pub fn new(index: u8, payload: &[u8]) -> Self {
        Self {
            index,
            payload: truncated_bytes(payload),
        }
    }
}

/// Periodic announcement that a device exists and is in range.
///
/// Pings are numbered so that listeners can estimate signal quality from
/// the number of missed indices.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ping {
    pub sender: DeviceId,
    pub index: u8,
    pub user_id: u64,
    /// Not always populated, empty string when missing
    pub user_name: String<20>,
}

impl Ping {
    pub const SIZE: usize = 1 + 1 + 1 + 8 + 21;

    pub fn new(sender: DeviceId, index: u8, user_id: u64) -> Self {
        Self {
            sender,
            index,
            user_id,
            user_name: String::new(),
        }
    }

    pub fn with_user_name(mut self, name: &str) -> Self {
        self.user_name = truncated_str(name);
        self
    }
}

/// Request to open a connection.
///
/// `request_id` is the id under which the connection is known to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionOpen {
    pub sender: DeviceId,
    pub request_id: u8,
    pub param: u8,
}

impl ConnectionOpen {
    pub const SIZE: usize = 1 + 1 + 1 + 1;
}

/// Open request accepted, `response_id` is the id used by the accepting side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionAccept {
    pub request_id: u8,
    pub response_id: u8,
}

impl ConnectionAccept {
    pub const SIZE: usize = 1 + 1 + 1;
}

/// Open request declined
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionReject {
    pub request_id: u8,
    pub reason: u16,
    pub extra: String<27>,
}

impl ConnectionReject {
    pub const SIZE: usize = 1 + 1 + 2 + 28;

    pub fn new(request_id: u8, reason: u16) -> Self {
        Self {
            request_id,
            reason,
            extra: String::new(),
        }
    }

    /// Reject the given open request
    pub fn to_request(request: &ConnectionOpen, reason: u16) -> Self {
        Self::new(request.request_id, reason)
    }

    pub fn with_extra(mut self, extra: &str) -> Self {
        self.extra = truncated_str(extra);
        self
    }
}

/// Receipt for a [`ConnectionData`] message.
///
/// `length` equals the length of the acknowledged chunk, or zero when the
/// data could not be stored and must be sent again. `available` is the free
/// space left in the receiver's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionReceived {
    pub connection_id: u8,
    pub length: u8,
    pub available: u32,
}

impl ConnectionReceived {
    pub const SIZE: usize = 1 + 1 + 1 + 4;
}

/// Close a connection, can be sent by either endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionClose {
    pub connection_id: u8,
    pub extra: String<28>,
}

impl ConnectionClose {
    pub const SIZE: usize = 1 + 1 + 29;

    pub fn new(connection_id: u8, extra: &str) -> Self {
        Self {
            connection_id,
            extra: truncated_str(extra),
        }
    }
}

/// Start of a broadcast. A device runs at most one broadcast at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BroadcastStart {
    pub sender: DeviceId,
    pub kind: u8,
    /// Planned resends per message, lets listeners judge signal quality
    pub repeat_count: u8,
}

impl BroadcastStart {
    pub const SIZE: usize = 1 + 1 + 1 + 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BroadcastEnd {
    pub sender: DeviceId,
}

impl BroadcastEnd {
    pub const SIZE: usize = 1 + 1;
}

/// Text to be printed by a receiving controller
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DebugPrint {
    pub text: String<30>,
}

impl DebugPrint {
    pub const SIZE: usize = 1 + 31;

    pub fn new(text: &str) -> Self {
        Self {
            text: truncated_str(text),
        }
    }
}

// Wire format contract, every message must fit a single packet.
const _: () = {
    assert!(ConnectionData::SIZE <= PACKET_SIZE);
    assert!(BroadcastData::SIZE <= PACKET_SIZE);
    assert!(Ping::SIZE <= PACKET_SIZE);
    assert!(ConnectionOpen::SIZE <= PACKET_SIZE);
    assert!(ConnectionAccept::SIZE <= PACKET_SIZE);
    assert!(ConnectionReject::SIZE <= PACKET_SIZE);
    assert!(ConnectionReceived::SIZE <= PACKET_SIZE);
    assert!(ConnectionClose::SIZE <= PACKET_SIZE);
    assert!(BroadcastStart::SIZE <= PACKET_SIZE);
    assert!(BroadcastEnd::SIZE <= PACKET_SIZE);
    assert!(DebugPrint::SIZE <= PACKET_SIZE);
};

/// Complete message catalog
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Message {
    ConnectionData(ConnectionData),
    BroadcastData(BroadcastData),
    Ping(Ping),
    ConnectionOpen(ConnectionOpen),
    ConnectionAccept(ConnectionAccept),
    ConnectionReject(ConnectionReject),
    ConnectionReceived(ConnectionReceived),
    ConnectionClose(ConnectionClose),
    BroadcastStart(BroadcastStart),
    BroadcastEnd(BroadcastEnd),
    DebugPrint(DebugPrint),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::ConnectionData(_) => MessageId::ConnectionData,
            Message::BroadcastData(_) => MessageId::BroadcastData,
            Message::Ping(_) => MessageId::Ping,
            Message::ConnectionOpen(_) => MessageId::ConnectionOpen,
            Message::ConnectionAccept(_) => MessageId::ConnectionAccept,
            Message::ConnectionReject(_) => MessageId::ConnectionReject,
            Message::ConnectionReceived(_) => MessageId::ConnectionReceived,
            Message::ConnectionClose(_) => MessageId::ConnectionClose,
            Message::BroadcastStart(_) => MessageId::BroadcastStart,
            Message::BroadcastEnd(_) => MessageId::BroadcastEnd,
            Message::DebugPrint(_) => MessageId::DebugPrint,
        }
    }

    #[inline]
    pub fn requires_ack(&self) -> bool {
        self.id().requires_ack()
    }

    /// Encode into a zero padded packet
    pub fn encode(&self) -> Packet {
        let mut p = [0u8; PACKET_SIZE];
        p[0] = self.id() as u8;
        match self {
            Message::ConnectionData(m) => {
                p[0] |= m.payload.len() as u8 & LENGTH_MASK;
                if m.odd {
                    p[0] |= ODD_BIT;
                }
                p[1] = m.connection_id;
                p[2..2 + m.payload.len()].copy_from_slice(&m.payload);
            }
            Message::BroadcastData(m) => {
                p[0] |= m.payload.len() as u8 & LENGTH_MASK;
                p[1] = m.index;
                p[2..2 + m.payload.len()].copy_from_slice(&m.payload);
            }
            Message::Ping(m) => {
                p[1] = m.sender;
                p[2] = m.index;
                p[3..11].copy_from_slice(&m.user_id.to_le_bytes());
                put_str(&mut p[11..32], &m.user_name);
            }
            Message::ConnectionOpen(m) => {
                p[1] = m.sender;
                p[2] = m.request_id;
                p[3] = m.param;
            }
            Message::ConnectionAccept(m) => {
                p[1] = m.request_id;
                p[2] = m.response_id;
            }
            Message::ConnectionReject(m) => {
                p[1] = m.request_id;
                p[2..4].copy_from_slice(&m.reason.to_le_bytes());
                put_str(&mut p[4..32], &m.extra);
            }
            Message::ConnectionReceived(m) => {
                p[1] = m.connection_id;
                p[2] = m.length;
                p[3..7].copy_from_slice(&m.available.to_le_bytes());
            }
            Message::ConnectionClose(m) => {
                p[1] = m.connection_id;
                put_str(&mut p[2..31], &m.extra);
            }
            Message::BroadcastStart(m) => {
                p[1] = m.sender;
                p[2] = m.kind;
                p[3] = m.repeat_count;
            }
            Message::BroadcastEnd(m) => {
                p[1] = m.sender;
            }
            Message::DebugPrint(m) => {
                put_str(&mut p[1..32], &m.text);
            }
        }
        p
    }

    /// Decode a packet received from the medium
    pub fn decode(p: &Packet) -> Result<Self, DecodeError> {
        let id = MessageId::from_header(p[0])?;
        let msg = match id {
            MessageId::ConnectionData => {
                let len = payload_len(p[0])?;
                Message::ConnectionData(ConnectionData {
                    connection_id: p[1],
                    odd: p[0] & ODD_BIT != 0,
                    payload: truncated_bytes(&p[2..2 + len]),
                })
            }
            MessageId::BroadcastData => {
                let len = payload_len(p[0])?;
                Message::BroadcastData(BroadcastData {
                    index: p[1],
                    payload: truncated_bytes(&p[2..2 + len]),
                })
            }
            MessageId::Ping => Message::Ping(Ping {
                sender: p[1],
                index: p[2],
                user_id: u64::from_le_bytes([p[3], p[4], p[5], p[6], p[7], p[8], p[9], p[10]]),
                user_name: get_str(&p[11..32])?,
            }),
            MessageId::ConnectionOpen => Message::ConnectionOpen(ConnectionOpen {
                sender: p[1],
                request_id: p[2],
                param: p[3],
            }),
            MessageId::ConnectionAccept => Message::ConnectionAccept(ConnectionAccept {
                request_id: p[1],
                response_id: p[2],
            }),
            MessageId::ConnectionReject => Message::ConnectionReject(ConnectionReject {
                request_id: p[1],
                reason: u16::from_le_bytes([p[2], p[3]]),
                extra: get_str(&p[4..32])?,
            }),
            MessageId::ConnectionReceived => Message::ConnectionReceived(ConnectionReceived {
                connection_id: p[1],
                length: p[2],
                available: u32::from_le_bytes([p[3], p[4], p[5], p[6]]),
            }),
            MessageId::ConnectionClose => Message::ConnectionClose(ConnectionClose {
                connection_id: p[1],
                extra: get_str(&p[2..31])?,
            }),
            MessageId::BroadcastStart => Message::BroadcastStart(BroadcastStart {
                sender: p[1],
                kind: p[2],
                repeat_count: p[3],
            }),
            MessageId::BroadcastEnd => Message::BroadcastEnd(BroadcastEnd { sender: p[1] }),
            MessageId::DebugPrint => Message::DebugPrint(DebugPrint {
                text: get_str(&p[1..32])?,
            }),
        };
        Ok(msg)
    }
}

macro_rules! impl_from_message {
    ($($name:ident),* $(,)?) => {
        $(
            impl From<$name> for Message {
                fn from(m: $name) -> Self {
                    Message::$name(m)
                }
            }
        )*
    };
}

impl_from_message!(
    ConnectionData,
    BroadcastData,
    Ping,
    ConnectionOpen,
    ConnectionAccept,
    ConnectionReject,
    ConnectionReceived,
    ConnectionClose,
    BroadcastStart,
    BroadcastEnd,
    DebugPrint,
);

fn payload_len(header: u8) -> Result<usize, DecodeError> {
    let len = header & LENGTH_MASK;
    if len as usize > DATA_PAYLOAD_SIZE {
        return Err(DecodeError::InvalidLength(len));
    }
    Ok(len as usize)
}

fn truncated_bytes(data: &[u8]) -> Vec<u8, DATA_PAYLOAD_SIZE> {
    let len = data.len().min(DATA_PAYLOAD_SIZE);
    // cannot fail, length is capped above
    Vec::from_slice(&data[..len]).unwrap_or_default()
}

/// Longest prefix of `text` that fits, cut at a char boundary
fn truncated_str<const N: usize>(text: &str) -> String<N> {
    let mut out = String::new();
    for c in text.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Copies `text` into `dst`, keeping the last byte as terminator
fn put_str(dst: &mut [u8], text: &str) {
    let len = text.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&text.as_bytes()[..len]);
    dst[len..].fill(0);
}

fn get_str<const N: usize>(src: &[u8]) -> Result<String<N>, DecodeError> {
    let end = src
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(src.len())
        .min(N);
    let text = core::str::from_utf8(&src[..end]).map_err(|_| DecodeError::InvalidText)?;
    Ok(truncated_str(text))
}
