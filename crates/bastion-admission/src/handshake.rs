//! Handshake validation.
//!
//! The protected servers speak the Java-edition game protocol, whose first
//! packet is a length-prefixed handshake:
//!
//! ```text
//! VarInt frame_length
//!   VarInt packet_id        (0x00)
//!   VarInt protocol_version
//!   String server_address   (VarInt byte length + UTF-8)
//!   u16    server_port      (big endian)
//!   VarInt next_state       (1 status, 2 login, 3 transfer)
//! ```
//!
//! [`HandshakeValidator`] is a pure function of the buffered bytes. The only
//! per-connection state is the [`HandshakeCursor`] that accumulates them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::config::HandshakeConfig;

/// Maximum encoded length of a VarInt.
const MAX_VARINT_LEN: usize = 5;

/// Handshake packet id.
const HANDSHAKE_PACKET_ID: i32 = 0x00;

/// First byte of a legacy (pre-netty) server list ping.
const LEGACY_PING: u8 = 0xFE;

/// Read chunk size while waiting for the handshake.
const READ_CHUNK: usize = 256;

/// Session state requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextState {
    /// Server list ping.
    Status,
    /// Player login.
    Login,
    /// Transfer from another server.
    Transfer,
}

impl NextState {
    /// Decode the wire value.
    #[must_use]
    pub const fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Self::Status),
            2 => Some(Self::Login),
            3 => Some(Self::Transfer),
            _ => None,
        }
    }

    /// Wire value.
    #[must_use]
    pub const fn id(self) -> i32 {
        match self {
            Self::Status => 1,
            Self::Login => 2,
            Self::Transfer => 3,
        }
    }
}

impl fmt::Display for NextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => f.write_str("status"),
            Self::Login => f.write_str("login"),
            Self::Transfer => f.write_str("transfer"),
        }
    }
}

/// Reasons a handshake fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The frame (or the bytes received so far) is larger than the budget.
    #[error("handshake exceeds the {limit}-byte budget")]
    ByteBudgetExceeded {
        /// Configured byte budget.
        limit: usize,
    },

    /// The handshake did not arrive in time.
    #[error("handshake not received within {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection mid-handshake.
    #[error("connection closed before handshake completed")]
    ConnectionClosed,

    /// Reading from the peer failed.
    #[error("read failed: {0}")]
    Io(std::io::ErrorKind),

    /// The buffer ends before the handshake does.
    #[error("handshake truncated")]
    Truncated,

    /// A VarInt ran past five bytes.
    #[error("varint longer than {MAX_VARINT_LEN} bytes")]
    VarIntTooLong,

    /// Frame length is zero or negative.
    #[error("invalid frame length {0}")]
    InvalidLength(i32),

    /// First packet is not a handshake.
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacketId(i32),

    /// Protocol version is outside the accepted range.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(i32),

    /// Server address is empty, too long, or not UTF-8.
    #[error("invalid server address: {0}")]
    InvalidAddress(&'static str),

    /// Next state is not a known value.
    #[error("invalid next state {0}")]
    InvalidNextState(i32),

    /// Next state is known but not permitted.
    #[error("next state {0} is not allowed")]
    DisallowedNextState(NextState),

    /// The frame holds bytes after the last field.
    #[error("{0} trailing bytes inside handshake frame")]
    TrailingBytes(usize),

    /// Legacy server list ping.
    #[error("legacy server list ping")]
    LegacyPing,
}

impl HandshakeError {
    /// The peer went away rather than sending something invalid.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}

/// A parsed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Client protocol version.
    pub protocol_version: i32,
    /// Address the client dialed, including any forwarding markers.
    pub server_address: String,
    /// Port the client dialed.
    pub server_port: u16,
    /// Requested session state.
    pub next_state: NextState,
    /// Bytes the frame occupied, including its length prefix.
    pub frame_len: usize,
}

impl Handshake {
    /// Build a handshake. `frame_len` is computed from the encoding.
    #[must_use]
    pub fn new(
        protocol_version: i32,
        server_address: impl Into<String>,
        server_port: u16,
        next_state: NextState,
    ) -> Self {
        let mut handshake = Self {
            protocol_version,
            server_address: server_address.into(),
            server_port,
            next_state,
            frame_len: 0,
        };
        handshake.frame_len = handshake.to_bytes().len();
        handshake
    }

    /// Host portion of the address, without forwarding markers.
    #[must_use]
    pub fn host(&self) -> &str {
        self.server_address
            .split('\0')
            .next()
            .unwrap_or_default()
            .trim_end_matches('.')
    }

    /// Whether a mod loader or proxy appended NUL-separated markers.
    #[must_use]
    pub fn has_forwarding_markers(&self) -> bool {
        self.server_address.contains('\0')
    }

    /// Encode this handshake as a framed packet.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.server_address.len() + 16);
        write_varint(&mut body, HANDSHAKE_PACKET_ID);
        write_varint(&mut body, self.protocol_version);
        write_varint(&mut body, self.server_address.len() as i32);
        body.extend_from_slice(self.server_address.as_bytes());
        body.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(&mut body, self.next_state.id());

        let mut frame = Vec::with_capacity(body.len() + MAX_VARINT_LEN);
        write_varint(&mut frame, body.len() as i32);
        frame.extend_from_slice(&body);
        frame
    }
}

/// Outcome of validating a handshake.
pub type HandshakeResult = Result<Handshake, HandshakeError>;

/// Append a VarInt to `out`.
pub fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            out.push(value as u8);
            return;
        }
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

enum ReadError {
    Incomplete,
    TooLong,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn byte(&mut self) -> Result<u8, ReadError> {
        let byte = *self.buf.get(self.pos).ok_or(ReadError::Incomplete)?;
        self.pos += 1;
        Ok(byte)
    }

    fn varint(&mut self) -> Result<i32, ReadError> {
        let mut value: u32 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.byte()?;
            value |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(ReadError::TooLong)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < len {
            return Err(ReadError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u16_be(&mut self) -> Result<u16, ReadError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

impl From<ReadError> for HandshakeError {
    fn from(err: ReadError) -> Self {
        match err {
            // Inside a complete frame, running out of bytes means the
            // declared length lied.
            ReadError::Incomplete => Self::Truncated,
            ReadError::TooLong => Self::VarIntTooLong,
        }
    }
}

/// Validates handshakes against the configured protocol constraints.
#[derive(Debug, Clone)]
pub struct HandshakeValidator {
    config: HandshakeConfig,
}

impl HandshakeValidator {
    /// Create a validator.
    #[must_use]
    pub const fn new(config: HandshakeConfig) -> Self {
        Self { config }
    }

    /// Validator configuration.
    #[must_use]
    pub const fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Validate a buffer that should hold a complete handshake.
    ///
    /// Bytes after the handshake frame are ignored.
    pub fn validate(&self, initial: &[u8]) -> HandshakeResult {
        self.try_parse(initial)?.ok_or(HandshakeError::Truncated)
    }

    /// Validate as much as `buf` allows.
    ///
    /// Returns `Ok(None)` when more bytes are needed and nothing seen so far
    /// is invalid.
    pub fn try_parse(&self, buf: &[u8]) -> Result<Option<Handshake>, HandshakeError> {
        if buf.first() == Some(&LEGACY_PING) {
            return Err(HandshakeError::LegacyPing);
        }

        let limit = self.config.max_bytes;
        let mut reader = Reader::new(buf);
        let frame_len = match reader.varint() {
            Ok(len) => len,
            Err(ReadError::Incomplete) => {
                return if buf.len() >= limit {
                    Err(HandshakeError::ByteBudgetExceeded { limit })
                } else {
                    Ok(None)
                };
            }
            Err(ReadError::TooLong) => return Err(HandshakeError::VarIntTooLong),
        };

        if frame_len <= 0 {
            return Err(HandshakeError::InvalidLength(frame_len));
        }

        let header_len = reader.pos;
        let total = header_len + frame_len as usize;
        if total > limit {
            return Err(HandshakeError::ByteBudgetExceeded { limit });
        }

        let Ok(frame) = reader.bytes(frame_len as usize) else {
            return Ok(None);
        };

        self.parse_frame(frame, total).map(Some)
    }

    fn parse_frame(&self, frame: &[u8], frame_len: usize) -> HandshakeResult {
        let mut reader = Reader::new(frame);

        let packet_id = reader.varint()?;
        if packet_id != HANDSHAKE_PACKET_ID {
            return Err(HandshakeError::UnexpectedPacketId(packet_id));
        }

        let protocol_version = reader.varint()?;
        if self
            .config
            .min_protocol_version
            .is_some_and(|min| protocol_version < min)
            || self
                .config
                .max_protocol_version
                .is_some_and(|max| protocol_version > max)
        {
            return Err(HandshakeError::UnsupportedVersion(protocol_version));
        }

        let address_len = reader.varint()?;
        if address_len <= 0 {
            return Err(HandshakeError::InvalidAddress("empty"));
        }
        if address_len as usize > self.config.max_address_len {
            return Err(HandshakeError::InvalidAddress("too long"));
        }
        let address_bytes = reader.bytes(address_len as usize)?;
        let server_address = std::str::from_utf8(address_bytes)
            .map_err(|_| HandshakeError::InvalidAddress("not utf-8"))?
            .to_string();

        let server_port = reader.u16_be()?;

        let next_state_id = reader.varint()?;
        let next_state = NextState::from_id(next_state_id)
            .ok_or(HandshakeError::InvalidNextState(next_state_id))?;
        if !self.config.allowed_next_states.contains(&next_state) {
            return Err(HandshakeError::DisallowedNextState(next_state));
        }

        if reader.remaining() > 0 {
            return Err(HandshakeError::TrailingBytes(reader.remaining()));
        }

        Ok(Handshake {
            protocol_version,
            server_address,
            server_port,
            next_state,
            frame_len,
        })
    }
}

impl Default for HandshakeValidator {
    fn default() -> Self {
        Self::new(HandshakeConfig::default())
    }
}

/// Bytes received from one connection while waiting for its handshake.
#[derive(Debug, Default)]
pub struct HandshakeCursor {
    buf: Vec<u8>,
}

impl HandshakeCursor {
    /// Create an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered so far.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the buffered bytes for forwarding.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Read from `stream` until a handshake validates, fails, or times out.
///
/// Never reads past the byte budget; anything the client sent after the
/// budget stays in the socket.
pub async fn read_handshake<S>(
    stream: &mut S,
    validator: &HandshakeValidator,
    cursor: &mut HandshakeCursor,
) -> HandshakeResult
where
    S: AsyncRead + Unpin,
{
    let timeout = validator.config().timeout();
    let limit = validator.config().max_bytes;

    let read = async {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(handshake) = validator.try_parse(cursor.buffered())? {
                return Ok(handshake);
            }
            if cursor.len() >= limit {
                return Err(HandshakeError::ByteBudgetExceeded { limit });
            }

            let want = (limit - cursor.len()).min(READ_CHUNK);
            let n = stream
                .read(&mut chunk[..want])
                .await
                .map_err(|e| HandshakeError::Io(e.kind()))?;
            if n == 0 {
                return Err(HandshakeError::ConnectionClosed);
            }
            cursor.extend(&chunk[..n]);
            debug!(received = n, buffered = cursor.len(), "Handshake bytes received");
        }
    };

    tokio::time::timeout(timeout, read)
        .await
        .unwrap_or(Err(HandshakeError::Timeout(timeout)))
}

/// Resolve once the peer closes `stream` or a read fails.
///
/// Anything the peer sends meanwhile is appended to `cursor`, up to `limit`
/// buffered bytes. Past that nothing more is read and the future never
/// resolves. Cancel-safe: dropping it loses no bytes.
pub async fn watch_closed<S>(stream: &mut S, cursor: &mut HandshakeCursor, limit: usize)
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let want = limit.saturating_sub(cursor.len()).min(READ_CHUNK);
        if want == 0 {
            return std::future::pending().await;
        }
        match stream.read(&mut chunk[..want]).await {
            Ok(0) | Err(_) => return,
            Ok(n) => cursor.extend(&chunk[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn login(version: i32) -> Vec<u8> {
        Handshake::new(version, "play.example.net", 25565, NextState::Login).to_bytes()
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, body.len() as i32);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_valid_handshake() {
        let validator = HandshakeValidator::default();
        let bytes = login(767);

        let handshake = validator.validate(&bytes).unwrap();
        assert_eq!(handshake.protocol_version, 767);
        assert_eq!(handshake.server_address, "play.example.net");
        assert_eq!(handshake.server_port, 25565);
        assert_eq!(handshake.next_state, NextState::Login);
        assert_eq!(handshake.frame_len, bytes.len());
    }

    #[test]
    fn test_trailing_packet_is_not_part_of_frame() {
        let validator = HandshakeValidator::default();
        let mut bytes = login(767);
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[0x05, 0x00, 0x03, b'b', b'o', b'b']);

        let handshake = validator.validate(&bytes).unwrap();
        assert_eq!(handshake.frame_len, frame_len);
    }

    #[test]
    fn test_try_parse_incomplete() {
        let validator = HandshakeValidator::default();
        let bytes = login(767);

        for cut in 0..bytes.len() {
            assert_eq!(validator.try_parse(&bytes[..cut]), Ok(None), "cut at {cut}");
        }
        assert!(validator.try_parse(&bytes).unwrap().is_some());
        assert_eq!(validator.validate(&bytes[..4]), Err(HandshakeError::Truncated));
    }

    #[test]
    fn test_varint_encoding() {
        let cases: [(i32, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (300, &[0xac, 0x02]),
            (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
        ];
        for (value, expected) in cases {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            assert_eq!(out, expected, "value {value}");
            assert_eq!(Reader::new(expected).varint().ok(), Some(value));
        }
    }

    #[test]
    fn test_byte_budget_declared_length() {
        let validator = HandshakeValidator::new(HandshakeConfig {
            max_bytes: 16,
            ..HandshakeConfig::default()
        });
        // Only the length prefix has arrived, but it already exceeds the budget.
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 200);

        assert_eq!(
            validator.try_parse(&bytes),
            Err(HandshakeError::ByteBudgetExceeded { limit: 16 })
        );
    }

    #[test]
    fn test_byte_budget_real_handshake() {
        let bytes = login(767);
        let validator = HandshakeValidator::new(HandshakeConfig {
            max_bytes: bytes.len() - 1,
            ..HandshakeConfig::default()
        });

        assert!(matches!(
            validator.validate(&bytes),
            Err(HandshakeError::ByteBudgetExceeded { .. })
        ));
    }

    #[test_case(&[0xFE, 0x01] => HandshakeError::LegacyPing ; "legacy ping")]
    #[test_case(&[0x00] => HandshakeError::InvalidLength(0) ; "zero length")]
    #[test_case(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01] => HandshakeError::VarIntTooLong ; "overlong varint")]
    #[test_case(&[0x02, 0x01, 0x00] => HandshakeError::UnexpectedPacketId(1) ; "wrong packet id")]
    #[test_case(&[0x03, 0x00, 0x01, 0x00] => HandshakeError::InvalidAddress("empty") ; "empty address")]
    #[test_case(&[0x04, 0x00, 0x01, 0x05, b'a'] => HandshakeError::Truncated ; "address shorter than declared")]
    fn test_malformed(bytes: &[u8]) -> HandshakeError {
        HandshakeValidator::default().validate(bytes).unwrap_err()
    }

    #[test]
    fn test_invalid_utf8_address() {
        let body = [0x00, 0x01, 0x02, 0xc3, 0x28, 0x63, 0xdd, 0x02];
        let err = HandshakeValidator::default().validate(&frame(&body)).unwrap_err();
        assert_eq!(err, HandshakeError::InvalidAddress("not utf-8"));
    }

    #[test]
    fn test_trailing_bytes_inside_frame() {
        let mut body = Handshake::new(767, "a", 1, NextState::Status).to_bytes();
        // Strip the length prefix, append junk, re-frame.
        body.remove(0);
        body.push(0x42);
        let err = HandshakeValidator::default().validate(&frame(&body)).unwrap_err();
        assert_eq!(err, HandshakeError::TrailingBytes(1));
    }

    #[test_case(9 => Err(HandshakeError::InvalidNextState(9)) ; "unknown next state")]
    #[test_case(3 => Err(HandshakeError::DisallowedNextState(NextState::Transfer)) ; "transfer disabled")]
    #[test_case(2 => Ok(NextState::Login) ; "login allowed")]
    fn test_next_state(id: i32) -> Result<NextState, HandshakeError> {
        let validator = HandshakeValidator::new(HandshakeConfig {
            allowed_next_states: vec![NextState::Status, NextState::Login],
            ..HandshakeConfig::default()
        });
        let mut body = vec![0x00, 0x01, 0x01, b'a', 0x63, 0xdd];
        write_varint(&mut body, id);
        validator.validate(&frame(&body)).map(|h| h.next_state)
    }

    #[test_case(46 => false ; "below range")]
    #[test_case(47 => true ; "lower bound")]
    #[test_case(800 => true ; "upper bound")]
    #[test_case(801 => false ; "above range")]
    fn test_protocol_range(version: i32) -> bool {
        let validator = HandshakeValidator::new(HandshakeConfig {
            min_protocol_version: Some(47),
            max_protocol_version: Some(800),
            ..HandshakeConfig::default()
        });
        validator.validate(&login(version)).is_ok()
    }

    #[test]
    fn test_address_length_limit() {
        let validator = HandshakeValidator::new(HandshakeConfig {
            max_address_len: 8,
            ..HandshakeConfig::default()
        });
        let bytes = Handshake::new(767, "much.too.long.example", 25565, NextState::Login).to_bytes();
        assert_eq!(
            validator.validate(&bytes),
            Err(HandshakeError::InvalidAddress("too long"))
        );
    }

    #[test]
    fn test_host_strips_forwarding_markers() {
        let handshake = Handshake::new(767, "play.example.net.\0FML3\0", 25565, NextState::Login);
        assert!(handshake.has_forwarding_markers());
        assert_eq!(handshake.host(), "play.example.net");
    }

    #[tokio::test]
    async fn test_read_handshake_split_across_reads() {
        let bytes = login(767);
        let (head, tail) = bytes.split_at(5);
        let mut stream = tokio_test::io::Builder::new().read(head).read(tail).build();

        let validator = HandshakeValidator::default();
        let mut cursor = HandshakeCursor::new();
        let handshake = read_handshake(&mut stream, &validator, &mut cursor).await.unwrap();

        assert_eq!(handshake.protocol_version, 767);
        assert_eq!(cursor.buffered(), bytes.as_slice());
    }

    #[tokio::test]
    async fn test_read_handshake_connection_closed() {
        let bytes = login(767);
        let mut stream = tokio_test::io::Builder::new().read(&bytes[..3]).build();

        let mut cursor = HandshakeCursor::new();
        let result = read_handshake(&mut stream, &HandshakeValidator::default(), &mut cursor).await;
        assert_eq!(result, Err(HandshakeError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_handshake_timeout() {
        let bytes = login(767);
        let mut stream = tokio_test::io::Builder::new()
            .read(&bytes[..3])
            .wait(Duration::from_secs(60))
            .build();

        let validator = HandshakeValidator::new(HandshakeConfig {
            timeout_ms: 1_000,
            ..HandshakeConfig::default()
        });
        let mut cursor = HandshakeCursor::new();
        let result = read_handshake(&mut stream, &validator, &mut cursor).await;
        assert_eq!(result, Err(HandshakeError::Timeout(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn test_read_handshake_never_reads_past_budget() {
        let validator = HandshakeValidator::new(HandshakeConfig {
            max_bytes: 4,
            ..HandshakeConfig::default()
        });
        // Incomplete length prefix that keeps going.
        let mut stream = tokio_test::io::Builder::new().read(&[0x80, 0x80, 0x80, 0x80]).build();

        let mut cursor = HandshakeCursor::new();
        let result = read_handshake(&mut stream, &validator, &mut cursor).await;
        assert_eq!(result, Err(HandshakeError::ByteBudgetExceeded { limit: 4 }));
        assert_eq!(cursor.len(), 4);
    }

    #[test]
    fn test_disconnect_errors() {
        assert!(HandshakeError::ConnectionClosed.is_disconnect());
        assert!(HandshakeError::Io(std::io::ErrorKind::ConnectionReset).is_disconnect());
        assert!(!HandshakeError::Timeout(Duration::from_secs(1)).is_disconnect());
        assert!(!HandshakeError::LegacyPing.is_disconnect());
    }

    #[tokio::test]
    async fn test_watch_closed_buffers_until_eof() {
        let mut stream = tokio_test::io::Builder::new().read(b"abc").read(b"de").build();
        let mut cursor = HandshakeCursor::new();

        watch_closed(&mut stream, &mut cursor, 512).await;
        assert_eq!(cursor.buffered(), b"abcde");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_closed_stops_reading_at_limit() {
        let mut stream = tokio_test::io::Builder::new().read(&[1, 2, 3, 4]).build();
        let mut cursor = HandshakeCursor::new();
        cursor.extend(&[0]);

        let watched = tokio::time::timeout(
            Duration::from_secs(60),
            watch_closed(&mut stream, &mut cursor, 5),
        )
        .await;
        assert!(watched.is_err(), "a full cursor must not resolve");
        assert_eq!(cursor.buffered(), &[0, 1, 2, 3, 4]);
    }
}
