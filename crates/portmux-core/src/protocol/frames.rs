//! PortMux frame types and wire constants.
//!
//! Every message on the shared link is one frame: a 4-byte header
//! (`command: u16`, `payload_length: u16`, both big-endian) followed by
//! `payload_length` payload bytes.

use thiserror::Error;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Total size of the frame header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Maximum payload length that fits the 16-bit length field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Maximum forwarded-data bytes in one `DATA` frame: the payload begins with
/// a 2-byte connection id, leaving the rest for socket data.
pub const MAX_DATA_CHUNK: usize = MAX_PAYLOAD - 2;

// ── Command codes ─────────────────────────────────────────────────────────────

/// All command codes defined by the wire protocol.
///
/// | Command    | Payload                         | Direction    |
/// |------------|---------------------------------|--------------|
/// | Connect    | connection id (u16)             | sent to peer |
/// | Disconnect | connection id (u16)             | either       |
/// | Data       | connection id (u16) ++ data     | either       |
/// | LinkUp     | remote port (u32)               | sent to peer |
/// | Terminate  | (empty)                         | either       |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Connect = 0x0101,
    Disconnect = 0x0201,
    Data = 0x0301,
    LinkUp = 0x0401,
    Terminate = 0x050F,
}

impl TryFrom<u16> for Command {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        match value {
            0x0101 => Ok(Command::Connect),
            0x0201 => Ok(Command::Disconnect),
            0x0301 => Ok(Command::Data),
            0x0401 => Ok(Command::LinkUp),
            0x050F => Ok(Command::Terminate),
            _ => Err(()),
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// Error raised when building a frame whose payload exceeds the wire limit.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte frame limit")]
pub struct PayloadTooLarge(pub usize);

/// One complete protocol message: a command plus its payload.
///
/// Constructed via the typed helpers ([`Frame::connect`], [`Frame::data`],
/// …) so header layout knowledge stays inside this module; the accessors
/// ([`Frame::connection_id`], [`Frame::data_payload`], …) perform the
/// reverse extraction on received frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a `CONNECT` frame announcing a newly accepted connection.
    pub fn connect(id: u16) -> Self {
        Self {
            command: Command::Connect,
            payload: id.to_be_bytes().to_vec(),
        }
    }

    /// Builds a `DISCONNECT` frame releasing a connection id.
    pub fn disconnect(id: u16) -> Self {
        Self {
            command: Command::Disconnect,
            payload: id.to_be_bytes().to_vec(),
        }
    }

    /// Builds a `DATA` frame carrying forwarded socket bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadTooLarge`] if `data` exceeds [`MAX_DATA_CHUNK`].
    pub fn data(id: u16, data: &[u8]) -> Result<Self, PayloadTooLarge> {
        if data.len() > MAX_DATA_CHUNK {
            return Err(PayloadTooLarge(data.len() + 2));
        }
        let mut payload = Vec::with_capacity(2 + data.len());
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(data);
        Ok(Self {
            command: Command::Data,
            payload,
        })
    }

    /// Builds a `LINK_UP` frame announcing the configured remote port.
    pub fn link_up(remote_port: u32) -> Self {
        Self {
            command: Command::LinkUp,
            payload: remote_port.to_be_bytes().to_vec(),
        }
    }

    /// Builds an empty `TERMINATE` frame.
    pub fn terminate() -> Self {
        Self {
            command: Command::Terminate,
            payload: Vec::new(),
        }
    }

    /// Extracts the leading connection id from a `CONNECT`, `DISCONNECT`, or
    /// `DATA` payload.  `None` if the payload is too short to carry one.
    pub fn connection_id(&self) -> Option<u16> {
        let bytes = self.payload.get(0..2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// The forwarded socket bytes of a `DATA` frame (payload minus the id).
    pub fn data_payload(&self) -> &[u8] {
        self.payload.get(2..).unwrap_or(&[])
    }

    /// Extracts the remote-port hint from a `LINK_UP` payload.
    pub fn remote_port(&self) -> Option<u32> {
        let bytes = self.payload.get(0..4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_match_wire_values() {
        assert_eq!(Command::Connect as u16, 0x0101);
        assert_eq!(Command::Disconnect as u16, 0x0201);
        assert_eq!(Command::Data as u16, 0x0301);
        assert_eq!(Command::LinkUp as u16, 0x0401);
        assert_eq!(Command::Terminate as u16, 0x050F);
    }

    #[test]
    fn test_command_try_from_rejects_unknown_code() {
        assert!(Command::try_from(0x0000).is_err());
        assert!(Command::try_from(0xFFFF).is_err());
    }

    #[test]
    fn test_connect_frame_carries_id_in_payload() {
        let frame = Frame::connect(0x1234);
        assert_eq!(frame.command, Command::Connect);
        assert_eq!(frame.payload, vec![0x12, 0x34]);
        assert_eq!(frame.connection_id(), Some(0x1234));
    }

    #[test]
    fn test_data_frame_prefixes_id_before_bytes() {
        let frame = Frame::data(7, b"ping").unwrap();
        assert_eq!(frame.connection_id(), Some(7));
        assert_eq!(frame.data_payload(), b"ping");
        assert_eq!(frame.payload.len(), 6);
    }

    #[test]
    fn test_data_frame_rejects_oversized_chunk() {
        let big = vec![0u8; MAX_DATA_CHUNK + 1];
        assert!(Frame::data(0, &big).is_err());
    }

    #[test]
    fn test_data_frame_accepts_maximum_chunk() {
        let max = vec![0u8; MAX_DATA_CHUNK];
        let frame = Frame::data(0, &max).unwrap();
        assert_eq!(frame.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_link_up_frame_round_trips_port() {
        let frame = Frame::link_up(8000);
        assert_eq!(frame.payload.len(), 4);
        assert_eq!(frame.remote_port(), Some(8000));
    }

    #[test]
    fn test_terminate_frame_has_empty_payload() {
        let frame = Frame::terminate();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.connection_id(), None);
    }

    #[test]
    fn test_accessors_tolerate_short_payloads() {
        let frame = Frame {
            command: Command::Data,
            payload: vec![0x01],
        };
        assert_eq!(frame.connection_id(), None);
        assert_eq!(frame.data_payload(), b"");
        assert_eq!(frame.remote_port(), None);
    }
}
