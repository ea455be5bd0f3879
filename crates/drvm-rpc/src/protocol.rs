//! Wire framing for host ↔ guest control messages.
//!
//! ```text
//! offset 0  : 4 bytes  magic = "DRVM"
//! offset 4  : 1 byte   version = 1
//! offset 5  : 1 byte   type (1=REQUEST, 2=RESPONSE, 3=NOTIFICATION)
//! offset 6  : 4 bytes  payload length, big-endian u32
//! offset 10 : N bytes  UTF-8 JSON object
//! ```

use std::io::{self, Read, Write};

use serde_json::{Map, Value};

use crate::error::ProtocolError;

pub const MAGIC: [u8; 4] = *b"DRVM";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 10;

/// Upper bound on a single payload. A corrupt length field must not be able
/// to make a reader allocate gigabytes.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    Notification = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Notification),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Magic and version, the part of the header that identifies a DRVM frame.
fn check_preamble(header: &[u8]) -> Result<(), ProtocolError> {
    let magic = [header[0], header[1], header[2], header[3]];
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    if header[4] != VERSION {
        return Err(ProtocolError::BadVersion(header[4]));
    }
    Ok(())
}

/// Payload length as declared by a header, before any validation.
pub fn declared_length(header: &[u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes([header[6], header[7], header[8], header[9]])
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Map<String, Value>) -> Self {
        Message { msg_type, payload }
    }

    /// Build a `{"method": .., "params": ..}` request.
    pub fn request(method: &str, params: Map<String, Value>) -> Self {
        let mut payload = Map::new();
        payload.insert("method".into(), Value::String(method.to_string()));
        payload.insert("params".into(), Value::Object(params));
        Message::new(MessageType::Request, payload)
    }

    pub fn response(payload: Map<String, Value>) -> Self {
        Message::new(MessageType::Response, payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = serde_json::to_vec(&self.payload).map_err(ProtocolError::InvalidPayload)?;
        if body.len() > MAX_PAYLOAD_LEN as usize {
            return Err(ProtocolError::PayloadTooLarge(body.len() as u64));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(self.msg_type as u8);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode one complete frame. Bytes past the declared payload are ignored.
    ///
    /// Magic and version are checked before the payload is looked at, so a
    /// foreign frame is rejected even if it carries valid JSON.
    pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }

        check_preamble(buf)?;
        let msg_type = MessageType::try_from(buf[5])?;

        let length = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if length > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(length as u64));
        }
        let end = HEADER_LEN + length as usize;
        if buf.len() < end {
            return Err(ProtocolError::Truncated {
                needed: end,
                got: buf.len(),
            });
        }

        let value: Value =
            serde_json::from_slice(&buf[HEADER_LEN..end]).map_err(ProtocolError::InvalidPayload)?;
        match value {
            Value::Object(payload) => Ok(Message { msg_type, payload }),
            _ => Err(ProtocolError::NotAnObject),
        }
    }
}

/// Read one raw frame (header plus declared payload). Only the preamble and
/// the length cap are checked here; [`Message::decode`] does the rest.
///
/// A frame with a foreign magic or version is consumed and reported as
/// [`ProtocolError::is_foreign_frame`], whatever length it declares.
/// Returns `Ok(None)` on a clean end of stream before the first header byte.
/// Short reads are retried until the declared length has arrived; the
/// stream's read timeout bounds the wait.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            needed: HEADER_LEN,
            got,
        });
    }

    let length = declared_length(&header);
    if let Err(e) = check_preamble(&header) {
        // Skip the foreign payload without buffering it so the stream stays
        // aligned on the next header.
        io::copy(&mut reader.by_ref().take(u64::from(length)), &mut io::sink())?;
        return Err(e);
    }
    if length > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(length as u64));
    }

    let mut frame = vec![0u8; HEADER_LEN + length as usize];
    frame[..HEADER_LEN].copy_from_slice(&header);
    let got = read_full(reader, &mut frame[HEADER_LEN..])?;
    if got < length as usize {
        return Err(ProtocolError::Truncated {
            needed: length as usize,
            got,
        });
    }
    Ok(Some(frame))
}

pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    match read_frame(reader)? {
        Some(frame) => Message::decode(&frame).map(Some),
        None => Ok(None),
    }
}

pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    let bytes = message.encode()?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    /// Hands out at most `chunk` bytes per read, like a slow socket.
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let msg = Message::new(MessageType::Response, object(json!({"success": true})));
        let bytes = msg.encode().unwrap();
        let body = br#"{"success":true}"#;

        assert_eq!(&bytes[..4], b"DRVM");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 2);
        assert_eq!(&bytes[6..10], &(body.len() as u32).to_be_bytes());
        assert_eq!(&bytes[10..], body);
    }

    #[test]
    fn decode_inverts_encode() {
        let msg = Message::request(
            "install_driver",
            object(json!({"device_id": "PCI\\VEN_8086\\DEV_1234", "note": "ünïcode"})),
        );
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn length_counts_utf8_bytes() {
        let msg = Message::response(object(json!({"name": "äöü"})));
        let bytes = msg.encode().unwrap();
        let length = declared_length(bytes[..HEADER_LEN].try_into().unwrap());
        assert_eq!(length as usize, bytes.len() - HEADER_LEN);
        assert!(length as usize > r#"{"name":"aou"}"#.len());
    }

    #[test]
    fn rejects_bad_magic_even_with_valid_payload() {
        let mut bytes = Message::response(object(json!({"ok": 1}))).encode().unwrap();
        bytes[..4].copy_from_slice(b"XXXX");
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::BadMagic(m)) if &m == b"XXXX"
        ));
    }

    #[test]
    fn rejects_bad_version_before_parsing_json() {
        let mut bytes = vec![];
        bytes.extend_from_slice(b"DRVM");
        bytes.push(2);
        bytes.push(1);
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(b"{{{");
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::BadVersion(2))
        ));
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(
            Message::decode(b"DRVM\x01\x01\x00"),
            Err(ProtocolError::Truncated { needed: 10, got: 7 })
        ));

        let bytes = Message::response(object(json!({"a": 1}))).encode().unwrap();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_type_and_non_object_payloads() {
        let mut bytes = Message::response(Map::new()).encode().unwrap();
        bytes[5] = 9;
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::UnknownType(9))
        ));

        let mut bytes = b"DRVM\x01\x02".to_vec();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"[]");
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn read_frame_accumulates_across_short_reads() {
        let msg = Message::request("get_status", Map::new());
        let bytes = msg.encode().unwrap();
        let mut reader = Trickle {
            data: &bytes,
            chunk: 3,
        };
        assert_eq!(read_message(&mut reader).unwrap(), Some(msg));
        assert_eq!(read_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn read_frame_reports_stream_cut_mid_payload() {
        let bytes = Message::request("get_status", Map::new()).encode().unwrap();
        let mut reader = &bytes[..bytes.len() - 2];
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn foreign_frame_is_skipped_before_length_cap() {
        let mut bytes = b"XXXX\x01\x01".to_vec();
        bytes.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        bytes.extend_from_slice(b"junk");
        let next = Message::request("get_status", Map::new());
        let mut reader = &bytes[..];

        let err = read_frame(&mut reader).unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic(m) if &m == b"XXXX"));
        assert!(err.is_foreign_frame());

        let mut bytes = b"DRVM\x07\x01".to_vec();
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(b"junk");
        bytes.extend_from_slice(&next.encode().unwrap());
        let mut reader = &bytes[..];
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtocolError::BadVersion(7))
        ));
        assert_eq!(read_message(&mut reader).unwrap(), Some(next));
    }

    #[test]
    fn read_frame_refuses_oversized_length() {
        let mut bytes = b"DRVM\x01\x01".to_vec();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = &bytes[..];
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }
}
