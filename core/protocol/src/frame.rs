//! Length-prefixed frame codec.
//!
//! Every frame is a 4-byte big-endian payload length followed by one JSON
//! encoded [`Frame`].

use std::io::{ErrorKind, Read, Write};

use crate::{ErrorCode, ErrorInfo, Frame};

pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024; // 64MB

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds maximum size")]
    TooLarge(usize),

    #[error("frame body was empty")]
    Empty,

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("frame was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// True when the peer sent bytes that do not form a valid frame, as
    /// opposed to the transport failing underneath us.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

impl From<&FrameError> for ErrorInfo {
    fn from(err: &FrameError) -> Self {
        ErrorInfo::new(ErrorCode::ProtocolError, err.to_string())
    }
}

/// Serializes a frame body, refusing bodies the peer would reject.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(frame)?;
    if body.is_empty() {
        return Err(FrameError::Empty);
    }
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(body.len()));
    }
    Ok(body)
}

/// Writes a body produced by [`encode_frame`] behind its length prefix.
pub fn write_encoded<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let body = encode_frame(frame)?;
    write_encoded(writer, &body)
}

/// Reads the next frame. Returns `Ok(None)` when the peer closed the
/// connection cleanly on a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(err)
        }
    })?;

    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Broadcast, Command, Request};
    use std::io::Cursor;

    #[test]
    fn reads_back_consecutive_frames() {
        let mut buffer = Vec::new();
        let first = Frame::Request(Request::new(1, Command::GetRepositories));
        let second = Frame::Broadcast(Broadcast::UserLeft {
            name: "bob".to_string(),
        });
        write_frame(&mut buffer, &first).unwrap();
        write_frame(&mut buffer, &second).unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(first));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(second));
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn oversized_body_is_refused_before_any_byte_is_written() {
        let mut buffer = Vec::new();
        let body = vec![b' '; MAX_FRAME_BYTES + 1];
        let err = write_encoded(&mut buffer, &body).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(len) if len == MAX_FRAME_BYTES + 1));
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut cursor = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn rejects_zero_length_frame() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).unwrap_err(),
            FrameError::Empty
        ));
    }

    #[test]
    fn detects_truncated_body() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{\"fr");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor).unwrap_err(),
            FrameError::Truncated
        ));
    }

    #[test]
    fn detects_truncated_header() {
        let mut cursor = Cursor::new(vec![0u8, 0u8]);
        assert!(matches!(
            read_frame(&mut cursor).unwrap_err(),
            FrameError::Truncated
        ));
    }

    #[test]
    fn rejects_garbage_body() {
        let body = b"not json";
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        let mut cursor = Cursor::new(bytes);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
        assert_eq!(ErrorInfo::from(&err).code, ErrorCode::ProtocolError);
    }
}
