//! Content-Length framing of envelopes
//!
//! Each envelope travels as one frame:
//!
//! ```text
//! Content-Length: 62\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"host/msg","params":{"type":1,"reqId":-1,"payload":null}}
//! ```
//!
//! The body is a JSON-RPC notification whose method names the direction of
//! travel and whose params hold the envelope.

use crate::envelope::Envelope;
use crate::error::{RpcError, RpcResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Which end of the channel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The editor process that spawned the plugin host
    Host,
    /// The child process running plugin code
    PluginHost,
}

impl Side {
    /// Notification method used for envelopes this side sends
    pub fn outgoing_method(self) -> &'static str {
        match self {
            Side::Host => "ext/msg",
            Side::PluginHost => "host/msg",
        }
    }

    /// Notification method expected on envelopes this side receives
    pub fn incoming_method(self) -> &'static str {
        match self {
            Side::Host => "host/msg",
            Side::PluginHost => "ext/msg",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Notification {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Encode an envelope into a complete frame
pub fn encode_frame(envelope: &Envelope, side: Side) -> RpcResult<Vec<u8>> {
    let notification = Notification {
        jsonrpc: "2.0".to_string(),
        method: side.outgoing_method().to_string(),
        params: serde_json::to_value(envelope)
            .map_err(|e| RpcError::protocol(format!("Failed to encode envelope: {}", e)))?,
    };
    let content = serde_json::to_vec(&notification)
        .map_err(|e| RpcError::protocol(format!("Failed to encode frame: {}", e)))?;

    let mut frame = format!("Content-Length: {}\r\n\r\n", content.len()).into_bytes();
    frame.extend_from_slice(&content);
    Ok(frame)
}

/// Decode a frame body received by `side`
pub fn decode_body(body: &[u8], side: Side) -> RpcResult<Envelope> {
    let notification: Notification = serde_json::from_slice(body)
        .map_err(|e| RpcError::protocol(format!("Failed to parse JSON: {}", e)))?;

    if notification.method != side.incoming_method() {
        return Err(RpcError::protocol(format!(
            "Unexpected notification method '{}' (expected '{}')",
            notification.method,
            side.incoming_method()
        )));
    }

    serde_json::from_value(notification.params)
        .map_err(|e| RpcError::protocol(format!("Malformed envelope: {}", e)))
}

/// Parse Content-Length header from a header line
pub(crate) fn parse_content_length(line: &str) -> Option<usize> {
    line.strip_prefix("Content-Length: ")
        .and_then(|stripped| stripped.trim().parse().ok())
}

/// Read one frame body, or `None` at end of stream
///
/// Header lines other than Content-Length are skipped.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut content_length = None;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let header = line.trim();
        if header.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(length) = parse_content_length(header) {
            content_length = Some(length);
        }
    }

    let length = content_length.unwrap_or_default();
    if length > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame of {} bytes exceeds limit", length),
        ));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one complete frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length("Content-Length: 123"), Some(123));
        assert_eq!(parse_content_length("Content-Length: 0"), Some(0));
        assert_eq!(parse_content_length("Other header"), None);
        assert_eq!(parse_content_length("Content-Length: invalid"), None);
    }

    #[tokio::test]
    async fn test_frames_read_back_in_order() {
        let mut bytes = encode_frame(&Envelope::of_kind(MessageKind::Ready), Side::PluginHost)
            .unwrap();
        bytes.extend(
            encode_frame(&Envelope::of_kind(MessageKind::Initialized), Side::PluginHost).unwrap(),
        );

        let mut reader = BufReader::new(&bytes[..]);
        let first = read_frame(&mut reader).await.unwrap().unwrap();
        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert!(read_frame(&mut reader).await.unwrap().is_none());

        assert_eq!(
            decode_body(&first, Side::Host).unwrap().kind,
            MessageKind::Ready
        );
        assert_eq!(
            decode_body(&second, Side::Host).unwrap().kind,
            MessageKind::Initialized
        );
    }

    #[tokio::test]
    async fn test_extra_headers_are_skipped() {
        let body = br#"{"jsonrpc":"2.0","method":"ext/msg","params":{"type":3}}"#;
        let mut bytes = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n",
            body.len()
        )
        .into_bytes();
        bytes.extend_from_slice(body);

        let mut reader = BufReader::new(&bytes[..]);
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert!(decode_body(&frame, Side::PluginHost).unwrap().is_terminate());
    }

    #[test]
    fn test_wrong_direction_is_protocol_error() {
        let body = br#"{"jsonrpc":"2.0","method":"host/msg","params":{"type":3}}"#;
        let err = decode_body(body, Side::PluginHost).unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }
}
