//! IPC framing between a host and its plugin processes
//!
//! Each frame is a 4-byte big-endian length (type byte + payload), one type
//! byte, then the payload. Payloads are JSON.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PluginError, PluginResult};

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Environment variable carrying the host's protocol version
pub const PROTOCOL_VERSION_ENV: &str = "PLUGVISOR_PROTOCOL_VERSION";

/// Frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Plugin → Host
    Ready = 1,
    Pong = 3,
    Reply = 5,
    Log = 6,

    // Host → Plugin
    Ping = 2,
    Call = 4,
    Shutdown = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = PluginError;

    fn try_from(value: u8) -> PluginResult<Self> {
        match value {
            1 => Ok(MessageType::Ready),
            2 => Ok(MessageType::Ping),
            3 => Ok(MessageType::Pong),
            4 => Ok(MessageType::Call),
            5 => Ok(MessageType::Reply),
            6 => Ok(MessageType::Log),
            7 => Ok(MessageType::Shutdown),
            _ => Err(PluginError::Connection(format!(
                "Unknown message type: {}",
                value
            ))),
        }
    }
}

/// A frame received from or sent to a plugin
#[derive(Debug, Clone)]
pub struct PluginMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl PluginMessage {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    /// Build a frame with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> PluginResult<Self> {
        let payload = serde_json::to_vec(data)
            .map_err(|e| PluginError::Internal(format!("JSON error: {}", e)))?;
        Ok(Self::new(msg_type, payload))
    }

    /// Parse payload as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> PluginResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            PluginError::Connection(format!("Malformed {:?} payload: {}", self.msg_type, e))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// First frame a plugin sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub protocol_version: u32,
    /// Capability names the plugin can dispense
    pub plugins: Vec<String>,
}

/// Ping / Pong payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingMessage {
    pub id: u64,
}

/// Request from host to plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMessage {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Plugin's answer to a [`CallMessage`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Log line forwarded from plugin to host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader / Writer
// ─────────────────────────────────────────────────────────────────────────────

/// Writes frames to a plugin (or, on the plugin side, to the host)
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a frame
    pub async fn send(&mut self, msg: &PluginMessage) -> PluginResult<()> {
        let len = u32::try_from(1 + msg.payload.len())
            .ok()
            .filter(|len| *len as usize <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                PluginError::Connection(format!(
                    "Frame of {} bytes exceeds limit",
                    msg.payload.len()
                ))
            })?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&[msg.msg_type as u8]).await?;
        self.inner.write_all(&msg.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a frame with JSON payload
    pub async fn send_json<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        data: &T,
    ) -> PluginResult<()> {
        self.send(&PluginMessage::json(msg_type, data)?).await
    }
}

/// Reads frames from a plugin (or, on the plugin side, from the host)
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive a frame, `None` on clean end of stream
    pub async fn recv(&mut self) -> PluginResult<Option<PluginMessage>> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(PluginError::Connection("Empty message".into()));
        }
        if len > MAX_FRAME_LEN {
            return Err(PluginError::Connection(format!(
                "Frame of {} bytes exceeds limit",
                len
            )));
        }

        // Read message type (1 byte)
        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;
        let msg_type = MessageType::try_from(type_buf[0])?;

        // Read payload
        let mut payload = vec![0u8; len - 1];
        if !payload.is_empty() {
            self.inner.read_exact(&mut payload).await?;
        }

        Ok(Some(PluginMessage::new(msg_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (host, plugin) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(host);
        let mut reader = FrameReader::new(plugin);

        writer
            .send_json(
                MessageType::Call,
                &CallMessage {
                    id: 7,
                    method: "echo".into(),
                    params: serde_json::json!({"x": 1}),
                },
            )
            .await
            .unwrap();
        writer.send(&PluginMessage::empty(MessageType::Shutdown)).await.unwrap();

        let call = reader.recv().await.unwrap().unwrap();
        assert_eq!(call.msg_type, MessageType::Call);
        let call: CallMessage = call.parse_json().unwrap();
        assert_eq!(call.id, 7);
        assert_eq!(call.method, "echo");
        assert_eq!(call.params["x"], 1);

        let shutdown = reader.recv().await.unwrap().unwrap();
        assert_eq!(shutdown.msg_type, MessageType::Shutdown);
        assert!(shutdown.payload.is_empty());

        drop(writer);
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_unknown_type_and_oversized_frames() {
        let mut unknown: &[u8] = &[0, 0, 0, 1, 99];
        let result = FrameReader::new(&mut unknown).recv().await;
        assert!(matches!(result, Err(PluginError::Connection(_))));

        let huge = u32::try_from(MAX_FRAME_LEN + 1).unwrap().to_be_bytes();
        let mut oversized: &[u8] = &huge;
        let result = FrameReader::new(&mut oversized).recv().await;
        assert!(matches!(result, Err(PluginError::Connection(_))));
    }
}
