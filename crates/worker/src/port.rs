//! Duplex channels carrying [`WireMessage`] frames.
//!
//! A [`Port`] is one end of a connection. In-process ports are a pair of
//! bounded byte channels, so nothing but encoded frames crosses between the
//! two sides. [`Port::from_io`] adapts any reader/writer pair (a child's
//! stdio, a socket) using length-prefixed frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::PortError;
use crate::protocol::WireMessage;

/// Largest frame accepted from an I/O stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One end of a duplex frame channel.
#[derive(Debug)]
pub struct Port {
    pub(crate) sender: PortSender,
    pub(crate) receiver: PortReceiver,
    /// Background writer for I/O backed ports, finished once every sender is dropped.
    pub(crate) writer: Option<JoinHandle<()>>,
}

/// Sending half of a [`Port`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::Sender<Vec<u8>>,
}

/// Receiving half of a [`Port`].
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Port {
    /// Two connected in-process ports.
    pub fn pair(capacity: usize) -> (Port, Port) {
        let capacity = capacity.max(1);
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (Self::from_channels(a_tx, a_rx), Self::from_channels(b_tx, b_rx))
    }

    fn from_channels(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            sender: PortSender { tx },
            receiver: PortReceiver { rx },
            writer: None,
        }
    }

    /// A port over a byte stream pair. Each frame is a big-endian `u32`
    /// length followed by that many bytes.
    ///
    /// Must be called inside a tokio runtime. The reader stops at EOF, on an
    /// I/O error or on a frame larger than [`MAX_FRAME_LEN`]; the receiver
    /// then reports the port as closed.
    pub fn from_io<R, W>(reader: R, writer: W, capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);

        tokio::spawn(read_frames(reader, in_tx));
        let writer = tokio::spawn(write_frames(writer, out_rx));

        Self {
            sender: PortSender { tx: out_tx },
            receiver: PortReceiver { rx: in_rx },
            writer: Some(writer),
        }
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }

    pub async fn send(&self, message: &WireMessage) -> Result<(), PortError> {
        self.sender.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<WireMessage>, PortError> {
        self.receiver.recv().await
    }
}

impl PortSender {
    /// Encode and send one frame. Fails once the other end is gone.
    pub async fn send(&self, message: &WireMessage) -> Result<(), PortError> {
        let frame = message.to_bytes()?;
        self.tx.send(frame).await.map_err(|_| PortError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PortReceiver {
    /// The next frame, or `None` once the other end is gone.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>, PortError> {
        match self.rx.recv().await {
            Some(frame) => Ok(Some(WireMessage::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }
}

// ── Stream framing ──────────────────────────────────────────────

async fn read_frames<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("frame stream reached EOF");
                return;
            }
            Err(e) => {
                warn!(error = %e, "reading frame header failed");
                return;
            }
        };
        if len > MAX_FRAME_LEN {
            warn!(len, max = MAX_FRAME_LEN, "frame too large, closing port");
            return;
        }

        let mut frame = vec![0; len];
        if let Err(e) = reader.read_exact(&mut frame).await {
            warn!(error = %e, len, "reading frame body failed");
            return;
        }
        if tx.send(frame).await.is_err() {
            return;
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        let Ok(len) = u32::try_from(frame.len()) else {
            warn!(len = frame.len(), "frame too large to send, dropping it");
            continue;
        };
        let written = async {
            writer.write_u32(len).await?;
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "writing frame failed");
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "closing frame writer failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paired_ports_exchange_frames() {
        let (mut a, mut b) = Port::pair(4);
        a.send(&WireMessage::Ready).await.unwrap();
        b.send(&WireMessage::Abort { id: 5 }).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(WireMessage::Ready));
        assert_eq!(a.recv().await.unwrap(), Some(WireMessage::Abort { id: 5 }));
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (a, mut b) = Port::pair(1);
        drop(a);
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(
            b.send(&WireMessage::Terminate).await,
            Err(PortError::Closed)
        ));
    }

    #[tokio::test]
    async fn io_ports_frame_messages() {
        let (left, right) = tokio::io::duplex(1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        let a = Port::from_io(left_read, left_write, 4);
        let mut b = Port::from_io(right_read, right_write, 4);

        let call = WireMessage::Call {
            id: 1,
            payload: vec![0xc3; 3000],
            abortable: false,
        };
        a.send(&call).await.unwrap();
        a.send(&WireMessage::Terminate).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(call));
        assert_eq!(b.recv().await.unwrap(), Some(WireMessage::Terminate));

        drop(a);
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_port() {
        let (mut raw, other) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(other);
        let mut port = Port::from_io(read, write, 1);

        raw.write_u32(u32::MAX).await.unwrap();
        assert_eq!(port.recv().await.unwrap(), None);
    }
}
