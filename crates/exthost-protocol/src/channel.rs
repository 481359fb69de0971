//! Envelope channel over a duplex byte stream
//!
//! A writer task owns the write half so every envelope is written as one
//! complete frame, in send order. A reader task decodes frames and forwards
//! envelopes in receipt order. When the stream ends or fails the channel is
//! marked closed: the receiver yields `None`, `closed()` resolves and further
//! sends are silently dropped.

use crate::envelope::Envelope;
use crate::framing::{decode_body, encode_frame, read_frame, write_frame, Side};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Receiving end of a channel; `None` is the terminal close signal
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Cloneable sending end of a channel
#[derive(Clone, Debug)]
pub struct EnvelopeSender {
    tx: mpsc::UnboundedSender<Envelope>,
    closed: CancellationToken,
}

impl EnvelopeSender {
    /// Queue an envelope for writing
    ///
    /// Sending on a closed channel is a no-op.
    pub fn send(&self, envelope: Envelope) {
        if self.closed.is_cancelled() {
            trace!(kind = ?envelope.kind, "Dropping envelope sent on closed channel");
            return;
        }
        if self.tx.send(envelope).is_err() {
            trace!("Envelope writer already stopped");
        }
    }

    /// Close the channel; queued envelopes are still flushed
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed from either end
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Factory for envelope channels
pub struct EnvelopeChannel;

impl EnvelopeChannel {
    /// Start reader and writer tasks over the given stream halves
    pub fn spawn<R, W>(reader: R, writer: W, side: Side) -> (EnvelopeSender, EnvelopeReceiver)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let closed = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(writer, out_rx, side, closed.clone()));
        tokio::spawn(read_loop(reader, in_tx, side, closed.clone()));

        (EnvelopeSender { tx: out_tx, closed }, in_rx)
    }

    /// Channel over this process's stdin/stdout
    pub fn stdio(side: Side) -> (EnvelopeSender, EnvelopeReceiver) {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout(), side)
    }

    /// Connected in-memory pair, host end first
    pub fn in_memory() -> (
        (EnvelopeSender, EnvelopeReceiver),
        (EnvelopeSender, EnvelopeReceiver),
    ) {
        let (host_stream, plugin_stream) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_stream);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_stream);
        (
            Self::spawn(host_read, host_write, Side::Host),
            Self::spawn(plugin_read, plugin_write, Side::PluginHost),
        )
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    side: Side,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => {
                let Some(envelope) = message else { break };
                if !write_envelope(&mut writer, &envelope, side).await {
                    closed.cancel();
                    return;
                }
            }
            _ = closed.cancelled() => {
                // Flush whatever was queued before the close
                while let Ok(envelope) = rx.try_recv() {
                    if !write_envelope(&mut writer, &envelope, side).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Failed to shut down channel writer");
    }
    debug!("Envelope writer stopped");
}

async fn write_envelope<W>(writer: &mut W, envelope: &Envelope, side: Side) -> bool
where
    W: AsyncWrite + Unpin,
{
    let frame = match encode_frame(envelope, side) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, kind = ?envelope.kind, "Failed to encode envelope");
            return true;
        }
    };

    match write_frame(writer, &frame).await {
        Ok(()) => {
            trace!(kind = ?envelope.kind, request_id = envelope.request_id, "Sent envelope");
            true
        }
        Err(e) => {
            error!(
                error_category = "exthost_channel",
                error = %e,
                "Failed to write envelope"
            );
            false
        }
    }
}

async fn read_loop<R>(
    reader: R,
    tx: mpsc::UnboundedSender<Envelope>,
    side: Side,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut message_count: u64 = 0;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = closed.cancelled() => break,
        };

        match frame {
            Ok(Some(body)) => match decode_body(&body, side) {
                Ok(envelope) => {
                    message_count += 1;
                    trace!(kind = ?envelope.kind, request_id = envelope.request_id, "Received envelope");
                    if tx.send(envelope).is_err() {
                        debug!("Envelope receiver dropped");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed envelope");
                }
            },
            Ok(None) => {
                debug!(message_count, "Channel stream closed");
                break;
            }
            Err(e) => {
                error!(
                    error_category = "exthost_channel",
                    error = %e,
                    "Failed to read from channel"
                );
                break;
            }
        }
    }

    closed.cancel();
}
