//! Transport utilities: framing an `Envelope` stream over an async
//! read/write pair.
//!
//! Grounded on `srpc::transport::TransportPacketWriter` and
//! `spawn_packet_reader`/`create_packet_channel`, generalised from `Packet`
//! to `Envelope` and carrying no other behavioral change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{Encoder, FramedRead};

use crate::codec::EnvelopeCodec;
use crate::error::{Error, Result};
use crate::proto::Envelope;

/// Writes envelopes onto a transport. Implementors must serialize
/// concurrent writes themselves (the channel may be shared by many
/// in-flight contexts).
#[async_trait]
pub trait EnvelopeWriter: Send + Sync {
    async fn write_envelope(&self, envelope: Envelope) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// The canonical [`EnvelopeWriter`] for any transport implementing
/// `AsyncWrite`.
pub struct TransportEnvelopeWriter<W> {
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<W: AsyncWrite + Send + Unpin> TransportEnvelopeWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin + 'static> EnvelopeWriter for TransportEnvelopeWriter<W> {
    async fn write_envelope(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }

        let mut buf = BytesMut::new();
        let mut codec = EnvelopeCodec::new();
        codec.encode(envelope, &mut buf)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Receiver half of a framed envelope channel.
pub type EnvelopeReceiver = tokio::sync::mpsc::Receiver<Envelope>;

/// Sender half of a framed envelope channel.
pub type EnvelopeSender = tokio::sync::mpsc::Sender<Envelope>;

/// Default channel buffer size.
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

/// Spawns a task that reads envelopes from a transport and forwards them
/// through a channel, stopping on read error or a dropped receiver.
pub fn spawn_envelope_reader<R>(reader: R, sender: EnvelopeSender) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(reader, EnvelopeCodec::new());
        while let Some(result) = framed.next().await {
            match result {
                Ok(envelope) => {
                    if sender.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Builds an [`EnvelopeWriter`] and receiver channel from a split transport.
pub fn create_envelope_channel<R, W>(
    read_half: R,
    write_half: W,
) -> (Arc<dyn EnvelopeWriter>, EnvelopeReceiver)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer: Arc<dyn EnvelopeWriter> = Arc::new(TransportEnvelopeWriter::new(write_half));
    let (tx, rx) = tokio::sync::mpsc::channel(DEFAULT_CHANNEL_BUFFER);
    spawn_envelope_reader(read_half, tx);
    (writer, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::handshake;

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let (client_writer, _client_rx) = create_envelope_channel(client_read, client_write);
        let (_server_writer, mut server_rx) = create_envelope_channel(server_read, server_write);

        client_writer.write_envelope(handshake("a", "i0")).await.unwrap();
        let received = server_rx.recv().await.unwrap();
        assert_eq!(received, handshake("a", "i0"));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (a, _b) = tokio::io::duplex(64);
        let (_r, w) = tokio::io::split(a);
        let writer = TransportEnvelopeWriter::new(w);
        writer.close().await.unwrap();
        let result = writer.write_envelope(handshake("a", "i0")).await;
        assert!(matches!(result, Err(Error::TransportClosed)));
    }
}
