//! Length-prefixed, zlib-compressed framing (§4.1).
//!
//! Every message on the wire is a big-endian 4-byte length `N` followed by
//! `N` bytes of zlib-compressed UTF-8 JSON. Framing and decompression are
//! layered: [`tokio_util`]'s [`LengthDelimitedCodec`] handles the length
//! prefix, this module handles the zlib layer underneath it.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::ProtocolError;

fn compress(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| ProtocolError::Compress(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compress(e.to_string()))
}

fn decompress(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decompress(e.to_string()))?;
    Ok(out)
}

/// One bidirectional, single-writer framed connection to a worker.
pub struct Transport {
    inner: Framed<TcpStream, LengthDelimitedCodec>,
    max_frame_bytes: usize,
}

impl Transport {
    pub fn new(stream: TcpStream, max_frame_bytes: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            inner: Framed::new(stream, codec),
            max_frame_bytes,
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.get_ref().peer_addr()
    }

    /// Read the next frame, zlib-decompressed. `Ok(None)` means the peer
    /// closed cleanly. Any error here (bad length, decompression failure) is
    /// a protocol fault and the session must close.
    pub async fn recv_raw(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    Err(ProtocolError::FrameTooLarge {
                        size: self.max_frame_bytes + 1,
                        max: self.max_frame_bytes,
                    })
                } else {
                    Err(ProtocolError::Io(e))
                }
            }
            Some(Ok(bytes)) => Ok(Some(decompress(&bytes)?)),
        }
    }

    /// Compress and send a raw JSON payload. Back-pressured: resolves only
    /// once the frame has been handed to the OS socket buffer.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let compressed = compress(payload)?;
        self.inner.send(Bytes::from(compressed)).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.close().await?;
        Ok(())
    }

    /// Split into an independent reader and writer so the session's frame
    /// loop and its ping loop can each own a half without sharing a lock
    /// (§5: "a second task per session runs the ping loop").
    pub fn split(self) -> (TransportReader, TransportWriter) {
        let (sink, stream) = self.inner.split();
        (
            TransportReader {
                inner: stream,
                max_frame_bytes: self.max_frame_bytes,
            },
            TransportWriter { inner: sink },
        )
    }
}

pub struct TransportReader {
    inner: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
    max_frame_bytes: usize,
}

impl TransportReader {
    pub async fn recv_raw(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    Err(ProtocolError::FrameTooLarge {
                        size: self.max_frame_bytes + 1,
                        max: self.max_frame_bytes,
                    })
                } else {
                    Err(ProtocolError::Io(e))
                }
            }
            Some(Ok(bytes)) => Ok(Some(decompress(&bytes)?)),
        }
    }
}

pub struct TransportWriter {
    inner: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
}

impl TransportWriter {
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let compressed = compress(payload)?;
        self.inner.send(Bytes::from(compressed)).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (Transport, Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let client_stream = client.await.unwrap();
        (
            Transport::new(server_stream, 1 << 20),
            Transport::new(client_stream, 1 << 20),
        )
    }

    #[tokio::test]
    async fn round_trips_compressed_json() {
        let (mut a, mut b) = loopback_pair().await;
        a.send_raw(br#"{"name":"ping","when":1.0}"#).await.unwrap();
        let received = b.recv_raw().await.unwrap().unwrap();
        assert_eq!(received, br#"{"name":"ping","when":1.0}"#);
    }

    #[tokio::test]
    async fn recv_none_on_clean_close() {
        let (a, mut b) = loopback_pair().await;
        drop(a);
        assert!(b.recv_raw().await.unwrap().is_none());
    }
}
