//! Length-prefixed chunk framing over the session's AES-CBC cipher pair.
//!
//! Stream-agnostic so `transport::tcp` can hand it a bare `TcpStream` right
//! after the handshake derives the session keys.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::crypto::{CbcDecryptor, CbcEncryptor};
use crate::error::{Result, TransportError};

pub struct ChunkedCipherStream<S> {
    stream: S,
    encryptor: CbcEncryptor,
    decryptor: CbcDecryptor,
    read_buf: BytesMut,
    inactivity_timeout: Duration,
}

impl<S> ChunkedCipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        encryptor: CbcEncryptor,
        decryptor: CbcDecryptor,
        inactivity_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            encryptor,
            decryptor,
            read_buf: BytesMut::new(),
            inactivity_timeout,
        }
    }

    /// Read the next 4-byte-length-prefixed ciphertext chunk and decrypt it.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < 4 {
            self.fill_buf().await?;
        }
        let len = u32::from_be_bytes(self.read_buf[0..4].try_into().unwrap()) as usize;
        while self.read_buf.len() < 4 + len {
            self.fill_buf().await?;
        }
        let mut frame = self.read_buf.split_to(4 + len);
        let ciphertext = frame.split_off(4);
        let plaintext = self.decryptor.decrypt(&ciphertext)?;
        Ok(Bytes::from(plaintext))
    }

    /// Encrypt `payload` and write it as a 4-byte-length-prefixed chunk.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let ciphertext = self.encryptor.encrypt(payload);
        let mut framed = Vec::with_capacity(4 + ciphertext.len());
        framed.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        framed.extend_from_slice(&ciphertext);
        self.stream.write_all(&framed).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    async fn fill_buf(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        let n = timeout(self.inactivity_timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| TransportError::SocketTimeout)??;
        if n == 0 {
            return Err(TransportError::SocketClosed.into());
        }
        self.read_buf.extend_from_slice(&buf[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_stream() {
        let (client, server) = duplex(4096);
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];

        let mut client_stream = ChunkedCipherStream::new(
            client,
            CbcEncryptor::new(key, iv),
            CbcDecryptor::new(key, iv),
            Duration::from_secs(5),
        );
        let mut server_stream = ChunkedCipherStream::new(
            server,
            CbcEncryptor::new(key, iv),
            CbcDecryptor::new(key, iv),
            Duration::from_secs(5),
        );

        client_stream.write_frame(b"hello device").await.unwrap();
        let received = server_stream.read_frame().await.unwrap();
        assert_eq!(&received[..], b"hello device");

        server_stream.write_frame(b"hello cloud").await.unwrap();
        let received = client_stream.read_frame().await.unwrap();
        assert_eq!(&received[..], b"hello cloud");
    }
}
