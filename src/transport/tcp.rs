//! TCP custom-handshake transport (spec.md §4.1 "TCP custom-handshake
//! variant"): plain TCP, a two-step RSA handshake, then a chunked,
//! AES-CBC-ciphered byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::crypto::{self, CbcDecryptor, CbcEncryptor, SessionKeys};
use crate::error::{HandshakeError, Result, TransportError};
use crate::transport::cipher::ChunkedCipherStream;
use crate::transport::SecureTransport;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(31);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_MATERIAL_CIPHERTEXT_LEN: usize = 128;
const HMAC_SHA1_LEN: usize = 20;
const NONCE_LEN: usize = 40;

pub struct TcpTransport {
    inner: ChunkedCipherStream<TcpStream>,
}

impl TcpTransport {
    /// Runs the two-step handshake from spec.md §4.1 over a freshly opened
    /// socket and returns the ciphered, framed transport plus the derived
    /// session keys (the supervisor needs the initial message-id counter).
    pub async fn connect(
        host: &str,
        port: u16,
        device_id: &[u8; 12],
        device_private_key: &RsaPrivateKey,
        server_public_key: &RsaPublicKey,
    ) -> Result<(Self, SessionKeys)> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::SocketTimeout)?
            .map_err(|e| TransportError::classify(&e, host, port))?;

        let mut nonce = [0u8; NONCE_LEN];
        timeout(INACTIVITY_TIMEOUT, stream.read_exact(&mut nonce))
            .await
            .map_err(|_| TransportError::SocketTimeout)??;

        let device_public_key = RsaPublicKey::from(device_private_key);
        let device_public_key_der = device_public_key
            .to_public_key_der()
            .map_err(|e| HandshakeError::Rsa(e.to_string()))?;

        let mut payload = Vec::with_capacity(
            NONCE_LEN + device_id.len() + device_public_key_der.as_bytes().len(),
        );
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(device_id);
        payload.extend_from_slice(device_public_key_der.as_bytes());

        let ciphertext = crypto::rsa_encrypt_handshake_payload(server_public_key, &payload)?;
        timeout(INACTIVITY_TIMEOUT, stream.write_all(&ciphertext))
            .await
            .map_err(|_| TransportError::SocketTimeout)??;

        let mut session_blob = vec![0u8; SESSION_MATERIAL_CIPHERTEXT_LEN];
        timeout(INACTIVITY_TIMEOUT, stream.read_exact(&mut session_blob))
            .await
            .map_err(|_| TransportError::SocketTimeout)??;
        let mut hmac_blob = vec![0u8; HMAC_SHA1_LEN];
        timeout(INACTIVITY_TIMEOUT, stream.read_exact(&mut hmac_blob))
            .await
            .map_err(|_| TransportError::SocketTimeout)??;

        let session_material =
            crypto::rsa_decrypt_session_material(device_private_key, &session_blob)?;
        crypto::verify_hmac_sha1(&session_blob, &session_material, &hmac_blob)?;

        let keys = crypto::derive_session_keys(&session_material)?;
        let encryptor = CbcEncryptor::new(keys.aes_key, keys.aes_iv);
        let decryptor = CbcDecryptor::new(keys.aes_key, keys.aes_iv);
        let inner = ChunkedCipherStream::new(stream, encryptor, decryptor, INACTIVITY_TIMEOUT);

        Ok((Self { inner }, keys))
    }
}

#[async_trait]
impl SecureTransport for TcpTransport {
    async fn read_frame(&mut self) -> Result<Bytes> {
        self.inner.read_frame().await
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.inner.write_frame(payload).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
