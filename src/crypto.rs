//! Cryptographic primitives used by the TCP/RSA handshake and the AES-CBC
//! stream cipher that wraps the TCP channel afterwards.
//!
//! All primitives are delegated to `RustCrypto` crates (`aes`, `cbc`,
//! `hmac`, `sha1`) and the `rsa` crate's PKCS#1 v1.5 implementation; this
//! module only composes them the way the handshake in spec.md §4.1 and §3
//! requires.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::{HandshakeError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Session keys derived from the 40-byte server session material (spec.md
/// §3 "Session Keys (TCP variant)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
    pub initial_message_id: u16,
}

/// Derive `SessionKeys` from the 40-byte session material: bytes 0..16 are
/// the AES key, 16..32 the IV, and 32..34 the big-endian initial message-id
/// counter.
pub fn derive_session_keys(material: &[u8]) -> Result<SessionKeys> {
    if material.len() < 34 {
        return Err(HandshakeError::MalformedSessionMaterial(format!(
            "expected at least 34 bytes of session material, got {}",
            material.len()
        ))
        .into());
    }
    let mut aes_key = [0u8; 16];
    let mut aes_iv = [0u8; 16];
    aes_key.copy_from_slice(&material[0..16]);
    aes_iv.copy_from_slice(&material[16..32]);
    let initial_message_id = u16::from_be_bytes([material[32], material[33]]);
    Ok(SessionKeys {
        aes_key,
        aes_iv,
        initial_message_id,
    })
}

/// Encrypt `nonce || device_id || device_public_key_der` with the server's
/// RSA public key (step 1 of the TCP handshake).
pub fn rsa_encrypt_handshake_payload(
    server_public_key: &RsaPublicKey,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    server_public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, payload)
        .map_err(|e| HandshakeError::Rsa(e.to_string()).into())
}

/// Decrypt the server's 128-byte RSA-encrypted session material blob with
/// the device's RSA private key (step 2 of the TCP handshake).
pub fn rsa_decrypt_session_material(
    device_private_key: &RsaPrivateKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    device_private_key
        .decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|e| HandshakeError::Rsa(e.to_string()).into())
}

/// Compute HMAC-SHA1(ciphertext, session_material) and compare it with the
/// server-signature-verified blob. Constant-time comparison is handled by
/// `hmac::Mac::verify_slice`.
pub fn verify_hmac_sha1(ciphertext: &[u8], session_material: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac =
        HmacSha1::new_from_slice(session_material).expect("HMAC accepts any key length");
    mac.update(ciphertext);
    mac.verify_slice(expected)
        .map_err(|_| HandshakeError::Hmac.into())
}

/// Stateful AES-128-CBC encryptor for the outbound half of the TCP channel.
/// Oracle-of-IoT devices reuse the single IV derived at handshake time for
/// the life of the session (no per-message IV renegotiation), so the
/// encryptor keeps the "running" ciphertext block as its next IV, matching
/// standard CBC chaining across successive `encrypt` calls.
pub struct CbcEncryptor {
    key: [u8; 16],
    iv: [u8; 16],
}

impl CbcEncryptor {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Encrypt `plaintext` with PKCS#7 padding, advancing the running IV to
    /// the last ciphertext block so the next call chains correctly.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let block_size = 16;
        let padding = block_size - (plaintext.len() % block_size);
        let mut buf = plaintext.to_vec();
        buf.extend(std::iter::repeat(padding as u8).take(padding));

        let encryptor = Aes128CbcEnc::new(&self.key.into(), &self.iv.into());
        let ct_len = buf.len();
        encryptor
            .encrypt_padded_mut::<aes::cipher::block_padding::NoPadding>(&mut buf, ct_len)
            .expect("buffer sized to a multiple of the block size");

        self.iv.copy_from_slice(&buf[buf.len() - 16..]);
        buf
    }
}

/// Stateful AES-128-CBC decryptor for the inbound half of the TCP channel.
pub struct CbcDecryptor {
    key: [u8; 16],
    iv: [u8; 16],
}

impl CbcDecryptor {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Decrypt a full ciphertext (must be a multiple of 16 bytes) and strip
    /// PKCS#7 padding.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(HandshakeError::MalformedSessionMaterial(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            ))
            .into());
        }
        let next_iv: [u8; 16] = ciphertext[ciphertext.len() - 16..].try_into().unwrap();

        let decryptor = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        let mut buf = ciphertext.to_vec();
        let plaintext = decryptor
            .decrypt_padded_mut::<aes::cipher::block_padding::Pkcs7>(&mut buf)
            .map_err(|e| HandshakeError::MalformedSessionMaterial(e.to_string()))?;
        let len = plaintext.len();
        buf.truncate(len);

        self.iv = next_iv;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_keys_from_session_material() {
        // S1 handshake test vector: sessionMaterial = 40 bytes of 0x02.
        let material = [0x02u8; 40];
        let keys = derive_session_keys(&material).unwrap();
        assert_eq!(keys.aes_key, [0x02u8; 16]);
        assert_eq!(keys.aes_iv, [0x02u8; 16]);
        assert_eq!(keys.initial_message_id, 0x0202);
    }

    #[test]
    fn rejects_short_session_material() {
        let material = [0x02u8; 10];
        assert!(derive_session_keys(&material).is_err());
    }

    #[test]
    fn cbc_round_trips() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let mut enc = CbcEncryptor::new(key, iv);
        let mut dec = CbcDecryptor::new(key, iv);

        let msg1 = b"hello device world";
        let ct1 = enc.encrypt(msg1);
        let pt1 = dec.decrypt(&ct1).unwrap();
        assert_eq!(pt1, msg1);

        let msg2 = b"second message, chained IV";
        let ct2 = enc.encrypt(msg2);
        let pt2 = dec.decrypt(&ct2).unwrap();
        assert_eq!(pt2, msg2);
    }

    #[test]
    fn hmac_mismatch_is_detected() {
        let ciphertext = b"some ciphertext bytes";
        let material = [0x02u8; 40];
        let mut mac = HmacSha1::new_from_slice(&material).unwrap();
        mac.update(ciphertext);
        let good = mac.finalize().into_bytes();

        assert!(verify_hmac_sha1(ciphertext, &material, &good).is_ok());
        let mut bad = good.to_vec();
        bad[0] ^= 0xff;
        assert!(verify_hmac_sha1(ciphertext, &material, &bad).is_err());
    }
}
