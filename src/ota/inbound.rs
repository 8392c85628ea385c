//! Inbound OTA (cloud → device), spec.md §4.5 "Inbound".

use bytes::Bytes;

use crate::coap::CoapCode;
use crate::error::{Error, Result};
use crate::ota::DEFAULT_CHUNK_SIZE;

/// Parsed UpdateBegin payload (big-endian layout per spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBeginRequest {
    pub flags: u8,
    pub chunk_size: u32,
    pub file_size: u32,
    pub filename: Option<String>,
}

impl UpdateBeginRequest {
    /// `None` if the payload is shorter than the fixed 12-byte header.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 12 {
            return None;
        }
        let flags = payload[0];
        let raw_chunk_size = u16::from_be_bytes([payload[1], payload[2]]) as u32;
        let chunk_size = if raw_chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            raw_chunk_size
        };
        let file_size = u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]);

        let filename = if payload.len() > 12 {
            let name_len = payload[12] as usize;
            let start = 13;
            if payload.len() >= start + name_len && name_len > 0 {
                Some(String::from_utf8_lossy(&payload[start..start + name_len]).to_string())
            } else {
                None
            }
        } else {
            None
        };

        Some(Self {
            flags,
            chunk_size,
            file_size,
            filename,
        })
    }

    /// A bare 12-byte payload with no filename means a firmware image
    /// (spec.md §4.5 "If payload length == 12 ... AND both updates-enabled
    /// and updates-forced are false, reply 5.03").
    pub fn is_bare_firmware_header(&self, payload_len: usize) -> bool {
        payload_len == 12 && self.filename.is_none()
    }
}

fn ceil_div(numerator: u32, denominator: u32) -> u32 {
    if denominator == 0 {
        return 0;
    }
    numerator.div_ceil(denominator)
}

/// One in-progress transfer (spec.md §3 "OTA Session"): allocated at
/// UpdateBegin, destroyed when complete, aborted, or the session dies.
pub struct InboundTransfer {
    chunk_size: u32,
    file_size: u32,
    expected_chunks: u32,
    filename: Option<String>,
    buffer: Vec<u8>,
    received: Vec<bool>,
    received_count: u32,
    missed: Vec<u32>,
}

impl InboundTransfer {
    pub fn new(request: &UpdateBeginRequest) -> Self {
        let expected_chunks = ceil_div(request.file_size, request.chunk_size);
        Self {
            chunk_size: request.chunk_size,
            file_size: request.file_size,
            expected_chunks,
            filename: request.filename.clone(),
            buffer: vec![0u8; request.file_size as usize],
            received: vec![false; expected_chunks as usize],
            received_count: 0,
            missed: Vec::new(),
        }
    }

    pub fn expected_chunks(&self) -> u32 {
        self.expected_chunks
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn missed_indices(&self) -> &[u32] {
        &self.missed
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.expected_chunks
    }

    /// Applies one Chunk packet's payload at `index` if its CRC matches.
    /// On mismatch, the index is recorded in the missed-list and the
    /// counter is left unchanged (spec.md §4.5 "Inbound").
    pub fn apply_chunk(&mut self, index: u32, crc: u32, payload: &[u8]) -> bool {
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != crc {
            if !self.missed.contains(&index) {
                self.missed.push(index);
            }
            return false;
        }

        let offset = (self.chunk_size as usize) * (index as usize);
        if offset < self.buffer.len() {
            let len = std::cmp::min(self.chunk_size as usize, self.buffer.len() - offset)
                .min(payload.len());
            self.buffer[offset..offset + len].copy_from_slice(&payload[..len]);
        }

        if let Some(slot) = self.received.get_mut(index as usize) {
            if !*slot {
                *slot = true;
                self.received_count += 1;
            }
        }
        self.missed.retain(|&m| m != index);
        true
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Encodes a fast-OTA missed-chunk recovery payload: a concatenation of
/// big-endian uint16 indices.
pub fn encode_missed_chunks(missed: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(missed.len() * 2);
    for &index in missed {
        buf.extend_from_slice(&(index as u16).to_be_bytes());
    }
    buf
}

/// Validates a fully reassembled firmware buffer (spec.md §4.5 "Firmware
/// validation" and §8 invariant 4): the last 4 bytes are a big-endian
/// CRC-32 of the preceding bytes; on success, yields the inner slice with
/// the 24-byte header and 40-byte trailer stripped.
pub fn validate_firmware(buffer: &[u8]) -> Result<Bytes> {
    if buffer.len() < 68 {
        return Err(Error::protocol(
            "firmware buffer too short to contain header and trailer",
            CoapCode::BAD_REQUEST,
        ));
    }
    let (body, trailer) = buffer.split_at(buffer.len() - 4);
    let expected = u32::from_be_bytes(trailer.try_into().unwrap());
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(Error::protocol("crc not valid", CoapCode::BAD_REQUEST));
    }
    Ok(Bytes::copy_from_slice(&buffer[24..buffer.len() - 44]))
}
