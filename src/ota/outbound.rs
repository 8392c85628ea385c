//! Outbound OTA (device → cloud), spec.md §4.5 "Outbound" — triggered by
//! a FileRequest. This module only builds wire payloads and partitions
//! data into chunks; the session loop owns the actual send/await
//! sequencing since it alone holds the transport and multiplexer.

const FAST_OTA_AVAILABLE_FLAG: u8 = 0x01;
const DEST_FLAG_DEFAULT: u8 = 128;

/// Builds the UpdateBegin POST payload the device sends before chunking a
/// file up to the cloud (spec.md §4.5 "Outbound" payload layout).
pub fn build_update_begin_payload(chunk_size: u16, file_size: u32, name: Option<&str>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + name.map(|n| n.len() + 1).unwrap_or(0));
    buf.push(FAST_OTA_AVAILABLE_FLAG);
    buf.extend_from_slice(&chunk_size.to_be_bytes());
    buf.extend_from_slice(&file_size.to_be_bytes());
    buf.push(DEST_FLAG_DEFAULT);
    buf.extend_from_slice(&0u32.to_be_bytes());
    if let Some(name) = name {
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
    }
    buf
}

/// One outbound chunk: its index, the CRC-32 of the unpadded slice, and
/// the zero-padded chunk bytes ready to send as the POST payload.
pub struct OutboundChunk {
    pub index: u16,
    pub crc32: u32,
    pub payload: Vec<u8>,
}

/// Splits `data` into fixed-size chunks, the last zero-padded to
/// `chunk_size` (spec.md §4.5 "Outbound": "for each chunk send a
/// confirmable POST to `c`").
pub fn partition_into_chunks(data: &[u8], chunk_size: usize) -> Vec<OutboundChunk> {
    if data.is_empty() {
        return Vec::new();
    }
    data.chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let crc32 = crc32fast::hash(chunk);
            let mut payload = chunk.to_vec();
            payload.resize(chunk_size, 0);
            OutboundChunk {
                index: index as u16,
                crc32,
                payload,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_begin_payload_layout() {
        let payload = build_update_begin_payload(256, 500, Some("a.gz"));
        assert_eq!(payload[0], FAST_OTA_AVAILABLE_FLAG);
        assert_eq!(u16::from_be_bytes([payload[1], payload[2]]), 256);
        assert_eq!(
            u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]),
            500
        );
        assert_eq!(payload[7], DEST_FLAG_DEFAULT);
        assert_eq!(payload[12], 4);
        assert_eq!(&payload[13..17], b"a.gz");
    }

    #[test]
    fn partitions_and_pads_the_last_chunk() {
        let data = vec![1u8; 500];
        let chunks = partition_into_chunks(&data, 256);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].payload.len(), 256);
        assert_eq!(chunks[1].payload.len(), 256);
        assert_eq!(&chunks[1].payload[..244], &data[256..500]);
        assert!(chunks[1].payload[244..].iter().all(|&b| b == 0));
        assert_eq!(chunks[1].crc32, crc32fast::hash(&data[256..500]));
    }
}
