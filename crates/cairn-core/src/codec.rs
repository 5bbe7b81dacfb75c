//! Zstd compression, streaming wrappers, and skippable-frame padding.

use std::io::{Cursor, Read, Write};

use rand::RngCore;

use crate::error::{Error, Result};

/// Zstd skippable-frame magic, little-endian on the wire.
const SKIPPABLE_MAGIC: [u8; 4] = 0x184D2A50u32.to_le_bytes();

/// One-shot compression.
pub fn compress(bytes: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::encode_all(Cursor::new(bytes), level)
        .map_err(|e| Error::Codec(format!("zstd compress: {e}")))
}

/// One-shot decompression.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(Cursor::new(bytes))
        .map_err(|e| Error::Codec(format!("zstd decompress: {e}")))
}

/// Wrap a byte source; reads yield the zstd-compressed stream.
pub fn compress_reader<R: Read>(
    reader: R,
    level: i32,
) -> std::io::Result<zstd::stream::read::Encoder<'static, std::io::BufReader<R>>> {
    zstd::stream::read::Encoder::new(reader, level)
}

/// Wrap a byte sink; writes are decompressed before reaching it. Skippable
/// frames in the input are consumed and ignored, which is what makes the
/// padding below invisible to decryption.
pub fn decompress_writer<W: Write>(
    writer: W,
) -> std::io::Result<zstd::stream::write::Decoder<'static, W>> {
    zstd::stream::write::Decoder::new(writer)
}

/// Pad a sub-chunk-size tail chunk with a zstd skippable frame: 4-byte
/// magic, 4-byte little-endian length (`len % 256`), then that many random
/// bytes. Decoders ignore the frame, but the exact compressed length of the
/// final chunk is obscured. Full-size chunks pass through unchanged.
pub fn skippable_frame_pad(mut data: Vec<u8>, chunk_size: usize) -> Vec<u8> {
    if data.len() >= chunk_size {
        return data;
    }
    let pad_length = data.len() % 256;
    data.reserve(8 + pad_length);
    data.extend_from_slice(&SKIPPABLE_MAGIC);
    data.extend_from_slice(&(pad_length as u32).to_le_bytes());
    let mut fill = vec![0u8; pad_length];
    rand::rngs::OsRng.fill_bytes(&mut fill);
    data.extend_from_slice(&fill);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_round_trip() {
        let data = b"the same bytes, over and over and over again".repeat(64);
        let packed = compress(&data, 6).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn garbage_fails_decompression() {
        assert!(matches!(
            decompress(b"definitely not zstd"),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn pad_layout() {
        let compressed = compress(b"hello", 3).unwrap();
        let len = compressed.len();
        let padded = skippable_frame_pad(compressed, 1 << 20);
        assert_eq!(&padded[len..len + 4], &SKIPPABLE_MAGIC);
        assert_eq!(padded.len(), len + 8 + (len % 256));
    }

    #[test]
    fn full_size_chunk_is_not_padded() {
        let data = vec![0u8; 128];
        assert_eq!(skippable_frame_pad(data.clone(), 128), data);
    }

    #[test]
    fn padding_is_invisible_to_decompression() {
        let original = b"padding should never change the payload".to_vec();
        let padded = skippable_frame_pad(compress(&original, 6).unwrap(), 1 << 20);
        assert_eq!(decompress(&padded).unwrap(), original);
    }

    #[test]
    fn padding_is_invisible_to_the_stream_decoder() {
        let original: Vec<u8> = (0u32..5000).map(|i| (i % 251) as u8).collect();
        let padded = skippable_frame_pad(compress(&original, 6).unwrap(), 1 << 20);

        let mut out = Vec::new();
        let mut decoder = decompress_writer(&mut out).unwrap();
        decoder.write_all(&padded).unwrap();
        decoder.flush().unwrap();
        drop(decoder);
        assert_eq!(out, original);
    }
}
