//! Per-message deflate compression context (RFC 7692 framing).
//!
//! The connection core consumes this as a black box: a stateful
//! compressor/decompressor pair, an RSV bit, and a minimum-size threshold.
//! Extension negotiation happens outside the core; construct a
//! [`DeflateContext`] from the negotiated parameters and hand it to
//! [`Connection::establish_with`](crate::Connection::establish_with).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};
use crate::protocol::frame::RSV1;

const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const MAX_CODEC_ITERATIONS: usize = 100_000;
const MAX_DECOMPRESSION_RATIO: usize = 100;
const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for a [`DeflateContext`].
#[derive(Debug, Clone)]
pub struct DeflateConfig {
    /// Keep the LZ77 sliding window across messages.
    ///
    /// When false the compressor and decompressor are reset between
    /// messages (the `no_context_takeover` negotiation outcome).
    ///
    /// The LZ77 window is the deflate default of 15 bits.
    pub context_takeover: bool,
    /// Compression level (0-9).
    pub compression_level: u32,
    /// Minimum payload size before compression is worthwhile.
    pub compression_threshold: usize,
    /// Upper bound on a decompressed message, against decompression bombs.
    pub max_decompressed_size: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            context_takeover: true,
            compression_level: 6,
            compression_threshold: 64,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl DeflateConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set context takeover behavior.
    #[must_use]
    pub const fn context_takeover(mut self, takeover: bool) -> Self {
        self.context_takeover = takeover;
        self
    }

    /// Set the compression level (0-9).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] when out of range.
    pub fn compression_level(mut self, level: u32) -> Result<Self> {
        if level > 9 {
            return Err(Error::Compression(format!(
                "compression_level must be 0-9, got {level}"
            )));
        }
        self.compression_level = level;
        Ok(self)
    }

    /// Set the minimum payload size before compression is attempted.
    #[must_use]
    pub const fn compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }
}

/// Stateful compressor/decompressor pair for permessage-deflate.
///
/// Raw deflate streams, sync-flushed per block; the final block of a
/// message has the `0x00 0x00 0xFF 0xFF` trailer stripped on compression
/// and re-appended on decompression, per RFC 7692.
pub struct DeflateContext {
    config: DeflateConfig,
    encoder: Option<Compress>,
    decoder: Option<Decompress>,
}

impl std::fmt::Debug for DeflateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeflateContext {
    /// Create a context from negotiated parameters.
    #[must_use]
    pub fn new(config: DeflateConfig) -> Self {
        Self {
            config,
            encoder: None,
            decoder: None,
        }
    }

    /// The RSV bit this extension occupies on the first frame of a
    /// compressed message.
    #[must_use]
    pub const fn rsv_bit(&self) -> u8 {
        RSV1
    }

    /// Minimum payload size before compression is attempted.
    #[must_use]
    pub const fn compression_threshold(&self) -> usize {
        self.config.compression_threshold
    }

    fn encoder(&mut self) -> &mut Compress {
        let level = self.config.compression_level;
        self.encoder
            .get_or_insert_with(|| Compress::new(Compression::new(level), false))
    }

    fn decoder(&mut self) -> &mut Decompress {
        // Raw deflate, no zlib header.
        self.decoder.get_or_insert_with(|| Decompress::new(false))
    }

    /// Compress one block of a message.
    ///
    /// `final_block` marks the last block: the deflate trailer is stripped
    /// and, without context takeover, the window is discarded afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] when the underlying codec fails.
    pub fn compress(&mut self, data: &[u8], final_block: bool) -> Result<Vec<u8>> {
        let encoder = self.encoder();
        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let mut consumed_total = 0usize;

        for _ in 0..MAX_CODEC_ITERATIONS {
            let remaining = &data[consumed_total..];
            let old_len = out.len();
            out.resize(old_len + 4096, 0);

            let before_in = encoder.total_in();
            let before_out = encoder.total_out();
            encoder
                .compress(remaining, &mut out[old_len..], FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate failed: {e}")))?;
            let consumed = (encoder.total_in() - before_in) as usize;
            let produced = (encoder.total_out() - before_out) as usize;

            out.truncate(old_len + produced);
            consumed_total += consumed;

            if consumed_total >= data.len() && produced < 4096 {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }

        if final_block && out.len() >= 4 && out[out.len() - 4..] == DEFLATE_TRAILER {
            out.truncate(out.len() - 4);
        }
        if final_block && !self.config.context_takeover {
            self.encoder = None;
        }

        Ok(out)
    }

    /// Decompress one block of a message.
    ///
    /// `final_message` marks a complete compressed message: the deflate
    /// trailer is appended before inflating and, without context takeover,
    /// the window is discarded afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] on malformed deflate data or when
    /// the output exceeds the configured bomb guards. The caller treats
    /// this as fatal.
    pub fn decompress(&mut self, data: &[u8], final_message: bool) -> Result<Vec<u8>> {
        let mut input = Vec::with_capacity(data.len() + 4);
        input.extend_from_slice(data);
        if final_message {
            input.extend_from_slice(&DEFLATE_TRAILER);
        }

        let max_size = self.config.max_decompressed_size;
        let max_ratio_size = data.len().saturating_mul(MAX_DECOMPRESSION_RATIO).max(4096);

        let decoder = self.decoder();
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(4096));
        let mut consumed_total = 0usize;

        for _ in 0..MAX_CODEC_ITERATIONS {
            let remaining = &input[consumed_total..];
            let old_len = out.len();
            out.resize(old_len + 4096, 0);

            let before_in = decoder.total_in();
            let before_out = decoder.total_out();
            let status = decoder
                .decompress(remaining, &mut out[old_len..], FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate failed: {e}")))?;
            let consumed = (decoder.total_in() - before_in) as usize;
            let produced = (decoder.total_out() - before_out) as usize;

            out.truncate(old_len + produced);
            consumed_total += consumed;

            if out.len() > max_size {
                return Err(Error::Compression(format!(
                    "Decompressed size {} exceeds limit {max_size}",
                    out.len()
                )));
            }
            if out.len() > max_ratio_size {
                return Err(Error::Compression(format!(
                    "Decompression ratio exceeded {MAX_DECOMPRESSION_RATIO}x"
                )));
            }

            if status == flate2::Status::StreamEnd
                || (consumed_total >= input.len() && produced < 4096)
            {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }

        if final_message && !self.config.context_takeover {
            self.decoder = None;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (DeflateContext, DeflateContext) {
        (
            DeflateContext::new(DeflateConfig::default()),
            DeflateContext::new(DeflateConfig::default()),
        )
    }

    #[test]
    fn test_roundtrip_single_block() {
        let (mut tx, mut rx) = pair();
        let original = b"Hello, WebSocket compression! This is a test message.".to_vec();

        let compressed = tx.compress(&original, true).unwrap();
        assert_ne!(compressed, original);

        let restored = rx.decompress(&compressed, true).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_roundtrip_multi_block() {
        let (mut tx, mut rx) = pair();
        let part1 = b"first block ".repeat(20);
        let part2 = b"second block".repeat(20);

        let c1 = tx.compress(&part1, false).unwrap();
        let c2 = tx.compress(&part2, true).unwrap();

        let mut compressed = c1;
        compressed.extend_from_slice(&c2);
        let restored = rx.decompress(&compressed, true).unwrap();

        let mut expected = part1;
        expected.extend_from_slice(&part2);
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_context_takeover_improves_compression() {
        let (mut tx, mut rx) = pair();
        let message = b"The quick brown fox jumps over the lazy dog. ".repeat(10);

        let first = tx.compress(&message, true).unwrap();
        rx.decompress(&first, true).unwrap();

        let second = tx.compress(&message, true).unwrap();
        assert!(
            second.len() <= first.len(),
            "takeover should not hurt: {} > {}",
            second.len(),
            first.len()
        );

        assert_eq!(rx.decompress(&second, true).unwrap(), message);
    }

    #[test]
    fn test_no_context_takeover_resets_window() {
        let config = DeflateConfig::new().context_takeover(false);
        let mut tx = DeflateContext::new(config.clone());
        let mut rx = DeflateContext::new(config);
        let message = b"The quick brown fox jumps over the lazy dog. ".repeat(10);

        let first = tx.compress(&message, true).unwrap();
        rx.decompress(&first, true).unwrap();

        let second = tx.compress(&message, true).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(rx.decompress(&second, true).unwrap(), message);
    }

    #[test]
    fn test_garbage_decompression_fails() {
        let mut ctx = DeflateContext::new(DeflateConfig::default());
        let result = ctx.decompress(&[0xde, 0xad, 0xbe, 0xef, 0x55, 0xAA, 0xFF], true);
        assert!(result.is_err());
    }

    #[test]
    fn test_decompression_size_guard() {
        let mut small = DeflateContext::new(DeflateConfig {
            max_decompressed_size: 100,
            ..DeflateConfig::default()
        });
        let mut tx = DeflateContext::new(DeflateConfig::default());

        let compressed = tx.compress(&vec![0u8; 10_000], true).unwrap();
        assert!(matches!(
            small.decompress(&compressed, true),
            Err(Error::Compression(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(DeflateConfig::new().compression_level(0).is_ok());
        assert!(DeflateConfig::new().compression_level(9).is_ok());
        assert!(DeflateConfig::new().compression_level(10).is_err());
    }

    #[test]
    fn test_rsv_bit_and_threshold() {
        let ctx = DeflateContext::new(DeflateConfig::new().compression_threshold(128));
        assert_eq!(ctx.rsv_bit(), RSV1);
        assert_eq!(ctx.compression_threshold(), 128);
    }
}
