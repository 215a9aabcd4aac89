//! Page compression
//!
//! Compresses a single page into caller-provided scratch memory and
//! decompresses back into a page-sized buffer. No allocation happens on
//! either path; output that does not fit the scratch buffer is reported
//! as an error and the caller stores the page raw.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Zstd,
    Lz4,
}

impl CompressionAlgorithm {
    /// Check a compression level for this algorithm
    pub fn validate_level(&self, level: i32) -> Result<()> {
        match self {
            CompressionAlgorithm::Zstd => {
                let range = zstd::compression_level_range();
                if range.contains(&level) {
                    Ok(())
                } else {
                    Err(Error::Config(format!(
                        "zstd level {} outside {:?}",
                        level, range
                    )))
                }
            }
            // lz4 block format has no level
            CompressionAlgorithm::Lz4 => Ok(()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

/// Stateless page compressor
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    level: i32,
}

impl Compressor {
    pub fn new(algorithm: CompressionAlgorithm, level: i32) -> Self {
        Self { algorithm, level }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Compress `src` into `scratch`, returning the compressed length
    pub fn compress(&self, src: &[u8], scratch: &mut [u8]) -> Result<usize> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => {
                zstd::bulk::compress_to_buffer(src, scratch, self.level)
                    .map_err(|e| Error::Compression(format!("zstd compress failed: {}", e)))
            }
            CompressionAlgorithm::Lz4 => lz4_flex::block::compress_into(src, scratch)
                .map_err(|e| Error::Compression(format!("lz4 compress failed: {}", e))),
        }
    }

    /// Decompress `src` into `out`, which must be filled exactly
    pub fn decompress(&self, src: &[u8], out: &mut [u8]) -> Result<()> {
        let written = match self.algorithm {
            CompressionAlgorithm::Zstd => zstd::bulk::decompress_to_buffer(src, out)
                .map_err(|e| Error::Compression(format!("zstd decompress failed: {}", e)))?,
            CompressionAlgorithm::Lz4 => lz4_flex::block::decompress_into(src, out)
                .map_err(|e| Error::Compression(format!("lz4 decompress failed: {}", e)))?,
        };
        if written != out.len() {
            return Err(Error::Compression(format!(
                "decompressed {} bytes, expected {}",
                written,
                out.len()
            )));
        }
        Ok(())
    }
}
