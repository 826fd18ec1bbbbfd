//! Compressor selection for chunks, archives and manifests.

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use async_compression::Level;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    #[default]
    Zstd,
    Gzip,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Gzip => "gzip",
        }
    }
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            other => anyhow::bail!("unknown compression algorithm {other:?}"),
        }
    }
}

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_level")]
    pub level: i32,
}

fn default_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            algorithm: CompressionAlgorithm::default(),
            level: default_level(),
        }
    }
}

/// Write-side encoder: bytes written come out compressed on `writer`.
/// The caller must `shutdown()` the returned writer to flush the trailer.
pub fn encoder<W>(
    config: CompressionConfig,
    writer: W,
) -> Box<dyn AsyncWrite + Send + Sync + Unpin>
where
    W: AsyncWrite + Send + Sync + Unpin + 'static,
{
    match config.algorithm {
        CompressionAlgorithm::Zstd => Box::new(ZstdEncoder::with_quality(
            writer,
            Level::Precise(config.level),
        )),
        CompressionAlgorithm::Gzip => Box::new(GzipEncoder::with_quality(
            writer,
            Level::Precise(config.level),
        )),
    }
}

/// Read-side decoder matching [`encoder`].
pub fn decoder<R>(
    algorithm: CompressionAlgorithm,
    reader: R,
) -> Box<dyn AsyncRead + Send + Sync + Unpin>
where
    R: AsyncBufRead + Send + Sync + Unpin + 'static,
{
    match algorithm {
        CompressionAlgorithm::Zstd => {
            let mut decoder = ZstdDecoder::new(reader);
            // Chunks are written as independent frames by concurrent writers.
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        CompressionAlgorithm::Gzip => {
            let mut decoder = GzipDecoder::new(reader);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
    }
}
