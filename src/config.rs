//! Typed configuration knobs for the storage layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The default uncompressed chunk granularity: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// The default compressed-byte goal per frame: 2 MiB.
pub const DEFAULT_TARGET_FRAME_SIZE: usize = 2 * 1024 * 1024;
/// The default compressed-byte goal per upload part: 8 MiB.
pub const DEFAULT_TARGET_PART_SIZE: usize = 8 * 1024 * 1024;
/// The number of chunks the encoder is allowed to produce ahead of the uploader.
pub const ENCODE_AHEAD_CHUNKS: usize = 8;

/// Exponential backoff with full jitter, applied to retryable wire errors.
///
/// `backoff(k) = min(max_backoff, initial_backoff * multiplier^k)`, and the actual sleep drawn
/// is `U(0, backoff(k))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Every configuration knob governing chunking, framing, uploads, and the cache.
///
/// # Examples
///
/// ```
/// use snapstore::config::StorageConfig;
///
/// let cfg = StorageConfig::new()
///     .with_chunk_size(2048)
///     .with_target_frame_size(1024)
///     .with_target_part_size(2048)
///     .with_max_upload_concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(cfg.chunk_size(), 2048);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    chunk_size: usize,
    target_frame_size: usize,
    target_part_size: usize,
    compression_level: i32,
    compression_concurrency: u32,
    max_upload_concurrency: usize,
    retry: RetryConfig,
    enable_write_through_cache: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            target_frame_size: DEFAULT_TARGET_FRAME_SIZE,
            target_part_size: DEFAULT_TARGET_PART_SIZE,
            compression_level: 3,
            compression_concurrency: 0,
            max_upload_concurrency: 8,
            retry: RetryConfig::default(),
            enable_write_through_cache: false,
        }
    }
}

impl StorageConfig {
    /// Starts building a config from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_target_frame_size(mut self, size: usize) -> Self {
        self.target_frame_size = size;
        self
    }

    pub fn with_target_part_size(mut self, size: usize) -> Self {
        self.target_part_size = size;
        self
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_compression_concurrency(mut self, workers: u32) -> Self {
        self.compression_concurrency = workers;
        self
    }

    pub fn with_max_upload_concurrency(mut self, n: usize) -> Self {
        self.max_upload_concurrency = n;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_enable_write_through_cache(mut self, enable: bool) -> Self {
        self.enable_write_through_cache = enable;
        self
    }

    /// Validates the accumulated settings.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Invalid`] if any size knob is zero or the retry multiplier is not
    /// positive.
    pub fn build(self) -> Result<Self> {
        if self.chunk_size == 0 {
            return Err(Error::invalid("chunk_size must be > 0"));
        }
        if self.target_frame_size == 0 {
            return Err(Error::invalid("target_frame_size must be > 0"));
        }
        if self.target_part_size == 0 {
            return Err(Error::invalid("target_part_size must be > 0"));
        }
        if self.max_upload_concurrency == 0 {
            return Err(Error::invalid("max_upload_concurrency must be > 0"));
        }
        if self.retry.multiplier <= 0.0 {
            return Err(Error::invalid("retry.multiplier must be > 0"));
        }
        Ok(self)
    }
}

impl StorageConfig {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
    pub fn target_frame_size(&self) -> usize {
        self.target_frame_size
    }
    pub fn target_part_size(&self) -> usize {
        self.target_part_size
    }
    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }
    pub fn compression_concurrency(&self) -> u32 {
        self.compression_concurrency
    }
    pub fn max_upload_concurrency(&self) -> usize {
        self.max_upload_concurrency
    }
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
    pub fn enable_write_through_cache(&self) -> bool {
        self.enable_write_through_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        StorageConfig::new().build().unwrap();
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = StorageConfig::new().with_chunk_size(0).build().unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn serde_round_trip() {
        let cfg = StorageConfig::new().with_chunk_size(1234).build().unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chunk_size(), 1234);
    }
}
