//! Adaptive payload compression.
//!
//! Algorithm selection samples the Shannon entropy of the first 1 KiB:
//! high-entropy input (already compressed or encrypted) gets the cheap
//! gzip pass, low-entropy input gets bz2 (small) or lzma (large), and the
//! middle ground gets zlib.  Inputs below 1 KiB or above 10 MiB pass
//! through uncompressed.
//!
//! Results land in a capacity-bounded FIFO cache keyed by content hash and
//! algorithm.  The async entry points off-load inputs larger than 50 KiB
//! to the blocking pool.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Inputs above this size compress on the blocking pool in the async path.
const ASYNC_OFFLOAD_THRESHOLD: usize = 50_000;

/// Entropy sample size (leading bytes).
const ENTROPY_SAMPLE: usize = 1000;

/// Low-entropy inputs larger than this use lzma instead of bz2.
const LZMA_SIZE_THRESHOLD: usize = 100_000;

/// Supported algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    Zlib,
    Bz2,
    Lzma,
}

impl CompressionAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Bz2 => "bz2",
            CompressionAlgorithm::Lzma => "lzma",
        }
    }
}

/// Errors from compression operations.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

/// Tuning knobs.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Used when adaptive selection is off and no explicit algorithm is
    /// passed.
    pub algorithm: CompressionAlgorithm,
    /// Encoder effort, 1 (fast) ..= 9 (best).
    pub level: u32,
    pub min_size_threshold: usize,
    pub max_size_threshold: usize,
    pub adaptive: bool,
    pub cache_capacity: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
            min_size_threshold: 1024,
            max_size_threshold: 10 * 1024 * 1024,
            adaptive: true,
            cache_capacity: 1000,
        }
    }
}

/// What happened to one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOutcome {
    pub algorithm: CompressionAlgorithm,
    pub original_size: usize,
    pub compressed_size: usize,
    pub cached: bool,
}

/// Operation counters.
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    pub total_compressed: u64,
    pub total_decompressed: u64,
    pub bytes_saved: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub algorithm_usage: HashMap<&'static str, u64>,
}

type CacheKey = (String, CompressionAlgorithm);

struct Cache {
    map: HashMap<CacheKey, Vec<u8>>,
    fifo: VecDeque<CacheKey>,
    capacity: usize,
}

impl Cache {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, value: Vec<u8>) {
        if self.capacity == 0 || self.map.contains_key(&key) {
            return;
        }
        while self.map.len() >= self.capacity {
            let Some(oldest) = self.fifo.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
        }
        self.fifo.push_back(key.clone());
        self.map.insert(key, value);
    }
}

/// Compression middleware with adaptive algorithm selection and a bounded
/// result cache.
pub struct CompressionMiddleware {
    config: CompressionConfig,
    cache: Mutex<Cache>,
    stats: Mutex<CompressionStats>,
}

impl CompressionMiddleware {
    pub fn new(config: CompressionConfig) -> Self {
        let capacity = config.cache_capacity;
        CompressionMiddleware {
            config,
            cache: Mutex::new(Cache {
                map: HashMap::new(),
                fifo: VecDeque::new(),
                capacity,
            }),
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Synchronous API
    // -----------------------------------------------------------------------

    /// Compress `data`, auto-selecting the algorithm unless one is forced.
    pub fn compress(
        &self,
        data: &[u8],
        algorithm: Option<CompressionAlgorithm>,
    ) -> Result<(Vec<u8>, CompressionOutcome), CompressionError> {
        let original_size = data.len();

        if original_size < self.config.min_size_threshold
            || original_size > self.config.max_size_threshold
        {
            return Ok((
                data.to_vec(),
                CompressionOutcome {
                    algorithm: CompressionAlgorithm::None,
                    original_size,
                    compressed_size: original_size,
                    cached: false,
                },
            ));
        }

        let algorithm = algorithm.unwrap_or_else(|| self.select_algorithm(data));
        if algorithm == CompressionAlgorithm::None {
            return Ok((
                data.to_vec(),
                CompressionOutcome {
                    algorithm,
                    original_size,
                    compressed_size: original_size,
                    cached: false,
                },
            ));
        }

        let key = (content_hash(data), algorithm);
        if let Some(cached) = self.cache.lock().expect("cache poisoned").get(&key) {
            let mut stats = self.stats.lock().expect("stats poisoned");
            stats.cache_hits += 1;
            let compressed_size = cached.len();
            return Ok((
                cached,
                CompressionOutcome {
                    algorithm,
                    original_size,
                    compressed_size,
                    cached: true,
                },
            ));
        }

        let compressed = compress_with(data, algorithm, self.config.level)?;
        Ok(self.finish_compress(key, original_size, compressed, algorithm))
    }

    /// Shared tail of the sync and async compression paths: statistics,
    /// cache insertion, outcome.
    fn finish_compress(
        &self,
        key: CacheKey,
        original_size: usize,
        compressed: Vec<u8>,
        algorithm: CompressionAlgorithm,
    ) -> (Vec<u8>, CompressionOutcome) {
        let compressed_size = compressed.len();
        {
            let mut stats = self.stats.lock().expect("stats poisoned");
            stats.cache_misses += 1;
            stats.total_compressed += 1;
            stats.bytes_saved += (original_size as u64).saturating_sub(compressed_size as u64);
            *stats.algorithm_usage.entry(algorithm.name()).or_insert(0) += 1;
        }

        // Only results that earn their keep get cached.
        #[allow(clippy::cast_precision_loss)]
        let ratio = original_size as f64 / compressed_size.max(1) as f64;
        if ratio > 1.2 {
            self.cache
                .lock()
                .expect("cache poisoned")
                .insert(key, compressed.clone());
        }

        debug!(
            original_size,
            compressed_size,
            algorithm = algorithm.name(),
            "payload compressed"
        );
        (
            compressed,
            CompressionOutcome {
                algorithm,
                original_size,
                compressed_size,
                cached: false,
            },
        )
    }

    /// Invert [`Self::compress`] given the algorithm that produced the
    /// data.
    pub fn decompress(
        &self,
        data: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> Result<Vec<u8>, CompressionError> {
        let out = decompress_with(data, algorithm)?;
        self.stats.lock().expect("stats poisoned").total_decompressed += 1;
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Async API
    // -----------------------------------------------------------------------

    /// Like [`Self::compress`], but inputs past the off-load threshold run
    /// on the blocking pool so CPU-bound work stays off the I/O scheduler.
    pub async fn compress_async(
        &self,
        data: Vec<u8>,
        algorithm: Option<CompressionAlgorithm>,
    ) -> Result<(Vec<u8>, CompressionOutcome), CompressionError> {
        if data.len() <= ASYNC_OFFLOAD_THRESHOLD {
            return self.compress(&data, algorithm);
        }
        if data.len() > self.config.max_size_threshold {
            let original_size = data.len();
            return Ok((
                data,
                CompressionOutcome {
                    algorithm: CompressionAlgorithm::None,
                    original_size,
                    compressed_size: original_size,
                    cached: false,
                },
            ));
        }

        let algorithm = algorithm.unwrap_or_else(|| self.select_algorithm(&data));
        if algorithm == CompressionAlgorithm::None {
            let original_size = data.len();
            return Ok((
                data,
                CompressionOutcome {
                    algorithm,
                    original_size,
                    compressed_size: original_size,
                    cached: false,
                },
            ));
        }

        let key = (content_hash(&data), algorithm);
        if let Some(cached) = self.cache.lock().expect("cache poisoned").get(&key) {
            self.stats.lock().expect("stats poisoned").cache_hits += 1;
            let compressed_size = cached.len();
            return Ok((
                cached,
                CompressionOutcome {
                    algorithm,
                    original_size: data.len(),
                    compressed_size,
                    cached: true,
                },
            ));
        }

        // Only the CPU-heavy part moves to the blocking pool; bookkeeping
        // stays on this task.
        let original_size = data.len();
        let level = self.config.level;
        let compressed =
            tokio::task::spawn_blocking(move || compress_with(&data, algorithm, level))
                .await
                .expect("compression task panicked")?;
        Ok(self.finish_compress(key, original_size, compressed, algorithm))
    }

    pub async fn decompress_async(
        &self,
        data: Vec<u8>,
        algorithm: CompressionAlgorithm,
    ) -> Result<Vec<u8>, CompressionError> {
        if data.len() <= ASYNC_OFFLOAD_THRESHOLD {
            return self.decompress(&data, algorithm);
        }
        let out = tokio::task::spawn_blocking(move || decompress_with(&data, algorithm))
            .await
            .expect("decompression task panicked")?;
        self.stats.lock().expect("stats poisoned").total_decompressed += 1;
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    fn select_algorithm(&self, data: &[u8]) -> CompressionAlgorithm {
        if !self.config.adaptive {
            return self.config.algorithm;
        }
        let entropy = shannon_entropy(&data[..data.len().min(ENTROPY_SAMPLE)]);
        if entropy > 7.5 {
            // Already dense; a cheap pass is all that is worth doing.
            CompressionAlgorithm::Gzip
        } else if entropy < 4.0 {
            if data.len() > LZMA_SIZE_THRESHOLD {
                CompressionAlgorithm::Lzma
            } else {
                CompressionAlgorithm::Bz2
            }
        } else {
            CompressionAlgorithm::Zlib
        }
    }

    pub fn statistics(&self) -> CompressionStats {
        self.stats.lock().expect("stats poisoned").clone()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("cache poisoned").map.len()
    }
}

/// Shannon entropy in bits per byte over the sample.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }
    #[allow(clippy::cast_precision_loss)]
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            #[allow(clippy::cast_precision_loss)]
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn compress_with(
    data: &[u8],
    algorithm: CompressionAlgorithm,
    level: u32,
) -> Result<Vec<u8>, CompressionError> {
    let result = match algorithm {
        CompressionAlgorithm::None => return Ok(data.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(data).and_then(|()| encoder.finish())
        }
        CompressionAlgorithm::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(data).and_then(|()| encoder.finish())
        }
        CompressionAlgorithm::Bz2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(level));
            encoder.write_all(data).and_then(|()| encoder.finish())
        }
        CompressionAlgorithm::Lzma => {
            let mut encoder = xz2::write::XzEncoder::new(Vec::new(), level);
            encoder.write_all(data).and_then(|()| encoder.finish())
        }
    };
    result.map_err(CompressionError::Compress)
}

fn decompress_with(
    data: &[u8],
    algorithm: CompressionAlgorithm,
) -> Result<Vec<u8>, CompressionError> {
    let result = match algorithm {
        CompressionAlgorithm::None => return Ok(data.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::write::GzDecoder::new(Vec::new());
            decoder.write_all(data).and_then(|()| decoder.finish())
        }
        CompressionAlgorithm::Zlib => {
            let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
            decoder.write_all(data).and_then(|()| decoder.finish())
        }
        CompressionAlgorithm::Bz2 => {
            let mut decoder = bzip2::write::BzDecoder::new(Vec::new());
            decoder.write_all(data).and_then(|()| decoder.finish())
        }
        CompressionAlgorithm::Lzma => {
            let mut decoder = xz2::write::XzDecoder::new(Vec::new());
            decoder.write_all(data).and_then(|()| decoder.finish())
        }
    };
    result.map_err(CompressionError::Decompress)
}
