// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default number of in-flight task slots in the circular window.
const DEFAULT_TASK_WINDOW_SIZE: usize = 16384;

/// Default number of nodes in the shared successor-list pool.
const DEFAULT_SUCCESSOR_POOL_SIZE: usize = 65536;

/// Default number of hash buckets in the tensor map.
const DEFAULT_TENSORMAP_BUCKETS: usize = 4096;

/// Default number of entries in the tensor-map ring pool.
const DEFAULT_TENSORMAP_POOL_SIZE: usize = 32768;

/// Default size of the on-device heap, in bytes.
const DEFAULT_HEAP_SIZE: usize = 256 * 1024;

/// Default number of watermark advances between eager tensor-map cleanups.
const DEFAULT_CLEANUP_INTERVAL: i32 = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Sizing knobs of the runtime. All pool sizes are fixed at initialization;
/// the shared-memory layout is computed from these values.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of in-flight task slots. Power of two.
    pub task_window_size: usize,
    /// Number of successor-list nodes shared by all tasks.
    pub successor_pool_size: usize,
    /// Number of tensor-map hash buckets. Power of two.
    pub tensormap_buckets: usize,
    /// Number of tensor-map entries in the ring pool.
    pub tensormap_pool_size: usize,
    /// Size of the on-device heap in bytes.
    pub heap_size: usize,
    /// Watermark advances between eager tensor-map cleanups.
    pub cleanup_interval: i32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RuntimeConfig {
    /// Loads a configuration from a YAML document. Absent keys keep their
    /// default values.
    pub fn from_yaml(text: &str) -> Result<Self, Fail> {
        let docs: Vec<Yaml> = match YamlLoader::load_from_str(text) {
            Ok(docs) => docs,
            Err(_) => return Err(Fail::new(libc::EINVAL, "malformed yaml configuration")),
        };
        let root: &Yaml = match &docs[..] {
            [root] => root,
            _ => return Err(Fail::new(libc::EINVAL, "configuration must hold exactly one document")),
        };

        let mut config: RuntimeConfig = RuntimeConfig::default();
        let section: &Yaml = &root["taskring"];
        if let Some(value) = section["task_window_size"].as_i64() {
            config.task_window_size = value as usize;
        }
        if let Some(value) = section["successor_pool_size"].as_i64() {
            config.successor_pool_size = value as usize;
        }
        if let Some(value) = section["tensormap_buckets"].as_i64() {
            config.tensormap_buckets = value as usize;
        }
        if let Some(value) = section["tensormap_pool_size"].as_i64() {
            config.tensormap_pool_size = value as usize;
        }
        if let Some(value) = section["heap_size"].as_i64() {
            config.heap_size = value as usize;
        }
        if let Some(value) = section["cleanup_interval"].as_i64() {
            config.cleanup_interval = value as i32;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the structural constraints that the shared-memory layout and
    /// the index arithmetic depend on.
    pub fn validate(&self) -> Result<(), Fail> {
        if !self.task_window_size.is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "task window size must be a power of two"));
        }
        if !self.tensormap_buckets.is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "tensor map bucket count must be a power of two"));
        }
        if self.tensormap_pool_size < self.task_window_size {
            // A window full of single-output tasks must fit in the entry pool,
            // otherwise the insert path spins on slots of live producers.
            return Err(Fail::new(
                libc::EINVAL,
                "tensor map pool must hold at least one entry per window slot",
            ));
        }
        if self.successor_pool_size == 0 || self.heap_size == 0 {
            return Err(Fail::new(libc::EINVAL, "pool sizes must be non-zero"));
        }
        if self.cleanup_interval <= 0 {
            return Err(Fail::new(libc::EINVAL, "cleanup interval must be positive"));
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default trait implementation.
impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_window_size: DEFAULT_TASK_WINDOW_SIZE,
            successor_pool_size: DEFAULT_SUCCESSOR_POOL_SIZE,
            tensormap_buckets: DEFAULT_TENSORMAP_BUCKETS,
            tensormap_pool_size: DEFAULT_TENSORMAP_POOL_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
