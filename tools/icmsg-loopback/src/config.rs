//! Run configuration, loaded from TOML and overridden from the command line

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use spsc_pbuf::{AllocPolicy, RingFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    BestEffort,
    Exact,
}

impl From<Policy> for AllocPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::BestEffort => AllocPolicy::BestEffort,
            Policy::Exact => AllocPolicy::Exact,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopbackConfig {
    /// Bytes of shared memory per direction, header included
    pub ring_size: usize,
    /// Messages each core sends
    pub messages: u64,
    pub min_len: usize,
    pub max_len: usize,
    /// Doorbell line used in both directions
    pub line: u8,
    pub policy: Policy,
    /// Place the write index on its own cache line
    pub cache_layout: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            ring_size: 4096,
            messages: 10_000,
            min_len: 4,
            max_len: 64,
            line: 0,
            policy: Policy::Exact,
            cache_layout: false,
        }
    }
}

impl LoopbackConfig {
    /// Read `path`, or use the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn ring_flags(&self) -> RingFlags {
        let mut flags = RingFlags::UTILIZATION;
        if self.cache_layout {
            flags |= RingFlags::CACHE;
        }
        flags
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_len < 4 || self.min_len > self.max_len {
            bail!(
                "Message lengths must satisfy 4 <= min_len <= max_len (got {}..{})",
                self.min_len,
                self.max_len
            );
        }
        if self.line >= ipc_mbox::LINE_COUNT {
            bail!("Line {} is out of range", self.line);
        }
        let min = spsc_pbuf::min_region_size(self.ring_flags())
            + spsc_pbuf::frame_size(self.max_len.max(icmsg::MAGIC.len()));
        if self.ring_size < min {
            bail!("ring_size {} cannot carry {} byte messages", self.ring_size, self.max_len);
        }
        Ok(())
    }

    /// Length of message number `seq`
    pub fn message_len(&self, seq: u64) -> usize {
        let span = (self.max_len - self.min_len + 1) as u64;
        self.min_len + (seq.wrapping_mul(2_654_435_761) % span) as usize
    }
}
