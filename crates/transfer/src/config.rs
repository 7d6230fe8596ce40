//! Admission, pool and session tuning.
//!
//! Everything deserializes from TOML with defaults for every field, so an
//! empty `[transfer]` table yields a working development setup.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::memory::MemorySnapshot;

const KIB: usize = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Deployment tier selecting an admission preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentTier {
    #[default]
    Development,
    Staging,
    Production,
}

impl DeploymentTier {
    /// Preset admission policy for this tier.
    pub fn policy(self) -> AdmissionPolicy {
        let (max_usage_percent, reserved_bytes) = match self {
            DeploymentTier::Development => (100, 0),
            DeploymentTier::Staging => (85, 256 * MIB),
            DeploymentTier::Production => (75, GIB),
        };
        AdmissionPolicy {
            max_usage_percent,
            reserved_bytes,
            footprint_percent: 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentTier::Development => "development",
            DeploymentTier::Staging => "staging",
            DeploymentTier::Production => "production",
        }
    }
}

impl FromStr for DeploymentTier {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(DeploymentTier::Development),
            "staging" => Ok(DeploymentTier::Staging),
            "production" | "prod" => Ok(DeploymentTier::Production),
            other => Err(TransferError::InvalidConfig(format!(
                "unknown deployment tier: {other}"
            ))),
        }
    }
}

/// Thresholds the [`AdmissionController`](crate::AdmissionController)
/// checks on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    /// Deny outright when host memory usage is above this percentage.
    pub max_usage_percent: u8,
    /// Bytes of available memory that are never handed out.
    pub reserved_bytes: u64,
    /// Estimated in-relay footprint of a transfer, as a percentage of its
    /// declared size.
    pub footprint_percent: u8,
}

impl AdmissionPolicy {
    /// Estimated footprint of a transfer declaring `declared_size` bytes.
    pub fn estimate_footprint(&self, declared_size: u64) -> u64 {
        let bytes = declared_size as u128 * self.footprint_percent as u128 / 100;
        bytes.min(u64::MAX as u128) as u64
    }

    /// Bytes transfers may reserve in total given the current snapshot:
    /// `(available - reserved) * max_usage_percent / 100`.
    pub fn budget(&self, snapshot: &MemorySnapshot) -> u64 {
        let usable = snapshot.available_bytes.saturating_sub(self.reserved_bytes);
        (usable as u128 * self.max_usage_percent as u128 / 100) as u64
    }

    /// Checks the policy against the smallest host it will be deployed on.
    ///
    /// `reserved_bytes` may be at most half of `min_host_bytes`, otherwise a
    /// small host would refuse every transfer.
    pub fn validate_for_host(&self, min_host_bytes: u64) -> Result<(), TransferError> {
        if self.max_usage_percent == 0 || self.max_usage_percent > 100 {
            return Err(TransferError::InvalidConfig(format!(
                "max_usage_percent must be in 1..=100, got {}",
                self.max_usage_percent
            )));
        }
        if self.footprint_percent == 0 || self.footprint_percent > 100 {
            return Err(TransferError::InvalidConfig(format!(
                "footprint_percent must be in 1..=100, got {}",
                self.footprint_percent
            )));
        }
        if self.reserved_bytes > min_host_bytes / 2 {
            return Err(TransferError::InvalidConfig(format!(
                "reserved_bytes ({}) exceeds half of the smallest host ({min_host_bytes})",
                self.reserved_bytes
            )));
        }
        Ok(())
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        DeploymentTier::default().policy()
    }
}

/// Optional per-field overrides applied on top of a tier preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionOverrides {
    pub max_usage_percent: Option<u8>,
    pub reserved_bytes: Option<u64>,
    pub footprint_percent: Option<u8>,
}

/// Buffer size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferTier {
    Small,
    Medium,
    Large,
}

impl BufferTier {
    /// Tiers ordered by buffer size.
    pub const ALL: [BufferTier; 3] = [BufferTier::Small, BufferTier::Medium, BufferTier::Large];

    pub(crate) fn index(self) -> usize {
        match self {
            BufferTier::Small => 0,
            BufferTier::Medium => 1,
            BufferTier::Large => 2,
        }
    }
}

/// Sizing of one buffer tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Capacity of every buffer in the tier.
    pub buffer_size: usize,
    /// Upper bound on pooled buffers alive at once (idle + checked out).
    pub max_buffers: usize,
    /// Buffers allocated up front.
    pub baseline: usize,
}

/// Per-tier buffer pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub small: TierConfig,
    pub medium: TierConfig,
    pub large: TierConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small: TierConfig {
                buffer_size: 64 * KIB,
                max_buffers: 64,
                baseline: 4,
            },
            medium: TierConfig {
                buffer_size: 1024 * KIB,
                max_buffers: 32,
                baseline: 2,
            },
            large: TierConfig {
                buffer_size: 4096 * KIB,
                max_buffers: 16,
                baseline: 1,
            },
        }
    }
}

impl PoolConfig {
    pub fn tier(&self, tier: BufferTier) -> &TierConfig {
        match tier {
            BufferTier::Small => &self.small,
            BufferTier::Medium => &self.medium,
            BufferTier::Large => &self.large,
        }
    }

    /// Largest chunk payload the pool can hold.
    pub fn max_chunk_size(&self) -> usize {
        self.large.buffer_size
    }

    /// Upper bound on bytes held by pooled (non-transient) buffers.
    pub fn resident_bound_bytes(&self) -> u64 {
        BufferTier::ALL
            .iter()
            .map(|t| {
                let cfg = self.tier(*t);
                cfg.buffer_size as u64 * cfg.max_buffers as u64
            })
            .sum()
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        let mut previous = 0usize;
        for tier in BufferTier::ALL {
            let cfg = self.tier(tier);
            if cfg.buffer_size == 0 || cfg.max_buffers == 0 {
                return Err(TransferError::InvalidConfig(format!(
                    "{tier:?} tier needs a non-zero buffer_size and max_buffers"
                )));
            }
            if cfg.baseline > cfg.max_buffers {
                return Err(TransferError::InvalidConfig(format!(
                    "{tier:?} tier baseline ({}) exceeds max_buffers ({})",
                    cfg.baseline, cfg.max_buffers
                )));
            }
            if cfg.buffer_size <= previous {
                return Err(TransferError::InvalidConfig(
                    "buffer sizes must strictly increase from small to large".into(),
                ));
            }
            previous = cfg.buffer_size;
        }
        Ok(())
    }
}

/// Per-session timing and queueing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Emit progress at least this often while bytes keep arriving.
    pub progress_interval_ms: u64,
    /// Emit progress whenever the percentage advanced by this much.
    pub progress_step_percent: f64,
    /// How long a cancelled session may take to stop on its own before it
    /// is torn down.
    pub cancel_timeout_ms: u64,
    /// A non-terminal session with no activity for this long is reaped.
    pub idle_timeout_ms: u64,
    /// Period of the idle reaper.
    pub reap_interval_ms: u64,
    /// How long a finished session stays queryable before it is forgotten.
    pub terminal_retention_ms: u64,
    /// Inbound frames queued between the socket and the session worker.
    pub inbound_queue: usize,
    /// Chunk size suggested to clients.
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 500,
            progress_step_percent: 2.0,
            cancel_timeout_ms: 5_000,
            idle_timeout_ms: 120_000,
            reap_interval_ms: 1_000,
            terminal_retention_ms: 60_000,
            inbound_queue: 8,
            chunk_size: uplink_protocol::constants::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_millis(self.terminal_retention_ms)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.inbound_queue == 0 {
            return Err(TransferError::InvalidConfig(
                "inbound_queue must be at least 1".into(),
            ));
        }
        if self.reap_interval_ms == 0 {
            return Err(TransferError::InvalidConfig(
                "reap_interval_ms must be non-zero".into(),
            ));
        }
        if !(self.progress_step_percent > 0.0 && self.progress_step_percent <= 100.0) {
            return Err(TransferError::InvalidConfig(format!(
                "progress_step_percent must be in (0, 100], got {}",
                self.progress_step_percent
            )));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidConfig("chunk_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Complete configuration of the transfer core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub tier: DeploymentTier,
    #[serde(flatten)]
    pub overrides: AdmissionOverrides,
    /// How long a memory sample is reused; `0` samples on every request.
    pub sample_ttl_ms: u64,
    /// Total memory of the smallest host this configuration targets.
    pub min_host_bytes: u64,
    pub pool: PoolConfig,
    pub session: SessionConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            tier: DeploymentTier::default(),
            overrides: AdmissionOverrides::default(),
            sample_ttl_ms: 250,
            min_host_bytes: 2 * GIB,
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl TransferConfig {
    /// The tier preset with any overrides applied.
    pub fn admission_policy(&self) -> AdmissionPolicy {
        let mut policy = self.tier.policy();
        if let Some(v) = self.overrides.max_usage_percent {
            policy.max_usage_percent = v;
        }
        if let Some(v) = self.overrides.reserved_bytes {
            policy.reserved_bytes = v;
        }
        if let Some(v) = self.overrides.footprint_percent {
            policy.footprint_percent = v;
        }
        policy
    }

    pub fn sample_ttl(&self) -> Duration {
        Duration::from_millis(self.sample_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        self.admission_policy()
            .validate_for_host(self.min_host_bytes)?;
        self.pool.validate()?;
        self.session.validate()?;
        if self.session.chunk_size > self.pool.max_chunk_size() {
            return Err(TransferError::InvalidConfig(format!(
                "chunk_size ({}) exceeds the largest buffer tier ({})",
                self.session.chunk_size,
                self.pool.max_chunk_size()
            )));
        }
        Ok(())
    }
}
