//! Governor configuration.
//!
//! Every field is optional; unset (or zero) fields take defaults derived from
//! the machine's physical memory when the configuration is resolved.
//!
//! ```ignore
//! let config: GovernorConfig = serde_json::from_str(r#"{ "max_heap_bytes": 268435456 }"#)?;
//! let resolved = config.resolve();
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Used when the platform cannot report its physical memory.
const FALLBACK_PHYSICAL_MEMORY: u64 = 4 * GIB;

const DEFAULT_MAX_HEAP_CAP: u64 = GIB;
const DEFAULT_GROWTH_CAP: u64 = 50 * MIB;
const DEFAULT_SLICE_BUDGET_MS: u64 = 5;
const DEFAULT_CHECK_DELAY_MS: u64 = 50;
const DEFAULT_ALLOC_COUNT_TRIGGER: u64 = 50;

/// Raw, user-facing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Soft ceiling on total heap bytes.
    pub max_heap_bytes: Option<u64>,

    /// Growth over the last-seen total that triggers a collection.
    pub heap_growth_trigger: Option<u64>,

    /// Incremental slice budget in milliseconds.
    pub slice_time_budget_ms: Option<u64>,

    /// Minimum interval between two collection checks, in milliseconds.
    pub check_delay_ms: Option<u64>,

    /// Allocation count growth that triggers an incremental collection.
    pub alloc_count_trigger: Option<u64>,
}

/// Settings with every default applied and every clamp enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedGovernorConfig {
    pub max_heap_bytes: u64,
    pub heap_growth_trigger: u64,
    pub slice_budget: Duration,
    pub check_delay_ms: u64,
    pub alloc_count_trigger: u64,
}

impl GovernorConfig {
    /// Read overrides from `PANEL_GC_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self {
            max_heap_bytes: env_u64("PANEL_GC_MAX_HEAP"),
            heap_growth_trigger: env_u64("PANEL_GC_MAX_HEAP_GROWTH"),
            slice_time_budget_ms: env_u64("PANEL_GC_BUDGET"),
            check_delay_ms: env_u64("PANEL_GC_DELAY"),
            alloc_count_trigger: env_u64("PANEL_GC_MAX_ALLOC_INCREASE"),
        }
    }

    pub fn resolve(&self) -> ResolvedGovernorConfig {
        self.resolve_with_physical_memory(physical_memory_bytes())
    }

    pub fn resolve_with_physical_memory(&self, physical: u64) -> ResolvedGovernorConfig {
        let max_heap_bytes = match non_zero(self.max_heap_bytes) {
            Some(max) => max.min(physical),
            None => (physical / 4).min(DEFAULT_MAX_HEAP_CAP),
        };

        let heap_growth_trigger = match non_zero(self.heap_growth_trigger) {
            Some(growth) => growth.min(max_heap_bytes / 2),
            None => (max_heap_bytes / 8).min(DEFAULT_GROWTH_CAP),
        };

        ResolvedGovernorConfig {
            max_heap_bytes,
            heap_growth_trigger,
            slice_budget: Duration::from_millis(
                non_zero(self.slice_time_budget_ms).unwrap_or(DEFAULT_SLICE_BUDGET_MS),
            ),
            check_delay_ms: self.check_delay_ms.unwrap_or(DEFAULT_CHECK_DELAY_MS),
            alloc_count_trigger: non_zero(self.alloc_count_trigger)
                .unwrap_or(DEFAULT_ALLOC_COUNT_TRIGGER),
        }
    }
}

impl Default for ResolvedGovernorConfig {
    fn default() -> Self {
        GovernorConfig::default().resolve()
    }
}

fn non_zero(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v != 0)
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

/// Total physical memory of the machine.
pub fn physical_memory_bytes() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if pages > 0 && page_size > 0 {
            return (pages as u64).saturating_mul(page_size as u64);
        }
    }

    FALLBACK_PHYSICAL_MEMORY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_on_large_machine() {
        let resolved = GovernorConfig::default().resolve_with_physical_memory(16 * GIB);
        assert_eq!(resolved.max_heap_bytes, GIB);
        assert_eq!(resolved.heap_growth_trigger, 50 * MIB);
        assert_eq!(resolved.slice_budget, Duration::from_millis(5));
        assert_eq!(resolved.check_delay_ms, 50);
        assert_eq!(resolved.alloc_count_trigger, 50);
    }

    #[test]
    fn test_defaults_on_small_machine() {
        let resolved = GovernorConfig::default().resolve_with_physical_memory(GIB);
        assert_eq!(resolved.max_heap_bytes, 256 * MIB);
        assert_eq!(resolved.heap_growth_trigger, 32 * MIB);
    }

    #[test]
    fn test_max_heap_clamped_to_physical_memory() {
        let config = GovernorConfig {
            max_heap_bytes: Some(64 * GIB),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_with_physical_memory(8 * GIB).max_heap_bytes,
            8 * GIB
        );
    }

    #[test]
    fn test_growth_clamped_to_half_of_max() {
        let config = GovernorConfig {
            max_heap_bytes: Some(100),
            heap_growth_trigger: Some(80),
            ..Default::default()
        };
        let resolved = config.resolve_with_physical_memory(GIB);
        assert_eq!(resolved.heap_growth_trigger, 50);
    }

    #[test]
    fn test_zero_means_default() {
        let config = GovernorConfig {
            max_heap_bytes: Some(0),
            alloc_count_trigger: Some(0),
            ..Default::default()
        };
        let resolved = config.resolve_with_physical_memory(16 * GIB);
        assert_eq!(resolved.max_heap_bytes, GIB);
        assert_eq!(resolved.alloc_count_trigger, 50);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: GovernorConfig =
            serde_json::from_str(r#"{ "max_heap_bytes": 1000, "check_delay_ms": 0 }"#).unwrap();
        assert_eq!(config.max_heap_bytes, Some(1000));
        assert_eq!(config.check_delay_ms, Some(0));
        assert_eq!(config.slice_time_budget_ms, None);
    }

    #[test]
    fn test_physical_memory_is_reported() {
        assert!(physical_memory_bytes() > 0);
    }
}
