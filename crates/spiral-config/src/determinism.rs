use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::env;

/// Seed policy for everything that generates data around the runtime:
/// conformance inputs, benchmark fixtures and the `topk_bench` binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether seeded generation is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-label seeds.
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: 42,
        }
    }
}

impl DeterminismConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env::flag("SPIRAL_DETERMINISTIC").unwrap_or(defaults.enabled),
            base_seed: env::parse::<u64>("SPIRAL_DETERMINISTIC_SEED")
                .unwrap_or(defaults.base_seed),
        }
    }

    /// Derives a stable seed for a given label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs `cfg` unless a configuration was already observed. Returns the
/// configuration that is in effect.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

/// RNG derived from `label`; entropy-seeded when determinism is off.
pub fn rng_from_label(label: &str) -> StdRng {
    let cfg = config();
    if cfg.enabled {
        StdRng::seed_from_u64(cfg.seed_for(label))
    } else {
        StdRng::from_entropy()
    }
}

/// An explicit seed always wins over the process policy.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}
