/// Importance weighting for memory records.
///
/// The weight of a record drifts over time: it decays with age at a rate
/// that depends on the record's layer, gets nudged by how recently it was
/// accessed, and by the context of the current retrieval. Every update is
/// clamped twice, first on the delta and then on the absolute value, so no
/// single update can move a record across more than one layer boundary.
///
/// ## Layers
///
/// ```text
/// weight ≥ 9.0 → core
/// weight ≥ 7.0 → archive
/// weight ≥ 4.0 → long_term
/// otherwise    → short_term
/// ```
///
/// [`WeightEngine`] is pure: it never touches storage. Persisting the new
/// weight and logging the transition is the caller's job.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::error::{RecallError, RecallResult};
use crate::types::{MAX_WEIGHT, MIN_WEIGHT, MemoryRecord};

const SECONDS_PER_DAY: f64 = 86_400.0;
const SECONDS_PER_HOUR: f64 = 3_600.0;

/// Importance layer, ordered from least to most durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Recent chatter, fades within weeks
    ShortTerm,
    /// Worth keeping for months
    LongTerm,
    /// Rarely needed but valuable
    Archive,
    /// Defining facts, practically never fade
    Core,
}

impl Layer {
    /// Lower bound (inclusive) of each layer.
    pub const CORE_FLOOR: f64 = 9.0;
    /// Lower bound (inclusive) of the archive layer.
    pub const ARCHIVE_FLOOR: f64 = 7.0;
    /// Lower bound (inclusive) of the long-term layer.
    pub const LONG_TERM_FLOOR: f64 = 4.0;

    /// Classify a weight. Total over all floats; NaN is short-term.
    pub fn classify(weight: f64) -> Layer {
        if weight >= Self::CORE_FLOOR {
            Layer::Core
        } else if weight >= Self::ARCHIVE_FLOOR {
            Layer::Archive
        } else if weight >= Self::LONG_TERM_FLOOR {
            Layer::LongTerm
        } else {
            Layer::ShortTerm
        }
    }

    /// Stable name used in logs and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::ShortTerm => "short_term",
            Layer::LongTerm => "long_term",
            Layer::Archive => "archive",
            Layer::Core => "core",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-layer daily retention factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerRates {
    pub core: f64,
    pub archive: f64,
    pub long_term: f64,
    pub short_term: f64,
}

impl LayerRates {
    /// Rate for a layer.
    pub fn for_layer(&self, layer: Layer) -> f64 {
        match layer {
            Layer::Core => self.core,
            Layer::Archive => self.archive,
            Layer::LongTerm => self.long_term,
            Layer::ShortTerm => self.short_term,
        }
    }
}

impl Default for LayerRates {
    fn default() -> Self {
        Self {
            core: 0.9999,
            archive: 0.999,
            long_term: 0.995,
            short_term: 0.95,
        }
    }
}

/// Weighting knobs. Immutable once loaded; see [`SharedWeightConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    /// Lower weight bound
    pub min_weight: f64,
    /// Upper weight bound
    pub max_weight: f64,
    /// Daily retention per layer
    pub decay: LayerRates,
    /// Accesses younger than this get `recent_access_bonus`
    pub recent_access_hours: f64,
    pub recent_access_bonus: f64,
    /// Accesses younger than this (but not recent) get `medium_access_bonus`
    pub medium_access_hours: f64,
    pub medium_access_bonus: f64,
    /// Applied when the last access is older than `medium_access_hours`
    pub stale_access_penalty: f64,
    /// Context nudge when the retrieval matched on keywords
    pub keyword_match_bonus: f64,
    /// Multiplier applied on a recall hit
    pub reinforce_factor: f64,
    /// Largest absolute change a single update may make
    pub max_change_per_update: f64,
    /// Weights at or below this are eviction candidates
    pub eviction_threshold: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            min_weight: MIN_WEIGHT,
            max_weight: MAX_WEIGHT,
            decay: LayerRates::default(),
            recent_access_hours: 6.0,
            recent_access_bonus: 1.02,
            medium_access_hours: 72.0,
            medium_access_bonus: 1.05,
            stale_access_penalty: 0.98,
            keyword_match_bonus: 1.05,
            reinforce_factor: 1.1,
            max_change_per_update: 1.0,
            eviction_threshold: MIN_WEIGHT,
        }
    }
}

impl WeightConfig {
    /// Check ranges and orderings.
    pub fn validate(&self) -> RecallResult<()> {
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&self.min_weight)
            || !(MIN_WEIGHT..=MAX_WEIGHT).contains(&self.max_weight)
            || self.min_weight >= self.max_weight
        {
            return Err(RecallError::InvalidConfig(format!(
                "weight bounds [{}, {}] must lie within [{}, {}] and be increasing",
                self.min_weight, self.max_weight, MIN_WEIGHT, MAX_WEIGHT
            )));
        }
        for (name, rate) in [
            ("core", self.decay.core),
            ("archive", self.decay.archive),
            ("long_term", self.decay.long_term),
            ("short_term", self.decay.short_term),
        ] {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(RecallError::InvalidConfig(format!(
                    "decay rate for {name} must be in (0, 1], got {rate}"
                )));
            }
        }
        if !(self.decay.core >= self.decay.archive
            && self.decay.archive >= self.decay.long_term
            && self.decay.long_term >= self.decay.short_term)
        {
            return Err(RecallError::InvalidConfig(
                "decay rates must not increase from core to short_term".into(),
            ));
        }
        if self.recent_access_hours <= 0.0 || self.medium_access_hours <= self.recent_access_hours
        {
            return Err(RecallError::InvalidConfig(
                "access windows must be positive and increasing".into(),
            ));
        }
        for (name, factor) in [
            ("recent_access_bonus", self.recent_access_bonus),
            ("medium_access_bonus", self.medium_access_bonus),
            ("stale_access_penalty", self.stale_access_penalty),
            ("keyword_match_bonus", self.keyword_match_bonus),
            ("reinforce_factor", self.reinforce_factor),
        ] {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(RecallError::InvalidConfig(format!(
                    "{name} must be a positive finite factor, got {factor}"
                )));
            }
        }
        if !(self.max_change_per_update > 0.0 && self.max_change_per_update.is_finite()) {
            return Err(RecallError::InvalidConfig(
                "max_change_per_update must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Clamp into the configured bounds.
    pub fn clamp(&self, weight: f64) -> f64 {
        if weight.is_nan() {
            self.min_weight
        } else {
            weight.clamp(self.min_weight, self.max_weight)
        }
    }
}

/// Process-wide handle to the current weighting configuration.
///
/// Readers take a cheap `Arc` snapshot; reconfiguration replaces the whole
/// config at once.
#[derive(Debug, Clone)]
pub struct SharedWeightConfig {
    inner: Arc<RwLock<Arc<WeightConfig>>>,
}

impl SharedWeightConfig {
    /// Wrap a validated config.
    pub fn new(config: WeightConfig) -> RecallResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<WeightConfig> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Engine over the current snapshot.
    pub fn engine(&self) -> WeightEngine {
        WeightEngine::new(self.current())
    }

    /// Replace the config. Snapshots already handed out keep the old values.
    pub fn swap(&self, config: WeightConfig) -> RecallResult<Arc<WeightConfig>> {
        config.validate()?;
        let next = Arc::new(config);
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(std::mem::replace(&mut *guard, next))
    }
}

impl Default for SharedWeightConfig {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(WeightConfig::default()))),
        }
    }
}

/// Retrieval context that nudges a weight update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightContext {
    /// The retrieval matched this record on keywords
    pub keyword_match: bool,
    /// Extra multiplicative factor supplied by the caller
    pub factor: Option<f64>,
}

impl WeightContext {
    /// Context with no nudges.
    pub fn none() -> Self {
        Self::default()
    }

    /// Mark the retrieval as a keyword match.
    pub fn keyword_match(mut self) -> Self {
        self.keyword_match = true;
        self
    }

    /// Add an explicit multiplicative factor.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = Some(factor);
        self
    }
}

/// Result of one weight computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightUpdate {
    /// Weight before the update
    pub previous: f64,
    /// Unclamped product of all factors
    pub raw: f64,
    /// Weight after both clamps
    pub weight: f64,
    pub layer_before: Layer,
    pub layer_after: Layer,
    /// At or below the eviction threshold
    pub eviction_candidate: bool,
}

impl WeightUpdate {
    /// Whether the update crossed a layer boundary.
    pub fn changed_layer(&self) -> bool {
        self.layer_before != self.layer_after
    }
}

/// Pure importance scorer.
#[derive(Debug, Clone)]
pub struct WeightEngine {
    config: Arc<WeightConfig>,
}

impl WeightEngine {
    /// Create an engine over a config snapshot.
    pub fn new(config: Arc<WeightConfig>) -> Self {
        Self { config }
    }

    /// The config this engine scores with.
    pub fn config(&self) -> &WeightConfig {
        &self.config
    }

    /// Recompute a record's weight at `now`.
    pub fn compute(
        &self,
        record: &MemoryRecord,
        now: DateTime<Utc>,
        context: WeightContext,
    ) -> WeightUpdate {
        let previous = self.config.clamp(record.weight);
        let layer_before = Layer::classify(previous);

        let age_days = seconds_between(record.created_at, now) / SECONDS_PER_DAY;
        let idle_hours = seconds_between(record.last_accessed_at, now) / SECONDS_PER_HOUR;

        let raw = previous
            * self.time_factor(layer_before, age_days)
            * self.access_factor(idle_hours)
            * self.context_factor(context);

        let weight = self.clamp_update(previous, raw);
        WeightUpdate {
            previous,
            raw,
            weight,
            layer_before,
            layer_after: Layer::classify(weight),
            eviction_candidate: self.is_eviction_candidate(weight),
        }
    }

    /// Recompute and return only the new weight.
    pub fn compute_weight(
        &self,
        record: &MemoryRecord,
        now: DateTime<Utc>,
        context: WeightContext,
    ) -> f64 {
        self.compute(record, now, context).weight
    }

    /// Access-time nudge applied when a record is recalled.
    pub fn reinforce(&self, weight: f64, context: WeightContext) -> f64 {
        let previous = self.config.clamp(weight);
        let raw = previous * self.config.reinforce_factor * self.context_factor(context);
        self.clamp_update(previous, raw)
    }

    /// `decay_rate(layer) ^ age_days`.
    pub fn time_factor(&self, layer: Layer, age_days: f64) -> f64 {
        self.config.decay.for_layer(layer).powf(age_days.max(0.0))
    }

    /// Multiplier for the time since the last access.
    pub fn access_factor(&self, idle_hours: f64) -> f64 {
        if idle_hours < self.config.recent_access_hours {
            self.config.recent_access_bonus
        } else if idle_hours < self.config.medium_access_hours {
            self.config.medium_access_bonus
        } else {
            self.config.stale_access_penalty
        }
    }

    /// Multiplier supplied by the retrieval context.
    pub fn context_factor(&self, context: WeightContext) -> f64 {
        let mut factor = 1.0;
        if context.keyword_match {
            factor *= self.config.keyword_match_bonus;
        }
        if let Some(extra) = context.factor {
            if extra.is_finite() && extra > 0.0 {
                factor *= extra;
            }
        }
        factor
    }

    /// Two-stage clamp: delta first, then the absolute bounds.
    pub fn clamp_update(&self, previous: f64, raw: f64) -> f64 {
        if raw.is_nan() {
            return self.config.clamp(previous);
        }
        let max_delta = self.config.max_change_per_update;
        let delta = (raw - previous).clamp(-max_delta, max_delta);
        self.config.clamp(previous + delta)
    }

    /// Weights at or below the threshold may be evicted outright.
    pub fn is_eviction_candidate(&self, weight: f64) -> bool {
        weight <= self.config.eviction_threshold
    }
}

impl Default for WeightEngine {
    fn default() -> Self {
        Self::new(Arc::new(WeightConfig::default()))
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to.signed_duration_since(from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use chrono::Duration;

    fn record(weight: f64, age: Duration, idle: Duration) -> (MemoryRecord, DateTime<Utc>) {
        let now = Utc::now();
        let record = MemoryRecord::new("turn", Role::User)
            .created(now - age)
            .accessed(now - idle)
            .weight(weight);
        (record, now)
    }

    #[test]
    fn test_layer_boundaries() {
        assert_eq!(Layer::classify(9.0), Layer::Core);
        assert_eq!(Layer::classify(8.999), Layer::Archive);
        assert_eq!(Layer::classify(7.0), Layer::Archive);
        assert_eq!(Layer::classify(6.999), Layer::LongTerm);
        assert_eq!(Layer::classify(4.0), Layer::LongTerm);
        assert_eq!(Layer::classify(3.999), Layer::ShortTerm);
        assert_eq!(Layer::classify(0.1), Layer::ShortTerm);
        assert_eq!(Layer::classify(f64::NAN), Layer::ShortTerm);
    }

    #[test]
    fn test_layer_ordering() {
        assert!(Layer::Core > Layer::Archive);
        assert!(Layer::Archive > Layer::LongTerm);
        assert!(Layer::LongTerm > Layer::ShortTerm);
        assert_eq!(Layer::LongTerm.to_string(), "long_term");
    }

    #[test]
    fn test_short_term_fades_after_100_days() {
        let engine = WeightEngine::default();
        let (record, now) = record(1.0, Duration::days(100), Duration::days(100));
        let update = engine.compute(&record, now, WeightContext::none());

        assert!(update.raw < 0.1, "raw decay should go below 0.1: {}", update.raw);
        assert_eq!(update.weight, MIN_WEIGHT);
        assert!(update.eviction_candidate);
    }

    #[test]
    fn test_core_survives_100_days() {
        let engine = WeightEngine::default();
        let (record, now) = record(9.5, Duration::days(100), Duration::days(100));
        let update = engine.compute(&record, now, WeightContext::none());

        assert!(update.weight > 8.5, "core weight decayed to {}", update.weight);
        assert!(!update.eviction_candidate);
    }

    #[test]
    fn test_delta_is_clamped() {
        let engine = WeightEngine::default();
        let (record, now) = record(6.0, Duration::days(0), Duration::hours(1));
        let update = engine.compute(&record, now, WeightContext::none().factor(100.0));

        assert!(update.raw > 100.0);
        assert!((update.weight - 7.0).abs() < 1e-9);
        assert_eq!(update.layer_after, Layer::Archive);
    }

    #[test]
    fn test_access_factor_windows() {
        let engine = WeightEngine::default();
        assert_eq!(engine.access_factor(1.0), 1.02);
        assert_eq!(engine.access_factor(24.0), 1.05);
        assert_eq!(engine.access_factor(100.0), 0.98);
    }

    #[test]
    fn test_keyword_context_nudges_up() {
        let engine = WeightEngine::default();
        let (record, now) = record(5.0, Duration::days(1), Duration::hours(2));
        let plain = engine.compute_weight(&record, now, WeightContext::none());
        let matched = engine.compute_weight(&record, now, WeightContext::none().keyword_match());
        assert!(matched > plain);
    }

    #[test]
    fn test_invalid_context_factor_ignored() {
        let engine = WeightEngine::default();
        assert_eq!(engine.context_factor(WeightContext::none().factor(f64::NAN)), 1.0);
        assert_eq!(engine.context_factor(WeightContext::none().factor(-2.0)), 1.0);
    }

    #[test]
    fn test_compute_is_deterministic() {
        let engine = WeightEngine::default();
        let (record, now) = record(3.3, Duration::days(12), Duration::hours(30));
        let a = engine.compute(&record, now, WeightContext::none());
        let b = engine.compute(&record, now, WeightContext::none());
        assert_eq!(a, b);
    }

    #[test]
    fn test_reinforce_is_clamped() {
        let engine = WeightEngine::default();
        assert!((engine.reinforce(5.0, WeightContext::none()) - 5.5).abs() < 1e-9);
        assert_eq!(engine.reinforce(9.95, WeightContext::none()), MAX_WEIGHT);
        let boosted = engine.reinforce(5.0, WeightContext::none().factor(50.0));
        assert!((boosted - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        assert!(WeightConfig::default().validate().is_ok());

        let mut bad = WeightConfig::default();
        bad.decay.short_term = 1.5;
        assert!(matches!(bad.validate(), Err(RecallError::InvalidConfig(_))));

        let mut bad = WeightConfig::default();
        bad.decay.core = 0.5;
        assert!(bad.validate().is_err());

        let mut bad = WeightConfig::default();
        bad.min_weight = 5.0;
        bad.max_weight = 4.0;
        assert!(bad.validate().is_err());

        let mut bad = WeightConfig::default();
        bad.max_change_per_update = 0.0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_shared_config_swap() {
        let shared = SharedWeightConfig::default();
        let before = shared.current();

        let mut next = WeightConfig::default();
        next.max_change_per_update = 0.5;
        let old = shared.swap(next).unwrap();

        assert_eq!(old.max_change_per_update, 1.0);
        assert_eq!(before.max_change_per_update, 1.0);
        assert_eq!(shared.current().max_change_per_update, 0.5);
        assert_eq!(shared.engine().config().max_change_per_update, 0.5);

        let mut invalid = WeightConfig::default();
        invalid.recent_access_hours = -1.0;
        assert!(shared.swap(invalid).is_err());
        assert_eq!(shared.current().max_change_per_update, 0.5);
    }
}
