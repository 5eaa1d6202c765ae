//! Property tests for weight updates, layer classification, search order
//! and cache capacity.

use chrono::{Duration, TimeZone, Utc};
use koru_recall::cache::CacheLevel;
use koru_recall::prelude::*;
use koru_recall::{CacheConfig, IndexConfig, Layer, MAX_WEIGHT, MIN_WEIGHT};
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    #[test]
    fn weight_updates_stay_bounded(
        weight in MIN_WEIGHT..=MAX_WEIGHT,
        age_hours in 0i64..(24 * 365 * 3),
        idle_hours in 0i64..(24 * 365),
        keyword in any::<bool>(),
        factor in proptest::option::of(0.01f64..20.0),
    ) {
        let engine = WeightEngine::default();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap();
        let created = now - Duration::hours(age_hours);
        let accessed = (now - Duration::hours(idle_hours)).max(created);
        let record = MemoryRecord::new("p", Role::User)
            .weight(weight)
            .created(created)
            .accessed(accessed);

        let mut context = WeightContext::none();
        if keyword {
            context = context.keyword_match();
        }
        if let Some(factor) = factor {
            context = context.factor(factor);
        }

        let update = engine.compute(&record, now, context);
        let max_change = engine.config().max_change_per_update;
        prop_assert!(update.weight >= MIN_WEIGHT && update.weight <= MAX_WEIGHT);
        prop_assert!((update.weight - weight).abs() <= max_change + 1e-9);
        prop_assert_eq!(update.layer_after, Layer::classify(update.weight));

        let reinforced = engine.reinforce(weight, context);
        prop_assert!(reinforced >= MIN_WEIGHT && reinforced <= MAX_WEIGHT);
        prop_assert!((reinforced - weight).abs() <= max_change + 1e-9);
    }

    #[test]
    fn layers_are_total_and_ordered(a in MIN_WEIGHT..=MAX_WEIGHT, b in MIN_WEIGHT..=MAX_WEIGHT) {
        let layer = Layer::classify(a);
        let expected = if a >= 9.0 {
            Layer::Core
        } else if a >= 7.0 {
            Layer::Archive
        } else if a >= 4.0 {
            Layer::LongTerm
        } else {
            Layer::ShortTerm
        };
        prop_assert_eq!(layer, expected);
        if a <= b {
            prop_assert!(Layer::classify(a) <= Layer::classify(b));
        }
    }

    #[test]
    fn search_is_sorted_and_bounded(
        points in proptest::collection::vec(proptest::collection::vec(-1.0f32..1.0, 3), 1..40),
        query in proptest::collection::vec(-1.0f32..1.0, 3),
        k in 1usize..10,
        min_similarity in 0.0f32..0.5,
    ) {
        let index = VectorIndex::new(IndexConfig::flat(3)).unwrap();
        for (i, point) in points.iter().enumerate() {
            index.add(&format!("p{i}"), &Vector::new(point.clone(), "m")).unwrap();
        }

        let hits = index.search(&Vector::new(query, "m"), k, min_similarity).unwrap();
        prop_assert!(hits.len() <= k);
        prop_assert!(hits.len() <= points.len());
        for pair in hits.windows(2) {
            prop_assert!(pair[0].similarity >= pair[1].similarity);
            if pair[0].similarity == pair[1].similarity {
                let first: usize = pair[0].key[1..].parse().unwrap();
                let second: usize = pair[1].key[1..].parse().unwrap();
                prop_assert!(first < second);
            }
        }
        for hit in &hits {
            prop_assert!(hit.similarity >= min_similarity && hit.similarity <= 1.0);
        }
    }

    #[test]
    fn cache_never_exceeds_capacity(
        ops in proptest::collection::vec((0u8..30, MIN_WEIGHT..=MAX_WEIGHT, 1usize..64, any::<bool>()), 1..120),
    ) {
        let config = CacheConfig::uniform(5, 400);
        let cache = TieredCache::new("prop", config.clone(), Arc::new(CacheEventBus::new())).unwrap();

        for (key, weight, len, pinned) in ops {
            let mut metadata = EntryMetadata::weight(weight);
            if pinned {
                metadata = metadata.pinned();
            }
            let _ = cache.put(&format!("k{key}"), json!("x".repeat(len)), metadata);

            let stats = cache.stats();
            for level in [CacheLevel::Hot, CacheLevel::Warm, CacheLevel::Cold, CacheLevel::Persistent] {
                let capacity = config.capacity(level);
                let level_stats = &stats.levels[&level.to_string()];
                prop_assert!(level_stats.items <= capacity.max_items);
                prop_assert!(level_stats.bytes <= capacity.max_bytes);
            }
        }
    }
}
