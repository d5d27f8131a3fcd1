//! Multi-tier in-memory cache: hot, warm, and cold maps with TTLs,
//! deflate compression, promotion/demotion, and LRU eviction.
//!
//! Values are stored as serialized JSON blobs so the cache itself stays
//! type-agnostic; callers get their typed value back through serde.
//! Compression and decompression happen outside the tier locks. A key lives
//! in at most one tier at any time.

use crate::clock::{Clock, MonotonicClock};
use crate::error::EnsembleError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Hot,
    Warm,
    Cold,
}

impl CacheTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Hot => "hot",
            CacheTier::Warm => "warm",
            CacheTier::Cold => "cold",
        }
    }

    fn index(self) -> usize {
        match self {
            CacheTier::Hot => 0,
            CacheTier::Warm => 1,
            CacheTier::Cold => 2,
        }
    }

    fn below(self) -> Option<CacheTier> {
        match self {
            CacheTier::Hot => Some(CacheTier::Warm),
            CacheTier::Warm => Some(CacheTier::Cold),
            CacheTier::Cold => None,
        }
    }
}

const TIERS: [CacheTier; 3] = [CacheTier::Hot, CacheTier::Warm, CacheTier::Cold];

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub hot_capacity: usize,
    pub warm_capacity: usize,
    pub cold_capacity: usize,
    pub hot_ttl: Duration,
    pub warm_ttl: Duration,
    pub cold_ttl: Duration,
    /// Values over this many serialized bytes are deflated in warm/cold.
    pub compression_threshold: usize,
    pub max_memory_bytes: usize,
    /// Idle time after which an entry is demoted one tier.
    pub stale_after: Duration,
    pub maintenance_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            hot_capacity: 1_000,
            warm_capacity: 5_000,
            cold_capacity: 44_000,
            hot_ttl: Duration::from_secs(600),
            warm_ttl: Duration::from_secs(3_600),
            cold_ttl: Duration::from_secs(14_400),
            compression_threshold: 512,
            max_memory_bytes: 200 * 1024 * 1024,
            stale_after: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(120),
        }
    }
}

impl CacheSettings {
    fn capacity(&self, tier: CacheTier) -> usize {
        match tier {
            CacheTier::Hot => self.hot_capacity,
            CacheTier::Warm => self.warm_capacity,
            CacheTier::Cold => self.cold_capacity,
        }
    }

    fn ttl(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Hot => self.hot_ttl,
            CacheTier::Warm => self.warm_ttl,
            CacheTier::Cold => self.cold_ttl,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    compressed: bool,
    created_at: u64,
    expires_at: u64,
}

impl Entry {
    fn footprint(&self, key: &str) -> usize {
        self.bytes.len() + key.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AccessPattern {
    count: u32,
    last_access: u64,
}

/// Counter snapshot. `hits + misses == get_calls` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub get_calls: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub promotions: u64,
    pub demotions: u64,
}

pub struct MultiTierCache {
    tiers: [Mutex<HashMap<String, Entry>>; 3],
    access: Mutex<HashMap<String, AccessPattern>>,
    footprint: AtomicUsize,
    get_calls: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MultiTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTierCache")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MultiTierCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self::with_clock(settings, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            tiers: [
                Mutex::new(HashMap::new()),
                Mutex::new(HashMap::new()),
                Mutex::new(HashMap::new()),
            ],
            access: Mutex::new(HashMap::new()),
            footprint: AtomicUsize::new(0),
            get_calls: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            settings,
            clock,
        }
    }

    /// Store a value. The target tier comes from the key prefix (`ensemble`
    /// entries are hot, `memory` warm, `health` cold, anything else warm)
    /// unless the serialized payload is large enough to go straight to cold.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), EnsembleError> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| EnsembleError::Cache { message: format!("serialize {key}: {e}") })?;

        let mut tier = if raw.len() > 4 * self.settings.compression_threshold {
            CacheTier::Cold
        } else {
            self.tier_for_prefix(key)
        };
        if self.settings.capacity(tier) == 0 {
            tier = CacheTier::Cold;
        }

        // Compress before taking any lock.
        let (bytes, compressed) =
            if tier != CacheTier::Hot && raw.len() > self.settings.compression_threshold {
                (deflate(&raw)?, true)
            } else {
                (raw, false)
            };

        let now = self.clock.now_millis();
        let ttl = ttl.unwrap_or_else(|| self.settings.ttl(tier));
        let entry = Entry {
            bytes,
            compressed,
            created_at: now,
            expires_at: now + ttl.as_millis() as u64,
        };

        self.remove_everywhere(key);
        self.insert(tier, key, entry);
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Look up a value, probing hot, then warm, then cold. Expired entries
    /// are deleted on sight. Hits feed the access pattern and may promote
    /// the entry toward the hot tier.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();

        for tier in TIERS {
            let found = {
                let mut map = self.lock_tier(tier);
                let expired = matches!(map.get(key), Some(e) if e.expires_at <= now);
                if expired {
                    let removed = map.remove(key).map(|e| e.footprint(key)).unwrap_or(0);
                    self.footprint.fetch_sub(removed, Ordering::Relaxed);
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    map.get(key).map(|e| (e.bytes.clone(), e.compressed))
                }
            };

            let Some((bytes, compressed)) = found else { continue };

            let raw = if compressed {
                match inflate(&bytes) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "dropping undecompressable cache entry");
                        self.remove_everywhere(key);
                        break;
                    }
                }
            } else {
                bytes
            };

            let value = match serde_json::from_slice(&raw) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "dropping undeserializable cache entry");
                    self.remove_everywhere(key);
                    break;
                }
            };

            let count = {
                let mut access = self.lock_access();
                let pattern = access.entry(key.to_string()).or_default();
                pattern.count += 1;
                pattern.last_access = now;
                pattern.count
            };
            self.maybe_promote(key, tier, count);

            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn delete(&self, key: &str) {
        self.remove_everywhere(key);
    }

    /// Tier currently holding the key, if any.
    pub fn tier_of(&self, key: &str) -> Option<CacheTier> {
        TIERS.into_iter().find(|&tier| self.lock_tier(tier).contains_key(key))
    }

    pub fn tier_len(&self, tier: CacheTier) -> usize {
        self.lock_tier(tier).len()
    }

    pub fn footprint_bytes(&self) -> usize {
        self.footprint.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            get_calls: self.get_calls.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
        }
    }

    /// One maintenance pass: purge expired entries, demote stale ones, and
    /// shed cold entries when the footprint crosses the high-water mark.
    pub fn run_maintenance(&self) {
        self.purge_expired();
        self.demote_stale();

        let high_water = (self.settings.max_memory_bytes as f64 * 0.8) as usize;
        if self.footprint.load(Ordering::Relaxed) > high_water {
            tracing::debug!(
                footprint = self.footprint.load(Ordering::Relaxed),
                high_water,
                "aggressive cache cleanup"
            );
            self.evict_cold_until(high_water);
        }
    }

    /// Spawn the periodic maintenance task.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.settings.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                cache.run_maintenance();
            }
        })
    }

    fn tier_for_prefix(&self, key: &str) -> CacheTier {
        match key.split(':').next() {
            Some(crate::cache_key::PREFIX_ENSEMBLE) => CacheTier::Hot,
            Some(crate::cache_key::PREFIX_HEALTH) => CacheTier::Cold,
            _ => CacheTier::Warm,
        }
    }

    fn lock_tier(&self, tier: CacheTier) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.tiers[tier.index()].lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_access(&self) -> std::sync::MutexGuard<'_, HashMap<String, AccessPattern>> {
        self.access.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, tier: CacheTier, key: &str, entry: Entry) {
        let added = entry.footprint(key);
        let mut map = self.lock_tier(tier);
        if map.len() >= self.settings.capacity(tier) {
            self.evict_lru_locked(&mut map, key);
        }
        if let Some(old) = map.insert(key.to_string(), entry) {
            self.footprint.fetch_sub(old.footprint(key), Ordering::Relaxed);
        }
        drop(map);
        self.footprint.fetch_add(added, Ordering::Relaxed);
    }

    /// Evict the least-recently-used entry from an already-locked tier.
    /// Entries never read fall back to their creation time.
    fn evict_lru_locked(&self, map: &mut HashMap<String, Entry>, incoming: &str) {
        let access = self.lock_access();
        let victim = map
            .iter()
            .filter(|(k, _)| k.as_str() != incoming)
            .min_by_key(|(k, e)| {
                access.get(k.as_str()).map(|p| p.last_access).unwrap_or(e.created_at)
            })
            .map(|(k, _)| k.clone());
        drop(access);

        if let Some(victim) = victim {
            if let Some(entry) = map.remove(&victim) {
                self.footprint.fetch_sub(entry.footprint(&victim), Ordering::Relaxed);
            }
            self.lock_access().remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %victim, "evicted LRU cache entry");
        }
    }

    fn remove_everywhere(&self, key: &str) {
        for tier in TIERS {
            let mut map = self.lock_tier(tier);
            if let Some(entry) = map.remove(key) {
                self.footprint.fetch_sub(entry.footprint(key), Ordering::Relaxed);
            }
        }
        self.lock_access().remove(key);
    }

    fn maybe_promote(&self, key: &str, tier: CacheTier, count: u32) {
        let target = if count >= 3 && tier != CacheTier::Hot {
            Some(CacheTier::Hot)
        } else if tier == CacheTier::Cold && count >= 2 {
            Some(CacheTier::Warm)
        } else {
            None
        };

        if let Some(target) = target {
            if self.move_entry(key, tier, target) {
                self.promotions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, from = tier.as_str(), to = target.as_str(), "promoted cache entry");
            }
        }
    }

    /// Move an entry between tiers, re-encoding to match the target tier's
    /// compression policy and re-arming its TTL. The key briefly exists in
    /// no tier while in flight; concurrent gets see a miss, never a double.
    fn move_entry(&self, key: &str, from: CacheTier, to: CacheTier) -> bool {
        let Some(entry) = ({
            let mut map = self.lock_tier(from);
            map.remove(key)
        }) else {
            return false;
        };
        self.footprint.fetch_sub(entry.footprint(key), Ordering::Relaxed);

        let recoded = match self.recode(entry, to) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "dropping entry that failed tier re-encode");
                return false;
            }
        };
        self.insert(to, key, recoded);
        true
    }

    fn recode(&self, entry: Entry, to: CacheTier) -> Result<Entry, EnsembleError> {
        let now = self.clock.now_millis();
        let expires_at = now + self.settings.ttl(to).as_millis() as u64;

        let want_compressed = to != CacheTier::Hot && {
            let raw_len = if entry.compressed {
                // Inflate to learn the true size only when needed below.
                usize::MAX
            } else {
                entry.bytes.len()
            };
            raw_len > self.settings.compression_threshold
        };

        let (bytes, compressed) = match (entry.compressed, want_compressed) {
            (c, w) if c == w => (entry.bytes, c),
            (true, false) => (inflate(&entry.bytes)?, false),
            (false, true) => (deflate(&entry.bytes)?, true),
            _ => unreachable!(),
        };

        Ok(Entry { bytes, compressed, created_at: entry.created_at, expires_at })
    }

    fn purge_expired(&self) {
        let now = self.clock.now_millis();
        for tier in TIERS {
            let expired: Vec<(String, usize)> = {
                let mut map = self.lock_tier(tier);
                let keys: Vec<String> = map
                    .iter()
                    .filter(|(_, e)| e.expires_at <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                keys.into_iter()
                    .filter_map(|k| map.remove(&k).map(|e| (k.clone(), e.footprint(&k))))
                    .collect()
            };
            for (key, size) in expired {
                self.footprint.fetch_sub(size, Ordering::Relaxed);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.lock_access().remove(&key);
            }
        }
    }

    fn demote_stale(&self) {
        let now = self.clock.now_millis();
        let stale_before = now.saturating_sub(self.settings.stale_after.as_millis() as u64);

        for tier in [CacheTier::Hot, CacheTier::Warm] {
            let Some(below) = tier.below() else { continue };
            let stale: Vec<String> = {
                let map = self.lock_tier(tier);
                let access = self.lock_access();
                map.iter()
                    .filter(|(k, e)| {
                        let last =
                            access.get(k.as_str()).map(|p| p.last_access).unwrap_or(e.created_at);
                        last <= stale_before
                    })
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            for key in stale {
                if self.move_entry(&key, tier, below) {
                    self.demotions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, from = tier.as_str(), "demoted stale cache entry");
                }
            }
        }
    }

    fn evict_cold_until(&self, target: usize) {
        while self.footprint.load(Ordering::Relaxed) > target {
            let mut map = self.lock_tier(CacheTier::Cold);
            if map.is_empty() {
                break;
            }
            let dummy = String::new();
            self.evict_lru_locked(&mut map, &dummy);
        }
    }
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>, EnsembleError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| EnsembleError::Cache { message: format!("deflate: {e}") })?;
    encoder.finish().map_err(|e| EnsembleError::Cache { message: format!("deflate: {e}") })
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>, EnsembleError> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| EnsembleError::Cache { message: format!("inflate: {e}") })?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::{json, Value};

    fn cache_with_clock(settings: CacheSettings) -> (Arc<MultiTierCache>, ManualClock) {
        let clock = ManualClock::new();
        (Arc::new(MultiTierCache::with_clock(settings, Arc::new(clock.clone()))), clock)
    }

    fn small_settings() -> CacheSettings {
        CacheSettings {
            hot_capacity: 4,
            warm_capacity: 4,
            cold_capacity: 8,
            ..CacheSettings::default()
        }
    }

    #[test]
    fn get_after_set_returns_identical_value() {
        let (cache, _clock) = cache_with_clock(small_settings());
        let value = json!({"answer": 4, "sources": ["a", "b"], "nested": {"x": [1, 2, 3]}});
        cache.set("ensemble:abc", &value, None).unwrap();
        let got: Value = cache.get("ensemble:abc").unwrap();
        assert_eq!(got, value);
    }

    #[test]
    fn prefix_heuristic_picks_tier() {
        let (cache, _clock) = cache_with_clock(small_settings());
        cache.set("ensemble:a", &json!(1), None).unwrap();
        cache.set("memory:b", &json!(2), None).unwrap();
        cache.set("health:c", &json!(3), None).unwrap();

        assert_eq!(cache.tier_of("ensemble:a"), Some(CacheTier::Hot));
        assert_eq!(cache.tier_of("memory:b"), Some(CacheTier::Warm));
        assert_eq!(cache.tier_of("health:c"), Some(CacheTier::Cold));
    }

    #[test]
    fn oversized_values_go_straight_to_cold() {
        let (cache, _clock) = cache_with_clock(small_settings());
        let big = json!({"blob": "x".repeat(5_000)});
        cache.set("ensemble:big", &big, None).unwrap();
        assert_eq!(cache.tier_of("ensemble:big"), Some(CacheTier::Cold));

        let got: Value = cache.get("ensemble:big").unwrap();
        assert_eq!(got, big);
    }

    #[test]
    fn warm_values_over_threshold_are_compressed_losslessly() {
        let settings = CacheSettings { compression_threshold: 64, ..small_settings() };
        let (cache, _clock) = cache_with_clock(settings);
        // Above the compression threshold but below the 4x straight-to-cold cutoff.
        let value = json!({"text": "the quick brown fox ".repeat(8)});
        cache.set("memory:compressed", &value, None).unwrap();

        let entry_compressed = {
            let map = cache.lock_tier(CacheTier::Warm);
            map.get("memory:compressed").unwrap().compressed
        };
        assert!(entry_compressed);

        let got: Value = cache.get("memory:compressed").unwrap();
        assert_eq!(got, value);
    }

    #[test]
    fn expired_entries_are_deleted_on_read() {
        let (cache, clock) = cache_with_clock(small_settings());
        cache.set("ensemble:ttl", &json!(1), Some(Duration::from_millis(100))).unwrap();
        clock.advance(101);

        let got: Option<Value> = cache.get("ensemble:ttl");
        assert!(got.is_none());
        assert_eq!(cache.tier_of("ensemble:ttl"), None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn value_within_ttl_survives() {
        let (cache, clock) = cache_with_clock(small_settings());
        cache.set("ensemble:ttl", &json!("v"), Some(Duration::from_millis(100))).unwrap();
        clock.advance(99);
        let got: Option<Value> = cache.get("ensemble:ttl");
        assert_eq!(got, Some(json!("v")));
    }

    #[test]
    fn three_accesses_promote_to_hot() {
        let (cache, _clock) = cache_with_clock(small_settings());
        cache.set("memory:warm-key", &json!(1), None).unwrap();
        assert_eq!(cache.tier_of("memory:warm-key"), Some(CacheTier::Warm));

        for _ in 0..3 {
            let _: Option<Value> = cache.get("memory:warm-key");
        }
        assert_eq!(cache.tier_of("memory:warm-key"), Some(CacheTier::Hot));
        assert_eq!(cache.stats().promotions, 1);
    }

    #[test]
    fn two_accesses_promote_cold_to_warm() {
        let (cache, _clock) = cache_with_clock(small_settings());
        cache.set("health:cold-key", &json!(1), None).unwrap();
        assert_eq!(cache.tier_of("health:cold-key"), Some(CacheTier::Cold));

        for _ in 0..2 {
            let _: Option<Value> = cache.get("health:cold-key");
        }
        assert_eq!(cache.tier_of("health:cold-key"), Some(CacheTier::Warm));
    }

    #[test]
    fn key_exists_in_exactly_one_tier_after_promotion() {
        let (cache, _clock) = cache_with_clock(small_settings());
        cache.set("health:k", &json!(1), None).unwrap();
        for _ in 0..5 {
            let _: Option<Value> = cache.get("health:k");
        }
        let holding: Vec<CacheTier> =
            TIERS.into_iter().filter(|&t| cache.lock_tier(t).contains_key("health:k")).collect();
        assert_eq!(holding, [CacheTier::Hot]);
    }

    #[test]
    fn lru_eviction_in_hot_tier() {
        let settings = CacheSettings { hot_capacity: 2, ..CacheSettings::default() };
        let (cache, clock) = cache_with_clock(settings);

        cache.set("ensemble:a", &json!("A"), None).unwrap();
        clock.advance(10);
        cache.set("ensemble:b", &json!("B"), None).unwrap();
        clock.advance(10);
        // Touch A so B becomes least recently used.
        let _: Option<Value> = cache.get("ensemble:a");
        clock.advance(10);
        cache.set("ensemble:c", &json!("C"), None).unwrap();

        assert_eq!(cache.tier_of("ensemble:b"), None, "B should be evicted");
        assert!(cache.tier_of("ensemble:a").is_some());
        assert!(cache.tier_of("ensemble:c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn hit_miss_counters_always_reconcile() {
        let (cache, _clock) = cache_with_clock(small_settings());
        cache.set("ensemble:x", &json!(1), None).unwrap();

        let _: Option<Value> = cache.get("ensemble:x");
        let _: Option<Value> = cache.get("ensemble:missing");
        let _: Option<Value> = cache.get("ensemble:x");
        let _: Option<Value> = cache.get("ensemble:missing-2");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits + stats.misses, stats.get_calls);
    }

    #[test]
    fn maintenance_purges_expired_and_demotes_stale() {
        let (cache, clock) = cache_with_clock(small_settings());
        cache.set("ensemble:expired", &json!(1), Some(Duration::from_millis(50))).unwrap();
        cache.set("ensemble:stale", &json!(2), Some(Duration::from_secs(3_600))).unwrap();

        // Past the 10-minute stale window and the short TTL.
        clock.advance(11 * 60 * 1000);
        cache.run_maintenance();

        assert_eq!(cache.tier_of("ensemble:expired"), None);
        assert_eq!(cache.tier_of("ensemble:stale"), Some(CacheTier::Warm));
        let stats = cache.stats();
        assert!(stats.expirations >= 1);
        assert!(stats.demotions >= 1);
    }

    #[test]
    fn aggressive_cleanup_sheds_cold_entries() {
        let settings = CacheSettings {
            max_memory_bytes: 4_000,
            cold_capacity: 1_000,
            // Keep payloads uncompressed so the footprint is predictable.
            compression_threshold: 10_000,
            ..CacheSettings::default()
        };
        let (cache, _clock) = cache_with_clock(settings);

        for i in 0..40 {
            cache.set(&format!("health:{i}"), &json!({ "blob": "x".repeat(600) }), None).unwrap();
        }
        assert!(cache.footprint_bytes() > 3_200);

        cache.run_maintenance();
        assert!(
            cache.footprint_bytes() <= 3_200,
            "footprint {} should be under the high-water mark",
            cache.footprint_bytes()
        );
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn delete_removes_from_all_tiers() {
        let (cache, _clock) = cache_with_clock(small_settings());
        cache.set("ensemble:gone", &json!(1), None).unwrap();
        cache.delete("ensemble:gone");
        assert_eq!(cache.tier_of("ensemble:gone"), None);
    }

    #[test]
    fn overwrite_replaces_value_and_keeps_single_residence() {
        let (cache, _clock) = cache_with_clock(small_settings());
        cache.set("memory:k", &json!("old"), None).unwrap();
        // Promote to hot first.
        for _ in 0..3 {
            let _: Option<Value> = cache.get("memory:k");
        }
        assert_eq!(cache.tier_of("memory:k"), Some(CacheTier::Hot));

        // Overwrite lands back on the prefix tier; old copy is gone.
        cache.set("memory:k", &json!("new"), None).unwrap();
        assert_eq!(cache.tier_of("memory:k"), Some(CacheTier::Warm));
        let got: Value = cache.get("memory:k").unwrap();
        assert_eq!(got, json!("new"));
    }

    #[test]
    fn compression_roundtrip_is_lossless_for_arbitrary_json() {
        let values = [
            json!(null),
            json!(42),
            json!("short"),
            json!({"long": "z".repeat(10_000), "unicode": "héllo wörld — ≈1e-6"}),
            json!([1, [2, [3, [4]]], {"deep": true}]),
        ];
        for value in values {
            let raw = serde_json::to_vec(&value).unwrap();
            let compressed = deflate(&raw).unwrap();
            let restored = inflate(&compressed).unwrap();
            assert_eq!(raw, restored);
        }
    }
}
