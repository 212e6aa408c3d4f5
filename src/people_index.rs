//! PeopleIndex: the two posting maps (`postingsValue`, `postingsYear`) that
//! back every query, plus the sharded build buffers used to fill them.
//!
//! Ingest writes land in per-shard locked buffers (mirroring a sharded
//! concurrent index's "independent locks, O(1) routing" shape) keyed by a
//! packed 64-bit integer rather than a `(AttrId, ValueId[, year])` tuple, to
//! avoid hashing a struct key on every posting append. `seal()` drains the
//! buffers in parallel across shards, sorting and deduping each bucket's id
//! vector and handing it to the [`PostingFactory`] before installing the
//! result in the final, immutable maps.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::dictionary::{AttrId, PersonId, ValueId};
use crate::error::{Error, Result};
use crate::posting::{Posting, PostingFactory};

/// Year offset base: keys pack `month_index(yyyymm) - month_index(YEAR_BASE,
/// 1)` into the high bits.
const YEAR_BASE: i32 = 2000;

/// Packs a timeless `(attr, value)` pair into a 64-bit shard/bucket key.
#[inline]
#[must_use]
pub fn pack_value_key(attr: AttrId, value: ValueId) -> u64 {
    ((attr as u32 as u64) << 32) | (value as u32 as u64)
}

/// Converts a `yyyymm` value (e.g. `202104`) into a zero-based month index
/// relative to [`YEAR_BASE`], so that the two-digit month survives packing
/// alongside the year in the same 16-bit field.
///
/// # Panics
///
/// Panics if `month` is not in `1..=12`.
#[inline]
#[must_use]
fn month_index(yyyymm: i32) -> i32 {
    let year = yyyymm / 100;
    let month = yyyymm % 100;
    assert!((1..=12).contains(&month), "yyyymm {yyyymm} has an out-of-range month");
    (year - YEAR_BASE) * 12 + (month - 1)
}

/// Inverts [`month_index`] back into a `yyyymm` value.
#[inline]
#[must_use]
fn unmonth_index(index: i32) -> i32 {
    let year = YEAR_BASE + index.div_euclid(12);
    let month = index.rem_euclid(12) + 1;
    year * 100 + month
}

/// Packs a `(attr, value, yyyymm)` triple into a 64-bit shard/bucket key.
///
/// # Panics
///
/// Panics if `yyyymm`'s month is not in `1..=12`, or if its month index is
/// out of the representable range around [`YEAR_BASE`] (roughly 2000-5460),
/// which no real clinical event data approaches.
#[inline]
#[must_use]
pub fn pack_year_key(attr: AttrId, value: ValueId, yyyymm: i32) -> u64 {
    let index = month_index(yyyymm);
    assert!((0..65536).contains(&index), "yyyymm {yyyymm} out of representable range");
    ((index as u64) << 48) | ((attr as u32 as u64) << 32) | (value as u32 as u64)
}

/// Unpacks a timeless key back into `(attr, value)`.
#[inline]
#[must_use]
pub fn unpack_value_key(key: u64) -> (AttrId, ValueId) {
    (((key >> 32) & 0xFFFF_FFFF) as u32 as AttrId, (key & 0xFFFF_FFFF) as u32 as ValueId)
}

/// Unpacks a year key back into `(attr, value, yyyymm)`.
#[inline]
#[must_use]
pub fn unpack_year_key(key: u64) -> (AttrId, ValueId, i32) {
    let index = (key >> 48) as i32;
    let attr = ((key >> 32) & 0xFFFF) as u32 as AttrId;
    let value = (key & 0xFFFF_FFFF) as u32 as ValueId;
    (attr, value, unmonth_index(index))
}

#[derive(Debug, Default)]
struct ShardBuffer {
    value_buckets: FxHashMap<u64, Vec<PersonId>>,
    year_buckets: FxHashMap<u64, Vec<PersonId>>,
}

/// Sharded, lock-per-shard ingest buffer. Populated concurrently during
/// ingest, drained (in parallel, shard-by-shard) during `seal()`.
struct BuildBuffers {
    shards: Vec<Mutex<ShardBuffer>>,
}

impl BuildBuffers {
    fn new(num_shards: usize) -> Self {
        Self {
            shards: (0..num_shards).map(|_| Mutex::new(ShardBuffer::default())).collect(),
        }
    }

    #[inline]
    fn shard_index(&self, key: u64) -> usize {
        (key as usize) & (self.shards.len() - 1)
    }
}

/// Holds the two posting maps and the universe size. Construct via
/// [`PeopleIndex::begin_ingest`], populate with `append_value`/`append_year`,
/// then [`PeopleIndex::seal`].
pub struct PeopleIndex {
    postings_value: FxHashMap<u64, Posting>,
    postings_year: FxHashMap<u64, Posting>,
    universe_size: u64,
    max_person_id: AtomicU32,
    sealed: bool,
    factory: PostingFactory,
    buffers: Option<BuildBuffers>,
}

impl PeopleIndex {
    /// Begins ingest: allocates `shards` (must be a power of two) buffer
    /// maps for each of the two key spaces.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is zero or not a power of two.
    #[must_use]
    pub fn begin_ingest(shards: usize, factory: PostingFactory) -> Self {
        assert!(shards > 0 && shards.is_power_of_two(), "shards must be a nonzero power of two");
        Self {
            postings_value: FxHashMap::default(),
            postings_year: FxHashMap::default(),
            universe_size: 0,
            max_person_id: AtomicU32::new(0),
            sealed: false,
            factory,
            buffers: Some(BuildBuffers::new(shards)),
        }
    }

    /// Sets a pre-ingest universe size hint (e.g. from a prior cohort load).
    /// `seal()` still takes the max of this hint and the observed max id.
    pub fn hint_universe_size(&mut self, hint: u64) {
        self.universe_size = self.universe_size.max(hint);
    }

    /// Appends `pid` to the timeless posting bucket for `(attr, value)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SealedViolation` if called after `seal()`.
    pub fn append_value(&self, attr: AttrId, value: ValueId, pid: PersonId) -> Result<()> {
        let key = pack_value_key(attr, value);
        self.append_value_key(key, pid)
    }

    /// Appends `pid` to the timeless posting bucket for a pre-packed key.
    ///
    /// # Errors
    ///
    /// Returns `Error::SealedViolation` if called after `seal()`.
    pub fn append_value_key(&self, key: u64, pid: PersonId) -> Result<()> {
        let buffers = self.buffers.as_ref().ok_or(Error::SealedViolation)?;
        self.max_person_id.fetch_max(pid, Ordering::Relaxed);
        let shard_idx = buffers.shard_index(key);
        buffers.shards[shard_idx].lock().value_buckets.entry(key).or_default().push(pid);
        Ok(())
    }

    /// Appends `pid` to the year-bucketed posting for `(attr, value, yyyymm)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SealedViolation` if called after `seal()`.
    pub fn append_year(&self, attr: AttrId, value: ValueId, yyyymm: i32, pid: PersonId) -> Result<()> {
        let key = pack_year_key(attr, value, yyyymm);
        self.append_year_key(key, pid)
    }

    /// Appends `pid` to the year-bucketed posting for a pre-packed key.
    ///
    /// # Errors
    ///
    /// Returns `Error::SealedViolation` if called after `seal()`.
    pub fn append_year_key(&self, key: u64, pid: PersonId) -> Result<()> {
        let buffers = self.buffers.as_ref().ok_or(Error::SealedViolation)?;
        self.max_person_id.fetch_max(pid, Ordering::Relaxed);
        let shard_idx = buffers.shard_index(key);
        buffers.shards[shard_idx].lock().year_buckets.entry(key).or_default().push(pid);
        Ok(())
    }

    /// Sorts, dedupes, and converts every build bucket into a final posting,
    /// then drops the build buffers. Sealing a non-ingesting index (one that
    /// was constructed via [`PeopleIndex::from_sealed_parts`]) is a
    /// programming error.
    ///
    /// # Errors
    ///
    /// Returns `Error::SealedViolation` if already sealed.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::SealedViolation);
        }
        let buffers = self.buffers.take().ok_or(Error::SealedViolation)?;
        self.universe_size = self
            .universe_size
            .max(u64::from(self.max_person_id.load(Ordering::Relaxed)) + 1);

        use rayon::prelude::*;
        let sealed_shards: Vec<(FxHashMap<u64, Posting>, FxHashMap<u64, Posting>)> = buffers
            .shards
            .into_par_iter()
            .map(|m| self.seal_shard(m.into_inner()))
            .collect();

        for (value_map, year_map) in sealed_shards {
            self.postings_value.extend(value_map);
            self.postings_year.extend(year_map);
        }
        self.sealed = true;
        Ok(())
    }

    fn seal_shard(&self, shard: ShardBuffer) -> (FxHashMap<u64, Posting>, FxHashMap<u64, Posting>) {
        let universe_size = self.universe_size;
        let value_map = shard
            .value_buckets
            .into_iter()
            .map(|(key, mut ids)| {
                ids.sort_unstable();
                ids.dedup();
                (key, self.factory.from_sorted_ids(&ids, universe_size))
            })
            .collect();
        let year_map = shard
            .year_buckets
            .into_iter()
            .map(|(key, mut ids)| {
                ids.sort_unstable();
                ids.dedup();
                (key, self.factory.from_sorted_ids(&ids, universe_size))
            })
            .collect();
        (value_map, year_map)
    }

    /// Reconstructs an already-sealed index directly from decoded posting
    /// maps (used by `IndexStore::load`).
    #[must_use]
    pub fn from_sealed_parts(
        postings_value: FxHashMap<u64, Posting>,
        postings_year: FxHashMap<u64, Posting>,
        universe_size: u64,
    ) -> Self {
        Self {
            postings_value,
            postings_year,
            universe_size,
            max_person_id: AtomicU32::new(universe_size.saturating_sub(1) as u32),
            sealed: true,
            factory: PostingFactory::default(),
            buffers: None,
        }
    }

    /// True once `seal()` has run (or the index was loaded pre-sealed).
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// `max(person id) + 1`, i.e. the size of the id space postings are
    /// densities computed against.
    #[must_use]
    pub fn universe_size(&self) -> u64 {
        self.universe_size
    }

    /// Looks up the timeless posting for `(attr, value)`.
    #[must_use]
    pub fn postings_value(&self, attr: AttrId, value: ValueId) -> Option<&Posting> {
        self.postings_value.get(&pack_value_key(attr, value))
    }

    /// Looks up the year-bucketed posting for `(attr, value, yyyymm)`.
    #[must_use]
    pub fn postings_year(&self, attr: AttrId, value: ValueId, yyyymm: i32) -> Option<&Posting> {
        self.postings_year.get(&pack_year_key(attr, value, yyyymm))
    }

    /// Iterates all timeless `(key, posting)` pairs, for save/profiling.
    pub fn enumerate_value_postings(&self) -> impl Iterator<Item = (u64, &Posting)> {
        self.postings_value.iter().map(|(&k, p)| (k, p))
    }

    /// Iterates all year-bucketed `(key, posting)` pairs, for save/profiling.
    pub fn enumerate_year_postings(&self) -> impl Iterator<Item = (u64, &Posting)> {
        self.postings_year.iter().map(|(&k, p)| (k, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_value_key_round_trips() {
        let key = pack_value_key(7, 42);
        assert_eq!(unpack_value_key(key), (7, 42));
    }

    #[test]
    fn pack_unpack_year_key_round_trips() {
        let key = pack_year_key(3, 9, 202104);
        assert_eq!(unpack_year_key(key), (3, 9, 202104));
    }

    #[test]
    fn pack_year_key_distinguishes_months_within_a_year() {
        let jan = pack_year_key(3, 9, 202101);
        let mar = pack_year_key(3, 9, 202103);
        assert_ne!(jan, mar);
        assert_eq!(unpack_year_key(jan), (3, 9, 202101));
        assert_eq!(unpack_year_key(mar), (3, 9, 202103));
    }

    #[test]
    fn ingest_then_seal_builds_sorted_unique_postings() {
        let index = PeopleIndex::begin_ingest(4, PostingFactory::default());
        index.append_value(1, 2, 5).unwrap();
        index.append_value(1, 2, 3).unwrap();
        index.append_value(1, 2, 5).unwrap();
        index.append_value(1, 2, 1).unwrap();

        let mut index = index;
        index.seal().unwrap();

        let posting = index.postings_value(1, 2).unwrap();
        assert_eq!(posting.to_vec(), vec![1, 3, 5]);
        assert_eq!(index.universe_size(), 6);
    }

    #[test]
    fn year_bucket_is_independent_of_timeless_bucket() {
        let index = PeopleIndex::begin_ingest(4, PostingFactory::default());
        index.append_value(1, 2, 10).unwrap();
        index.append_year(1, 2, 202001, 10).unwrap();
        index.append_year(1, 2, 202103, 20).unwrap();

        let mut index = index;
        index.seal().unwrap();

        assert_eq!(index.postings_value(1, 2).unwrap().to_vec(), vec![10]);
        assert_eq!(index.postings_year(1, 2, 202001).unwrap().to_vec(), vec![10]);
        assert_eq!(index.postings_year(1, 2, 202103).unwrap().to_vec(), vec![20]);
        assert!(index.postings_year(1, 2, 202104).is_none());
    }

    #[test]
    fn append_after_seal_is_sealed_violation() {
        let mut index = PeopleIndex::begin_ingest(2, PostingFactory::default());
        index.seal().unwrap();
        assert!(matches!(index.append_value(0, 0, 0), Err(Error::SealedViolation)));
    }

    #[test]
    fn double_seal_is_sealed_violation() {
        let mut index = PeopleIndex::begin_ingest(2, PostingFactory::default());
        assert!(index.seal().is_ok());
        assert!(matches!(index.seal(), Err(Error::SealedViolation)));
    }

    #[test]
    fn universe_hint_is_respected_when_larger() {
        let mut index = PeopleIndex::begin_ingest(2, PostingFactory::default());
        index.hint_universe_size(1000);
        index.append_value(0, 0, 5).unwrap();
        index.seal().unwrap();
        assert_eq!(index.universe_size(), 1000);
    }

    #[test]
    fn concurrent_ingest_across_shards() {
        use std::sync::Arc;
        use std::thread;

        let index = Arc::new(PeopleIndex::begin_ingest(8, PostingFactory::default()));
        let mut handles = vec![];
        for t in 0..8u32 {
            let idx = Arc::clone(&index);
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    idx.append_value(0, 0, t * 100 + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let index = Arc::try_unwrap(index).unwrap_or_else(|_| panic!("all threads joined"));
        let mut index = index;
        index.seal().unwrap();
        assert_eq!(index.postings_value(0, 0).unwrap().len(), 800);
    }
}
