//! Posting: a polymorphic set of patient ids.
//!
//! Two representations share one contract (`intersect`/`union`/`subtract`):
//! a sorted-unique `Vec<PersonId>` for low-density postings, and a
//! compressed (Roaring-style) bitmap for high-density ones. Which one a
//! given posting uses is decided once, at construction time, by
//! [`PostingFactory`] — postings are immutable after that, so there is no
//! promotion-on-insert path the way an accumulating set would have one.
//!
//! A flat enum with exhaustive matching is used rather than a trait object:
//! it keeps both arms inlinable and lets the array path vectorize.

use roaring::RoaringBitmap;

use crate::dictionary::PersonId;

/// A set of patient ids satisfying one atomic predicate.
#[derive(Debug, Clone)]
pub enum Posting {
    /// Sorted, deduplicated id array. Cheap for small/sparse sets.
    Array(Vec<PersonId>),
    /// Compressed bitmap. Cheap for large/dense sets; O(1) cardinality.
    Bitmap(RoaringBitmap),
}

impl Default for Posting {
    fn default() -> Self {
        Self::Array(Vec::new())
    }
}

impl Posting {
    /// An empty posting (array representation).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of ids in the posting.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Array(ids) => ids.len(),
            Self::Bitmap(bm) => bm.len() as usize,
        }
    }

    /// True if the posting contains no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if this posting uses the bitmap representation.
    #[must_use]
    pub fn is_bitmap(&self) -> bool {
        matches!(self, Self::Bitmap(_))
    }

    /// Returns the ids in ascending order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<PersonId> {
        match self {
            Self::Array(ids) => ids.clone(),
            Self::Bitmap(bm) => bm.iter().collect(),
        }
    }

    /// Iterates ids in ascending order.
    pub fn iter(&self) -> PostingIter<'_> {
        match self {
            Self::Array(ids) => PostingIter::Array(ids.iter()),
            Self::Bitmap(bm) => PostingIter::Bitmap(bm.iter()),
        }
    }

    /// Converts to the bitmap representation, cloning the underlying bitmap
    /// if already in that form. Used to force bitmap-level set operations
    /// (e.g. cohort profiling) regardless of how the operands were stored.
    #[must_use]
    pub fn to_bitmap(&self) -> RoaringBitmap {
        match self {
            Self::Array(ids) => ids.iter().copied().collect(),
            Self::Bitmap(bm) => bm.clone(),
        }
    }

    /// Set intersection (`self ∩ other`), using the default galloping skew
    /// factor. Prefer [`Posting::intersect_with_skew`] when a configured
    /// [`crate::config::PostingConfig::galloping_skew_factor`] is available.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        self.intersect_with_skew(other, DEFAULT_SKEW_FACTOR)
    }

    /// Set intersection (`self ∩ other`), switching the array/array path to
    /// galloping search once one side is at least `skew_factor` times
    /// larger than the other.
    #[must_use]
    pub fn intersect_with_skew(&self, other: &Self, skew_factor: usize) -> Self {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => Self::Array(array_intersect(a, b, skew_factor)),
            (Self::Bitmap(a), Self::Bitmap(b)) => Self::Bitmap(a & b),
            (Self::Array(a), Self::Bitmap(b)) | (Self::Bitmap(b), Self::Array(a)) => {
                Self::Array(a.iter().copied().filter(|id| b.contains(*id)).collect())
            }
        }
    }

    /// Set union (`self ∪ other`).
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => Self::Array(array_union(a, b)),
            (Self::Bitmap(a), Self::Bitmap(b)) => Self::Bitmap(a | b),
            (Self::Array(_), Self::Bitmap(_)) | (Self::Bitmap(_), Self::Array(_)) => {
                Self::Bitmap(self.to_bitmap() | other.to_bitmap())
            }
        }
    }

    /// Set difference (`self \ other`).
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => Self::Array(array_subtract(a, b)),
            (Self::Bitmap(a), Self::Bitmap(b)) => Self::Bitmap(a - b),
            (Self::Array(a), Self::Bitmap(b)) => {
                Self::Array(a.iter().copied().filter(|id| !b.contains(*id)).collect())
            }
            (Self::Bitmap(a), Self::Array(b)) => {
                let b_bitmap: RoaringBitmap = b.iter().copied().collect();
                Self::Bitmap(a - &b_bitmap)
            }
        }
    }
}

/// Iterator over a posting's ids, ascending.
pub enum PostingIter<'a> {
    /// Iterating a sorted array.
    Array(std::slice::Iter<'a, PersonId>),
    /// Iterating a bitmap.
    Bitmap(roaring::bitmap::Iter<'a>),
}

impl Iterator for PostingIter<'_> {
    type Item = PersonId;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Array(it) => it.next().copied(),
            Self::Bitmap(it) => it.next(),
        }
    }
}

/// Default galloping skew factor, used by [`Posting::intersect`] when no
/// configured [`PostingFactory`] is threaded through.
const DEFAULT_SKEW_FACTOR: usize = 16;

/// Two-pointer sorted merge, falling back to galloping search when one side
/// is at least `skew_factor` times larger than the other.
fn array_intersect(a: &[PersonId], b: &[PersonId], skew_factor: usize) -> Vec<PersonId> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if large.len() >= small.len() * skew_factor {
        return galloping_intersect(small, large);
    }

    let mut out = Vec::with_capacity(small.len().min(large.len()));
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// For each element of `small`, exponentially probe `large` then
/// binary-search the probed window. O(|small| · log(|large|/|small|)).
fn galloping_intersect(small: &[PersonId], large: &[PersonId]) -> Vec<PersonId> {
    let mut out = Vec::with_capacity(small.len());
    let mut lo = 0usize;
    for &target in small {
        if lo >= large.len() {
            break;
        }
        let mut step = 1usize;
        let mut hi = lo;
        while hi < large.len() && large[hi] < target {
            lo = hi;
            hi = (hi + step).min(large.len());
            step *= 2;
        }
        // `hi` stopped at the first index with `large[hi] >= target` (or
        // `large.len()` if none), so the candidate match itself is AT `hi`,
        // not before it — the searched window must include it.
        let hi = (hi + 1).min(large.len());
        match large[lo..hi].binary_search(&target) {
            Ok(pos) => {
                out.push(target);
                lo += pos + 1;
            }
            Err(pos) => lo += pos,
        }
    }
    out
}

fn array_union(a: &[PersonId], b: &[PersonId]) -> Vec<PersonId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn array_subtract(a: &[PersonId], b: &[PersonId]) -> Vec<PersonId> {
    let mut out = Vec::with_capacity(a.len());
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out
}

/// Chooses a posting's representation based on density and cardinality, and
/// holds the galloping skew factor used for its array/array intersections,
/// all per the configured thresholds (see [`crate::config::PostingConfig`]).
#[derive(Debug, Clone, Copy)]
pub struct PostingFactory {
    bitmap_density_threshold: f64,
    bitmap_cardinality_threshold: usize,
    galloping_skew_factor: usize,
}

impl PostingFactory {
    /// Builds a factory from explicit thresholds (see
    /// [`crate::config::PostingConfig`]).
    #[must_use]
    pub fn new(bitmap_density_threshold: f64, bitmap_cardinality_threshold: usize, galloping_skew_factor: usize) -> Self {
        Self {
            bitmap_density_threshold,
            bitmap_cardinality_threshold,
            galloping_skew_factor,
        }
    }

    /// Builds a posting from a sorted, deduplicated id slice, choosing
    /// bitmap representation if density >= threshold or cardinality >=
    /// threshold, array otherwise.
    #[must_use]
    pub fn from_sorted_ids(&self, ids: &[PersonId], universe_size: u64) -> Posting {
        let density = if universe_size == 0 {
            0.0
        } else {
            ids.len() as f64 / universe_size as f64
        };

        if ids.len() >= self.bitmap_cardinality_threshold || density >= self.bitmap_density_threshold {
            let bm: RoaringBitmap = ids.iter().copied().collect();
            Posting::Bitmap(bm)
        } else {
            Posting::Array(ids.to_vec())
        }
    }

    /// Intersects `a` and `b` using this factory's configured galloping
    /// skew factor.
    #[must_use]
    pub fn intersect<'a>(&self, a: &'a Posting, b: &'a Posting) -> Posting {
        a.intersect_with_skew(b, self.galloping_skew_factor)
    }

    /// The configured galloping skew factor.
    #[must_use]
    pub fn galloping_skew_factor(&self) -> usize {
        self.galloping_skew_factor
    }
}

impl Default for PostingFactory {
    fn default() -> Self {
        Self::new(0.02, 4096, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(ids: &[PersonId]) -> Posting {
        Posting::Array(ids.to_vec())
    }

    fn bmp(ids: &[PersonId]) -> Posting {
        Posting::Bitmap(ids.iter().copied().collect())
    }

    #[test]
    fn array_intersect_basic() {
        let a = arr(&[1, 2, 3, 5, 8]);
        let b = arr(&[2, 3, 4, 8]);
        assert_eq!(a.intersect(&b).to_vec(), vec![2, 3, 8]);
    }

    #[test]
    fn galloping_path_matches_merge_path() {
        let small: Vec<PersonId> = vec![10, 500, 10_000, 50_000];
        let large: Vec<PersonId> = (0..200_000).collect();
        let expected = array_union_filter(&small, &large);
        assert_eq!(galloping_intersect(&small, &large), expected);
        assert_eq!(arr(&small).intersect(&arr(&large)).to_vec(), expected);
    }

    #[test]
    fn galloping_intersect_includes_target_at_gallop_landing() {
        let small: Vec<PersonId> = vec![7];
        let large: Vec<PersonId> = (6..32).collect();
        assert_eq!(galloping_intersect(&small, &large), vec![7]);
        assert_eq!(arr(&small).intersect(&arr(&large)).to_vec(), vec![7]);
    }

    fn array_union_filter(small: &[PersonId], large: &[PersonId]) -> Vec<PersonId> {
        small
            .iter()
            .copied()
            .filter(|id| large.binary_search(id).is_ok())
            .collect()
    }

    #[test]
    fn union_preserves_order_and_uniqueness() {
        let a = arr(&[1, 3, 5]);
        let b = arr(&[2, 3, 4]);
        assert_eq!(a.union(&b).to_vec(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn subtract_basic() {
        let a = arr(&[1, 2, 3, 4]);
        let b = arr(&[2, 4]);
        assert_eq!(a.subtract(&b).to_vec(), vec![1, 3]);
    }

    #[test]
    fn mixed_representation_equals_pure_array() {
        let ids_a = vec![1u32, 2, 3, 100, 200];
        let ids_b = vec![2u32, 100, 300];
        let array_result = arr(&ids_a).intersect(&arr(&ids_b)).to_vec();
        let mixed_result = bmp(&ids_a).intersect(&arr(&ids_b)).to_vec();
        let bitmap_result = bmp(&ids_a).intersect(&bmp(&ids_b)).to_vec();
        assert_eq!(array_result, mixed_result);
        assert_eq!(array_result, bitmap_result);

        let array_union = arr(&ids_a).union(&arr(&ids_b)).to_vec();
        let mixed_union = bmp(&ids_a).union(&arr(&ids_b)).to_vec();
        assert_eq!(array_union, mixed_union);

        let array_sub = arr(&ids_a).subtract(&arr(&ids_b)).to_vec();
        let mixed_sub = bmp(&ids_a).subtract(&arr(&ids_b)).to_vec();
        let bitmap_sub = bmp(&ids_a).subtract(&bmp(&ids_b)).to_vec();
        assert_eq!(array_sub, mixed_sub);
        assert_eq!(array_sub, bitmap_sub);
    }

    #[test]
    fn empty_identities() {
        let a = arr(&[1, 2, 3]);
        let empty = Posting::empty();
        assert!(a.intersect(&empty).is_empty());
        assert_eq!(a.union(&empty).to_vec(), a.to_vec());
        assert_eq!(a.subtract(&empty).to_vec(), a.to_vec());
        assert!(empty.subtract(&a).is_empty());
    }

    #[test]
    fn idempotence() {
        let a = arr(&[1, 2, 3]);
        assert_eq!(a.intersect(&a).to_vec(), a.to_vec());
        assert_eq!(a.union(&a).to_vec(), a.to_vec());
        assert!(a.subtract(&a).is_empty());
    }

    #[test]
    fn factory_selects_array_for_sparse_small() {
        let ids: Vec<PersonId> = (0..10).collect();
        let factory = PostingFactory::default();
        let posting = factory.from_sorted_ids(&ids, 1_000_000);
        assert!(!posting.is_bitmap());
    }

    #[test]
    fn factory_selects_bitmap_for_dense() {
        let ids: Vec<PersonId> = (0..5000).collect();
        let factory = PostingFactory::default();
        let posting = factory.from_sorted_ids(&ids, 10_000);
        assert!(posting.is_bitmap());
    }

    #[test]
    fn factory_selects_bitmap_above_cardinality_even_if_sparse() {
        let ids: Vec<PersonId> = (0..5000).map(|i| i * 100).collect();
        let factory = PostingFactory::default();
        let posting = factory.from_sorted_ids(&ids, 10_000_000);
        assert!(posting.is_bitmap());
    }

    proptest::proptest! {
        #[test]
        fn prop_intersect_commutative(mut a in proptest::collection::vec(0u32..1000, 0..100), mut b in proptest::collection::vec(0u32..1000, 0..100)) {
            a.sort_unstable();
            a.dedup();
            b.sort_unstable();
            b.dedup();
            let pa = arr(&a);
            let pb = arr(&b);
            proptest::prop_assert_eq!(pa.intersect(&pb).to_vec(), pb.intersect(&pa).to_vec());
        }

        #[test]
        fn prop_union_commutative(mut a in proptest::collection::vec(0u32..1000, 0..100), mut b in proptest::collection::vec(0u32..1000, 0..100)) {
            a.sort_unstable();
            a.dedup();
            b.sort_unstable();
            b.dedup();
            let pa = arr(&a);
            let pb = arr(&b);
            proptest::prop_assert_eq!(pa.union(&pb).to_vec(), pb.union(&pa).to_vec());
        }

        #[test]
        fn prop_array_bitmap_equivalence(mut a in proptest::collection::vec(0u32..1000, 0..100), mut b in proptest::collection::vec(0u32..1000, 0..100)) {
            a.sort_unstable();
            a.dedup();
            b.sort_unstable();
            b.dedup();
            let array_result = arr(&a).intersect(&arr(&b)).to_vec();
            let bitmap_result = bmp(&a).intersect(&bmp(&b)).to_vec();
            proptest::prop_assert_eq!(array_result, bitmap_result);
        }

        #[test]
        fn prop_to_vec_ascending(mut a in proptest::collection::vec(0u32..1000, 0..100)) {
            a.sort_unstable();
            a.dedup();
            let posting = arr(&a);
            let out = posting.to_vec();
            proptest::prop_assert!(out.windows(2).all(|w| w[0] < w[1]));
            proptest::prop_assert_eq!(out.len(), posting.len());
        }
    }
}
