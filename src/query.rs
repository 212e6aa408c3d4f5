//! QueryEngine: translates structured cohort requests into posting algebra
//! and evaluates them in the fixed order `allOf -> anyOf -> exclude`.

use crate::dictionary::{AttrId, Dictionary, ValueId};
use crate::people_index::PeopleIndex;
use crate::posting::{Posting, PostingFactory};

/// Demographic attributes profiled by [`QueryEngine::profile`].
pub const DEMOGRAPHIC_ATTRS: &[&str] =
    &["gender", "race", "ethnicity", "state", "metro", "urban", "yearOfBirth"];

/// An `{attr, value}` attribute-equality term.
#[derive(Debug, Clone)]
pub struct AttrTerm {
    /// Attribute name, e.g. `"gender"`.
    pub attr: String,
    /// Exact value to match.
    pub value: String,
}

/// An event-code term: an exact or wildcard value, optionally scoped to an
/// inclusive `[start, end]` yyyymm window.
#[derive(Debug, Clone)]
pub struct EventTerm {
    /// Event attribute, e.g. `"conditionCode"`.
    pub attr: String,
    /// Exact value, or a `prefix*` wildcard.
    pub value: String,
    /// Inclusive start month (yyyymm). Requires `end` to take effect.
    pub start_yyyymm: Option<u32>,
    /// Inclusive end month (yyyymm). Requires `start` to take effect.
    pub end_yyyymm: Option<u32>,
}

/// A structured cohort request.
#[derive(Debug, Clone, Default)]
pub struct CohortRequest {
    /// Attribute terms that must all match (intersected).
    pub attr_all_of: Vec<AttrTerm>,
    /// Attribute terms where any match is sufficient (unioned).
    pub attr_any_of: Vec<AttrTerm>,
    /// Attribute terms to exclude (subtracted).
    pub attr_exclude: Vec<AttrTerm>,
    /// Event terms that must all match (intersected).
    pub events_all_of: Vec<EventTerm>,
    /// Event terms where any match is sufficient (unioned).
    pub events_any_of: Vec<EventTerm>,
    /// Event terms to exclude (subtracted).
    pub events_exclude: Vec<EventTerm>,
    /// Whether to materialize and return matched GUIDs, not just the count.
    pub include_matches: bool,
}

/// Result of evaluating a [`CohortRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortResult {
    /// Number of matching patients.
    pub count: usize,
    /// Matched patient GUIDs in ascending `PersonId` order, present only
    /// when `include_matches` was set on the request.
    pub matches: Option<Vec<String>>,
}

/// A `{value_name, count}` profile bucket, emitted by [`QueryEngine::profile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileBucket {
    /// The attribute value or event code this bucket counts.
    pub key: String,
    /// Number of cohort members with this value.
    pub count: usize,
}

/// A type-ahead match for an event attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeaheadMatch {
    /// The matched value string.
    pub value: String,
}

/// Substring matching mode for [`QueryEngine::typeahead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeaheadMode {
    /// Prefix matches only.
    PrefixOnly,
    /// Prefix matches, then substring matches (excluding prefix matches).
    Contains,
}

/// Evaluates [`CohortRequest`]s against a sealed [`Dictionary`] +
/// [`PeopleIndex`] pair.
pub struct QueryEngine<'a> {
    dictionary: &'a Dictionary,
    people_index: &'a PeopleIndex,
    max_profile_values: Option<usize>,
    factory: PostingFactory,
}

impl<'a> QueryEngine<'a> {
    /// Builds an engine over a sealed dictionary and index, intersecting
    /// with the default [`PostingFactory`] galloping skew factor. Prefer
    /// [`QueryEngine::with_factory`] when a configured
    /// [`crate::config::PostingConfig`] is available.
    #[must_use]
    pub fn new(dictionary: &'a Dictionary, people_index: &'a PeopleIndex, max_profile_values: Option<usize>) -> Self {
        Self::with_factory(dictionary, people_index, max_profile_values, PostingFactory::default())
    }

    /// Builds an engine whose intersections use `factory`'s configured
    /// galloping skew factor.
    #[must_use]
    pub fn with_factory(
        dictionary: &'a Dictionary,
        people_index: &'a PeopleIndex,
        max_profile_values: Option<usize>,
        factory: PostingFactory,
    ) -> Self {
        Self {
            dictionary,
            people_index,
            max_profile_values,
            factory,
        }
    }

    fn attr_term_posting(&self, term: &AttrTerm) -> Option<Posting> {
        let aid = self.dictionary.attr_id_lookup(&term.attr)?;
        let vid = self.dictionary.value_id_lookup(aid, &term.value)?;
        match self.people_index.postings_value(aid, vid) {
            Some(p) => Some(p.clone()),
            None => {
                tracing::warn!(attr = %term.attr, value = %term.value, "attribute term has no posting");
                None
            }
        }
    }

    /// Expands a (possibly wildcarded) value into the matching `ValueId`s
    /// for `aid`. A bare `*` expands to nothing, per policy.
    fn expand_value_ids(&self, aid: AttrId, value: &str) -> Vec<ValueId> {
        let Some(prefix) = value.strip_suffix('*') else {
            return self
                .dictionary
                .value_id_lookup(aid, value)
                .into_iter()
                .collect();
        };
        if prefix.is_empty() {
            return Vec::new();
        }
        self.dictionary
            .values_for_attr(aid)
            .map(|values| {
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| v.starts_with(prefix))
                    .map(|(vid, _)| vid as ValueId)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Expands an inclusive yyyymm window into its constituent months.
    /// Returns `None` if the window is absent or malformed (treated as
    /// timeless).
    fn expand_months(start: Option<u32>, end: Option<u32>) -> Option<Vec<u32>> {
        let (start, end) = (start?, end?);
        if start > end {
            return None;
        }
        let (mut year, mut month) = ((start / 100) as i32, (start % 100) as i32);
        let (end_year, end_month) = ((end / 100) as i32, (end % 100) as i32);
        let mut months = Vec::new();
        loop {
            months.push((year * 100 + month) as u32);
            if year == end_year && month == end_month {
                break;
            }
            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
        Some(months)
    }

    /// Evaluates one event filter group: all expansions OR-ed together.
    fn event_term_posting(&self, term: &EventTerm) -> Option<Posting> {
        let aid = self.dictionary.attr_id_lookup(&term.attr)?;
        let vids = self.expand_value_ids(aid, &term.value);
        if vids.is_empty() {
            tracing::warn!(attr = %term.attr, value = %term.value, "event term expanded to no values");
            return None;
        }

        let months = Self::expand_months(term.start_yyyymm, term.end_yyyymm);
        let mut group: Option<Posting> = None;
        let mut fold = |p: Posting| {
            group = Some(match group.take() {
                Some(acc) => acc.union(&p),
                None => p,
            });
        };

        match months {
            Some(months) => {
                for vid in &vids {
                    for yyyymm in &months {
                        if let Some(p) = self.people_index.postings_year(aid, *vid, *yyyymm as i32) {
                            fold(p.clone());
                        }
                    }
                }
            }
            None => {
                for vid in &vids {
                    if let Some(p) = self.people_index.postings_value(aid, *vid) {
                        fold(p.clone());
                    }
                }
            }
        }
        group
    }

    fn attr_terms_postings(&self, terms: &[AttrTerm]) -> Vec<Posting> {
        terms.iter().filter_map(|t| self.attr_term_posting(t)).collect()
    }

    fn event_terms_postings(&self, terms: &[EventTerm]) -> Vec<Posting> {
        terms.iter().filter_map(|t| self.event_term_posting(t)).collect()
    }

    /// Intersects postings in ascending-cardinality order, short-circuiting
    /// on an empty intermediate result.
    fn intersect_all(&self, mut postings: Vec<Posting>) -> Option<Posting> {
        if postings.is_empty() {
            return None;
        }
        postings.sort_by_key(Posting::len);
        let mut iter = postings.into_iter();
        let mut acc = iter.next()?;
        for p in iter {
            if acc.is_empty() {
                break;
            }
            tracing::debug!(acc_len = acc.len(), operand_len = p.len(), "allOf intersect step");
            acc = self.factory.intersect(&acc, &p);
        }
        Some(acc)
    }

    fn union_all(postings: Vec<Posting>) -> Option<Posting> {
        let mut iter = postings.into_iter();
        let mut acc = iter.next()?;
        for p in iter {
            tracing::debug!(acc_len = acc.len(), operand_len = p.len(), "anyOf union step");
            acc = acc.union(&p);
        }
        Some(acc)
    }

    /// Evaluates `request` and returns the matching cohort.
    #[must_use]
    pub fn evaluate(&self, request: &CohortRequest) -> CohortResult {
        let all_of_count = request.attr_all_of.len() + request.events_all_of.len();
        let mut all_of_postings = self.attr_terms_postings(&request.attr_all_of);
        all_of_postings.extend(self.event_terms_postings(&request.events_all_of));

        // A declared allOf term whose posting came back empty/absent short-circuits.
        if all_of_postings.len() < all_of_count {
            return Self::empty_result(request.include_matches);
        }

        let mut accumulator = self.intersect_all(all_of_postings);

        let mut any_of_postings = self.attr_terms_postings(&request.attr_any_of);
        any_of_postings.extend(self.event_terms_postings(&request.events_any_of));
        if let Some(any_union) = Self::union_all(any_of_postings) {
            accumulator = Some(match accumulator {
                Some(acc) => self.factory.intersect(&acc, &any_union),
                None => any_union,
            });
        }

        let Some(mut accumulator) = accumulator else {
            return Self::empty_result(request.include_matches);
        };

        let mut exclude_postings = self.attr_terms_postings(&request.attr_exclude);
        exclude_postings.extend(self.event_terms_postings(&request.events_exclude));
        if let Some(neg) = Self::union_all(exclude_postings) {
            tracing::debug!(acc_len = accumulator.len(), neg_len = neg.len(), "exclude subtract step");
            accumulator = accumulator.subtract(&neg);
        }

        let count = accumulator.len();
        let matches = request.include_matches.then(|| {
            accumulator
                .iter()
                .filter_map(|pid| self.dictionary.person_guid(pid).ok().map(str::to_string))
                .collect()
        });
        CohortResult { count, matches }
    }

    fn empty_result(include_matches: bool) -> CohortResult {
        CohortResult {
            count: 0,
            matches: include_matches.then(Vec::new),
        }
    }

    /// Profiles a cohort posting against demographic attributes and event
    /// codes referenced by the original request's event allOf/anyOf groups.
    #[must_use]
    pub fn profile(&self, cohort: &Posting, request: &CohortRequest) -> Vec<(String, Vec<ProfileBucket>)> {
        let mut groups = Vec::new();
        let cohort_bitmap = Posting::Bitmap(cohort.to_bitmap());

        for attr_name in DEMOGRAPHIC_ATTRS {
            let Some(aid) = self.dictionary.attr_id_lookup(attr_name) else {
                continue;
            };
            let Ok(values) = self.dictionary.values_for_attr(aid) else {
                continue;
            };
            let mut buckets = Vec::new();
            for (vid, value) in values.iter().enumerate() {
                let Some(posting) = self.people_index.postings_value(aid, vid as ValueId) else {
                    continue;
                };
                let posting_bitmap = Posting::Bitmap(posting.to_bitmap());
                let count = cohort_bitmap.intersect(&posting_bitmap).len();
                if count > 0 {
                    buckets.push(ProfileBucket {
                        key: value.clone(),
                        count,
                    });
                }
            }
            buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
            if let Some(limit) = self.max_profile_values {
                buckets.truncate(limit);
            }
            if !buckets.is_empty() {
                groups.push(((*attr_name).to_string(), buckets));
            }
        }

        let mut event_codes: Vec<(AttrId, ValueId)> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for term in request.events_all_of.iter().chain(&request.events_any_of) {
            let Some(aid) = self.dictionary.attr_id_lookup(&term.attr) else {
                continue;
            };
            for vid in self.expand_value_ids(aid, &term.value) {
                if seen.insert((aid, vid)) {
                    event_codes.push((aid, vid));
                }
            }
        }

        let mut event_groups: std::collections::BTreeMap<String, Vec<ProfileBucket>> =
            std::collections::BTreeMap::new();
        for (aid, vid) in event_codes {
            let Ok(attr_name) = self.dictionary.attr_name(aid) else {
                continue;
            };
            let Ok(value) = self.dictionary.value(aid, vid) else {
                continue;
            };
            let Some(posting) = self.people_index.postings_value(aid, vid) else {
                continue;
            };
            let posting_bitmap = Posting::Bitmap(posting.to_bitmap());
            let count = cohort_bitmap.intersect(&posting_bitmap).len();
            if count > 0 {
                event_groups.entry(attr_name.to_string()).or_default().push(ProfileBucket {
                    key: value.to_string(),
                    count,
                });
            }
        }
        for buckets in event_groups.values_mut() {
            buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        }
        groups.extend(event_groups);
        groups
    }

    /// Lists values stored for `attr` matching `keyword` case-insensitively:
    /// prefix matches first, then (in `Contains` mode) substring matches
    /// excluding ones already returned as a prefix match. Paginated with
    /// `limit` clamped to `[1, 100]`.
    #[must_use]
    pub fn typeahead(&self, attr: &str, keyword: &str, mode: TypeaheadMode, offset: usize, limit: usize) -> Vec<TypeaheadMatch> {
        let limit = limit.clamp(1, 100);
        let Some(aid) = self.dictionary.attr_id_lookup(attr) else {
            return Vec::new();
        };
        let Ok(values) = self.dictionary.values_for_attr(aid) else {
            return Vec::new();
        };
        let needle = keyword.to_lowercase();

        let mut prefix_matches: Vec<&str> = values
            .iter()
            .map(String::as_str)
            .filter(|v| v.to_lowercase().starts_with(&needle))
            .collect();
        prefix_matches.sort_unstable();

        let mut all_matches: Vec<&str> = prefix_matches.clone();
        if mode == TypeaheadMode::Contains {
            let prefix_set: std::collections::HashSet<&str> = prefix_matches.iter().copied().collect();
            let mut substring_matches: Vec<&str> = values
                .iter()
                .map(String::as_str)
                .filter(|v| !prefix_set.contains(v) && v.to_lowercase().contains(&needle))
                .collect();
            substring_matches.sort_unstable();
            all_matches.extend(substring_matches);
        }

        all_matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|v| TypeaheadMatch { value: v.to_string() })
            .collect()
    }
}
