//! Dictionary: interns attribute names, attribute values, and patient GUIDs
//! into dense, positional integer identifiers.
//!
//! Three independent namespaces are maintained, each a bidirectional
//! string-interning table in the style of a column-store string table: a
//! growable `Vec` for id -> string lookups and a hash map for the reverse
//! direction. IDs are always equal to the index they were pushed at, so
//! `export`/`import` round-trips are just the positional arrays.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Attribute id. Small and signed; positional in `Dictionary::attr_names`.
pub type AttrId = i32;
/// Value id, positional within a single attribute's value table.
pub type ValueId = i32;
/// Dense patient identifier, positional in `Dictionary::person_guids`.
pub type PersonId = u32;

/// A single attribute's interned value table: bidirectional string <-> id.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ValueTable {
    values: Vec<String>,
    #[serde(skip)]
    index: FxHashMap<String, ValueId>,
}

impl ValueTable {
    fn rebuild_index(&mut self) {
        self.index = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as ValueId))
            .collect();
    }

    fn intern(&mut self, value: &str) -> ValueId {
        if let Some(&id) = self.index.get(value) {
            return id;
        }
        let id = self.values.len() as ValueId;
        self.values.push(value.to_string());
        self.index.insert(value.to_string(), id);
        id
    }

    fn get(&self, id: ValueId) -> Option<&str> {
        self.values.get(usize::try_from(id).ok()?).map(String::as_str)
    }

    fn get_id(&self, value: &str) -> Option<ValueId> {
        self.index.get(value).copied()
    }
}

/// A positional export of the dictionary's three namespaces.
///
/// `value_tables[aid]` lines up with `attr_names[aid]`; every id is implied
/// by position, so re-importing restores the exact same id assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DictionarySnapshot {
    /// Attribute names, indexed by `AttrId`.
    pub attr_names: Vec<String>,
    /// Per-attribute value tables, indexed by `AttrId` then `ValueId`.
    pub value_tables: Vec<Vec<String>>,
    /// External patient GUIDs, indexed by `PersonId`.
    pub person_guids: Vec<String>,
}

/// Interns attribute names, attribute values, and patient GUIDs into dense
/// positional integer identifiers.
///
/// Allocation never fails and is idempotent: calling `attr_id`/`value_id`/
/// `person_id` twice with the same input returns the same id. Only lookups
/// for ids or names that were never allocated fail, with `Error::NotFound`.
#[derive(Debug, Default)]
pub struct Dictionary {
    attr_names: Vec<String>,
    attr_index: FxHashMap<String, AttrId>,
    value_tables: Vec<ValueTable>,
    person_guids: Vec<String>,
    person_index: FxHashMap<String, PersonId>,
}

impl Dictionary {
    /// Creates a new, empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, allocating a new one (with an empty value
    /// table) if it has not been seen before.
    pub fn attr_id(&mut self, name: &str) -> AttrId {
        if let Some(&id) = self.attr_index.get(name) {
            return id;
        }
        let id = self.attr_names.len() as AttrId;
        self.attr_names.push(name.to_string());
        self.attr_index.insert(name.to_string(), id);
        self.value_tables.push(ValueTable::default());
        id
    }

    /// Looks up an already-allocated attribute id without allocating.
    #[must_use]
    pub fn attr_id_lookup(&self, name: &str) -> Option<AttrId> {
        self.attr_index.get(name).copied()
    }

    /// Returns the name for an attribute id.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `aid` was never allocated.
    pub fn attr_name(&self, aid: AttrId) -> Result<&str> {
        usize::try_from(aid)
            .ok()
            .and_then(|i| self.attr_names.get(i))
            .map(String::as_str)
            .ok_or_else(|| Error::NotFound(format!("attribute id {aid}")))
    }

    /// Returns the id for `value` within attribute `aid`, allocating a new
    /// one if it has not been seen before.
    ///
    /// # Panics
    ///
    /// Panics if `aid` was never allocated via `attr_id` — a programming
    /// error, since callers always allocate the attribute first.
    pub fn value_id(&mut self, aid: AttrId, value: &str) -> ValueId {
        let table = &mut self.value_tables[usize::try_from(aid).expect("valid attr id")];
        table.intern(value)
    }

    /// Looks up an already-allocated value id without allocating.
    #[must_use]
    pub fn value_id_lookup(&self, aid: AttrId, value: &str) -> Option<ValueId> {
        let table = self.value_tables.get(usize::try_from(aid).ok()?)?;
        table.get_id(value)
    }

    /// Returns the value string for `(aid, vid)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if either id is unknown.
    pub fn value(&self, aid: AttrId, vid: ValueId) -> Result<&str> {
        let table = usize::try_from(aid)
            .ok()
            .and_then(|i| self.value_tables.get(i))
            .ok_or_else(|| Error::NotFound(format!("attribute id {aid}")))?;
        table
            .get(vid)
            .ok_or_else(|| Error::NotFound(format!("value id {vid} for attribute {aid}")))
    }

    /// Returns all values interned for `aid`, in id order.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `aid` is unknown.
    pub fn values_for_attr(&self, aid: AttrId) -> Result<&[String]> {
        usize::try_from(aid)
            .ok()
            .and_then(|i| self.value_tables.get(i))
            .map(|t| t.values.as_slice())
            .ok_or_else(|| Error::NotFound(format!("attribute id {aid}")))
    }

    /// Returns the id for `guid`. Idempotent: the first caller to intern a
    /// GUID fixes its id for the lifetime of the dictionary.
    pub fn person_id(&mut self, guid: &str) -> PersonId {
        if let Some(&id) = self.person_index.get(guid) {
            return id;
        }
        let id = self.person_guids.len() as PersonId;
        self.person_guids.push(guid.to_string());
        self.person_index.insert(guid.to_string(), id);
        id
    }

    /// Looks up an already-allocated person id without allocating.
    #[must_use]
    pub fn person_id_lookup(&self, guid: &str) -> Option<PersonId> {
        self.person_index.get(guid).copied()
    }

    /// Returns the external GUID for a patient id.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `pid` was never allocated.
    pub fn person_guid(&self, pid: PersonId) -> Result<&str> {
        self.person_guids
            .get(pid as usize)
            .map(String::as_str)
            .ok_or_else(|| Error::NotFound(format!("person id {pid}")))
    }

    /// Number of interned attributes.
    #[must_use]
    pub fn attr_count(&self) -> usize {
        self.attr_names.len()
    }

    /// Number of interned patients.
    #[must_use]
    pub fn person_count(&self) -> usize {
        self.person_guids.len()
    }

    /// Exports a full positional snapshot of all three namespaces.
    #[must_use]
    pub fn export_full_snapshot(&self) -> DictionarySnapshot {
        DictionarySnapshot {
            attr_names: self.attr_names.clone(),
            value_tables: self
                .value_tables
                .iter()
                .map(|t| t.values.clone())
                .collect(),
            person_guids: self.person_guids.clone(),
        }
    }

    /// Replaces the dictionary's contents with `snapshot`. All ids are
    /// thereby implied by position.
    pub fn import_full_snapshot(&mut self, snapshot: DictionarySnapshot) {
        self.attr_names = snapshot.attr_names;
        self.attr_index = self
            .attr_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as AttrId))
            .collect();

        self.value_tables = snapshot
            .value_tables
            .into_iter()
            .map(|values| {
                let mut table = ValueTable {
                    values,
                    index: FxHashMap::default(),
                };
                table.rebuild_index();
                table
            })
            .collect();

        self.person_guids = snapshot.person_guids;
        self.person_index = self
            .person_guids
            .iter()
            .enumerate()
            .map(|(i, g)| (g.clone(), i as PersonId))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_id_is_idempotent() {
        let mut dict = Dictionary::new();
        let a = dict.attr_id("gender");
        let b = dict.attr_id("gender");
        assert_eq!(a, b);
        assert_eq!(dict.attr_id("race"), a + 1);
    }

    #[test]
    fn value_id_is_per_attribute() {
        let mut dict = Dictionary::new();
        let gender = dict.attr_id("gender");
        let race = dict.attr_id("race");
        let m = dict.value_id(gender, "M");
        let asian_race = dict.value_id(race, "Asian");
        // Separate attributes get independent value spaces, both starting at 0.
        assert_eq!(m, 0);
        assert_eq!(asian_race, 0);
        assert_eq!(dict.value(gender, m).unwrap(), "M");
        assert_eq!(dict.value(race, asian_race).unwrap(), "Asian");
    }

    #[test]
    fn person_id_is_idempotent_and_first_caller_wins() {
        let mut dict = Dictionary::new();
        let p0 = dict.person_id("guid-0");
        let p0_again = dict.person_id("guid-0");
        let p1 = dict.person_id("guid-1");
        assert_eq!(p0, p0_again);
        assert_ne!(p0, p1);
    }

    #[test]
    fn unknown_lookups_fail_not_found() {
        let dict = Dictionary::new();
        assert!(dict.attr_name(0).is_err());
        assert!(dict.person_guid(0).is_err());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut dict = Dictionary::new();
        let gender = dict.attr_id("gender");
        dict.value_id(gender, "M");
        dict.value_id(gender, "F");
        dict.person_id("guid-0");
        dict.person_id("guid-1");

        let snapshot = dict.export_full_snapshot();
        let mut restored = Dictionary::new();
        restored.import_full_snapshot(snapshot.clone());

        assert_eq!(restored.export_full_snapshot(), snapshot);
        assert_eq!(restored.attr_id_lookup("gender"), Some(gender));
        assert_eq!(restored.value_id_lookup(gender, "F"), Some(1));
        assert_eq!(restored.person_id_lookup("guid-1"), Some(1));
    }
}
