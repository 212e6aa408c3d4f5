//! # `rwdx`
//!
//! A hybrid inverted-index query engine for real-world-data patient cohorts.
//!
//! `rwdx` interns demographic attributes and clinical events into a dense
//! `(attribute, value[, year-month])` posting index, ingested concurrently
//! across shards, queried with boolean cohort requests (`allOf`/`anyOf`/
//! `exclude` over attributes and time-windowed event codes), and persisted
//! to a compact memory-mappable binary container.
//!
//! ## Quick start
//!
//! ```rust
//! use rwdx::config::RwdxConfig;
//! use rwdx::dictionary::Dictionary;
//! use rwdx::people_index::PeopleIndex;
//! use rwdx::posting::PostingFactory;
//! use rwdx::query::{AttrTerm, CohortRequest, QueryEngine};
//!
//! let config = RwdxConfig::default();
//! let mut dict = Dictionary::new();
//! let gender = dict.attr_id("gender");
//! let m = dict.value_id(gender, "M");
//! dict.person_id("patient-0");
//!
//! let factory = PostingFactory::new(
//!     config.posting.bitmap_density_threshold,
//!     config.posting.bitmap_cardinality_threshold,
//!     config.posting.galloping_skew_factor,
//! );
//! let people = PeopleIndex::begin_ingest(config.ingest.shards, factory);
//! people.append_value(gender, m, 0).unwrap();
//! let mut people = people;
//! people.seal().unwrap();
//!
//! let engine = QueryEngine::with_factory(&dict, &people, config.query.max_profile_values, factory);
//! let request = CohortRequest {
//!     attr_all_of: vec![AttrTerm { attr: "gender".into(), value: "M".into() }],
//!     include_matches: true,
//!     ..Default::default()
//! };
//! let result = engine.evaluate(&request);
//! assert_eq!(result.count, 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dictionary;
pub mod error;
pub mod index_store;
pub mod people_index;
pub mod posting;
pub mod query;

pub use config::RwdxConfig;
pub use dictionary::Dictionary;
pub use error::{Error, Result};
pub use index_store::IndexStore;
pub use people_index::PeopleIndex;
pub use posting::{Posting, PostingFactory};
pub use query::{CohortRequest, CohortResult, QueryEngine};
