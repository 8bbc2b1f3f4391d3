//! Unread counters derived from local collections
//!
//! Counts are never stored or mutated directly: [`recompute`] is a pure
//! function of the collections, so every record lands in exactly one
//! [`Section`] and the per-section counts always sum to the number of
//! unread records.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::reconcile::Collection;
use crate::types::{Domain, Record};

/// Presentation section an unread record is counted under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Invitations,
    Active,
    Completed,
    Friends,
    Notifications,
}

impl Section {
    pub const ALL: [Section; 5] = [
        Section::Invitations,
        Section::Active,
        Section::Completed,
        Section::Friends,
        Section::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Invitations => "invitations",
            Section::Active => "active",
            Section::Completed => "completed",
            Section::Friends => "friends",
            Section::Notifications => "notifications",
        }
    }

    /// Section a record of `domain` belongs to.
    ///
    /// Plans split on their `status` field; every other domain maps 1:1.
    pub fn classify(domain: Domain, record: &Record) -> Section {
        match domain {
            Domain::Plans => match record.str_field("status") {
                Some("completed") | Some("done") | Some("past") => Section::Completed,
                _ => Section::Active,
            },
            Domain::Friends => Section::Friends,
            Domain::Invitations => Section::Invitations,
            Domain::Notifications => Section::Notifications,
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact unread counts per section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadCounts {
    pub by_section: BTreeMap<Section, usize>,
}

impl UnreadCounts {
    /// Count for one section (zero when absent)
    pub fn get(&self, section: Section) -> usize {
        self.by_section.get(&section).copied().unwrap_or(0)
    }

    /// Sum across every section
    pub fn total(&self) -> usize {
        self.by_section.values().sum()
    }
}

/// Recompute unread counts from the current collections.
///
/// Every section is present in the result, zero or not.
pub fn recompute<'a, I>(collections: I) -> UnreadCounts
where
    I: IntoIterator<Item = (Domain, &'a Collection)>,
{
    let mut by_section: BTreeMap<Section, usize> =
        Section::ALL.iter().map(|section| (*section, 0)).collect();

    for (domain, collection) in collections {
        for record in collection.records() {
            if record.is_unread() {
                *by_section
                    .entry(Section::classify(domain, record))
                    .or_insert(0) += 1;
            }
        }
    }

    UnreadCounts { by_section }
}
