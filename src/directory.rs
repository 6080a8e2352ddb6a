//! Directory view model
//!
//! Flattens the catalog into the two-section row list a location picker
//! renders: section 0 holds free locations, section 1 premium ones. Each
//! country row can be expanded in place to show its servers. A non-empty
//! search query switches to a separate filtered projection that leaves the
//! expansion state untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use serde::Serialize;

use crate::catalog::{Catalog, Country, Pool, Server};

/// Identifies a country row by section and its index in the sorted country list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CountryKey {
    pub section: usize,
    pub index: usize,
}

pub type ExpandedSet = BTreeSet<CountryKey>;

/// One rendered row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirectoryRow {
    Country { section: usize, country: Country },
    Server { section: usize, server: Server },
}

impl DirectoryRow {
    pub fn section(&self) -> usize {
        match self {
            DirectoryRow::Country { section, .. } | DirectoryRow::Server { section, .. } => *section,
        }
    }

    /// Premium rows carry the crown badge
    pub fn is_premium(&self) -> bool {
        self.section() == Pool::Premium.section()
    }

    /// Remaining capacity shown as the signal bars
    pub fn signal_strength(&self) -> f64 {
        match self {
            DirectoryRow::Country { country, .. } => country.signal_strength(),
            DirectoryRow::Server { server, .. } => server.signal_strength(),
        }
    }
}

/// Section header title
pub fn section_title(section: usize) -> Option<&'static str> {
    match section {
        0 => Some(Pool::Free.title()),
        1 => Some(Pool::Premium.title()),
        _ => None,
    }
}

/// Contiguous rows inserted or removed by a toggle, as row indices within the section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum RowDelta {
    Inserted { section: usize, rows: Range<usize> },
    Removed { section: usize, rows: Range<usize> },
}

/// What selecting a row resolved to
#[derive(Debug, Clone, PartialEq)]
pub enum RowSelection {
    /// A country row was expanded or collapsed
    Toggled(RowDelta),
    /// A server row was picked; the caller applies the selection gate
    Server(Server),
}

/// Group one pool's servers into countries by their `country` field, sorted
/// by name (ordinal). Servers inside a country are ordered by name.
pub fn group_countries(servers: &[Server], pool: Pool) -> Vec<Country> {
    let mut grouped: BTreeMap<String, BTreeMap<String, Server>> = BTreeMap::new();
    for server in servers {
        grouped
            .entry(server.country.clone())
            .or_default()
            .insert(server.name.clone(), server.clone());
    }

    grouped
        .into_iter()
        .map(|(name, servers)| Country {
            name,
            requires_subscription: pool == Pool::Premium,
            servers,
        })
        .collect()
}

fn sections(catalog: &Catalog) -> [Vec<Country>; 2] {
    [
        group_countries(&catalog.free_servers(), Pool::Free),
        group_countries(&catalog.premium_servers(), Pool::Premium),
    ]
}

fn flatten(sections: &[Vec<Country>; 2], expanded: &ExpandedSet) -> Vec<DirectoryRow> {
    let mut rows = Vec::new();
    for (section, countries) in sections.iter().enumerate() {
        for (index, country) in countries.iter().enumerate() {
            rows.push(DirectoryRow::Country {
                section,
                country: country.clone(),
            });
            if expanded.contains(&CountryKey { section, index }) {
                rows.extend(country.servers.values().map(|server| DirectoryRow::Server {
                    section,
                    server: server.clone(),
                }));
            }
        }
    }
    rows
}

/// Flatten the catalog with the given countries expanded
pub fn rebuild(catalog: &Catalog, expanded: &ExpandedSet) -> Vec<DirectoryRow> {
    flatten(&sections(catalog), expanded)
}

/// Filter servers by a case-insensitive substring of name, city, country or
/// state. Each matching country gets one header row, followed by all its
/// matching servers, in the section of the server's own pool.
///
/// Returns `None` for a blank query; the caller falls back to the
/// flattened view.
pub fn search(query: &str, servers: &[Server]) -> Option<Vec<DirectoryRow>> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }

    let matches = |server: &Server| {
        [&server.name, &server.city, &server.country, &server.state]
            .iter()
            .any(|field| field.to_lowercase().contains(&query))
    };

    // (section, country) in first-seen order
    let mut groups: Vec<((usize, String), Vec<Server>)> = Vec::new();
    for server in servers.iter().filter(|s| matches(s)) {
        let key = (server.pool().section(), server.country.clone());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(server.clone()),
            None => groups.push((key, vec![server.clone()])),
        }
    }
    // Keep section 0 ahead of section 1, first-seen order inside each
    groups.sort_by_key(|((section, _), _)| *section);

    let mut rows = Vec::new();
    for ((section, name), matched) in groups {
        rows.push(DirectoryRow::Country {
            section,
            country: Country {
                name,
                requires_subscription: section == Pool::Premium.section(),
                servers: matched.iter().map(|s| (s.name.clone(), s.clone())).collect(),
            },
        });
        rows.extend(
            matched
                .into_iter()
                .map(|server| DirectoryRow::Server { section, server }),
        );
    }
    Some(rows)
}

/// Stateful picker model: expansion state plus an optional search projection
#[derive(Debug, Clone, Default)]
pub struct DirectoryView {
    sections: [Vec<Country>; 2],
    servers: Vec<Server>,
    expanded: ExpandedSet,
    rows: Vec<DirectoryRow>,
    search_rows: Option<Vec<DirectoryRow>>,
}

impl DirectoryView {
    pub fn new(catalog: &Catalog) -> Self {
        let mut servers = catalog.free_servers();
        servers.extend(catalog.premium_servers());

        let sections = sections(catalog);
        let expanded = ExpandedSet::new();
        let rows = flatten(&sections, &expanded);

        Self {
            sections,
            servers,
            expanded,
            rows,
            search_rows: None,
        }
    }

    /// Rows currently on screen (search results while searching)
    pub fn rows(&self) -> &[DirectoryRow] {
        self.search_rows.as_deref().unwrap_or(&self.rows)
    }

    /// On-screen rows of one section
    pub fn section_rows(&self, section: usize) -> Vec<&DirectoryRow> {
        self.rows().iter().filter(|r| r.section() == section).collect()
    }

    pub fn expanded(&self) -> &ExpandedSet {
        &self.expanded
    }

    pub fn is_searching(&self) -> bool {
        self.search_rows.is_some()
    }

    /// Enter, update or leave search mode
    pub fn set_query(&mut self, query: &str) {
        self.search_rows = search(query, &self.servers);
    }

    /// Expand or collapse a country, updating the row list in place
    pub fn toggle(&mut self, key: CountryKey) -> Option<RowDelta> {
        let country = self.sections.get(key.section)?.get(key.index)?;
        let count = country.servers.len();
        let section = key.section;

        let position = self.rows.iter().position(|row| match row {
            DirectoryRow::Country { section: s, country: c } => *s == section && c.name == country.name,
            DirectoryRow::Server { .. } => false,
        })?;
        let section_start = self.rows.iter().position(|r| r.section() == section)?;
        let first = position - section_start + 1;

        if self.expanded.remove(&key) {
            self.rows.drain(position + 1..position + 1 + count);
            tracing::debug!("Collapsed {} ({} rows)", country.name, count);
            Some(RowDelta::Removed {
                section,
                rows: first..first + count,
            })
        } else {
            self.expanded.insert(key);
            let inserted: Vec<DirectoryRow> = country
                .servers
                .values()
                .map(|server| DirectoryRow::Server {
                    section,
                    server: server.clone(),
                })
                .collect();
            self.rows.splice(position + 1..position + 1, inserted);
            tracing::debug!("Expanded {} ({} rows)", country.name, count);
            Some(RowDelta::Inserted {
                section,
                rows: first..first + count,
            })
        }
    }

    /// Resolve a tap on `row` (index within `section`).
    ///
    /// Country rows toggle outside search mode; search headers are inert.
    pub fn select(&mut self, section: usize, row: usize) -> Option<RowSelection> {
        let target = self.section_rows(section).get(row).map(|r| (*r).clone())?;

        match target {
            DirectoryRow::Server { server, .. } => Some(RowSelection::Server(server)),
            DirectoryRow::Country { .. } if self.is_searching() => None,
            DirectoryRow::Country { country, .. } => {
                let index = self.sections[section]
                    .iter()
                    .position(|c| c.name == country.name)?;
                self.toggle(CountryKey { section, index })
                    .map(RowSelection::Toggled)
            }
        }
    }
}
