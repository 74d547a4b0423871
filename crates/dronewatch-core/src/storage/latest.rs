use std::collections::BTreeMap;

use crate::sensors::{Reading, canonical_region};

/// Most recent reading per canonical region.
///
/// Regions can be pre-seeded so a dashboard lists them before any data
/// arrives. Writes are last-write-wins in arrival order; payload contents
/// never decide which reading is "newer".
#[derive(Debug, Clone, Default)]
pub struct LatestTable {
    regions: BTreeMap<String, Option<Reading>>,
}

impl LatestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with the given regions present but empty
    pub fn with_regions<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let regions = regions
            .into_iter()
            .map(|region| canonical_region(region.as_ref()))
            .filter(|region| !region.is_empty())
            .map(|region| (region, None))
            .collect();
        Self { regions }
    }

    /// Record a reading under its region, returning the reading it replaced
    pub fn record(&mut self, reading: Reading) -> Option<Reading> {
        self.regions
            .insert(reading.region.clone(), Some(reading))
            .flatten()
    }

    /// Latest reading for `region`; the lookup is case-insensitive
    pub fn get(&self, region: &str) -> Option<&Reading> {
        self.regions.get(&canonical_region(region))?.as_ref()
    }

    /// Whether the region is known, with or without data
    pub fn contains(&self, region: &str) -> bool {
        self.regions.contains_key(&canonical_region(region))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Iterate regions in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Reading>)> {
        self.regions
            .iter()
            .map(|(region, reading)| (region.as_str(), reading.as_ref()))
    }

    pub fn to_map(&self) -> BTreeMap<String, Option<Reading>> {
        self.regions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::IdSource;

    fn reading(ids: &IdSource, region: &str, temperature: f64) -> Reading {
        Reading {
            id: ids.next(),
            pressure: 1000.0,
            radiation: 0.2,
            temperature,
            humidity: 40.0,
            latitude: 1.0,
            longitude: 2.0,
            region: region.into(),
        }
    }

    #[test]
    fn test_seeded_regions_start_empty() {
        let table = LatestTable::with_regions(["Norte", "sul", " ", "LESTE"]);

        assert_eq!(table.len(), 3);
        assert!(table.contains("norte"));
        assert!(table.contains("Leste"));
        assert!(table.get("norte").is_none());
    }

    #[test]
    fn test_last_arrival_wins_per_region() {
        let ids = IdSource::new();
        let mut table = LatestTable::new();

        table.record(reading(&ids, "norte", 20.0));
        table.record(reading(&ids, "sul", 30.0));
        let replaced = table.record(reading(&ids, "norte", 25.0));
        table.record(reading(&ids, "sul", 12.0));

        assert_eq!(replaced.unwrap().temperature, 20.0);
        assert_eq!(table.get("NORTE").unwrap().temperature, 25.0);
        assert_eq!(table.get("sul").unwrap().temperature, 12.0);
    }

    #[test]
    fn test_first_reading_for_seeded_region_replaces_nothing() {
        let ids = IdSource::new();
        let mut table = LatestTable::with_regions(["oeste"]);

        assert!(table.record(reading(&ids, "oeste", 18.0)).is_none());
        assert_eq!(table.iter().count(), 1);
    }
}
