//! Regional percentage breakdowns
//!
//! Derives the share each region contributes to a parameter's total over a
//! source's history. The computation is pure and cheap enough to redo on
//! every render; nothing is cached.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sensors::{Parameter, Reading, canonical_region};

/// One region's share of a parameter total, in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionShare {
    #[serde(rename = "regiao")]
    pub region: String,
    #[serde(rename = "valor")]
    pub percentage: f64,
}

/// Share of `parameter` contributed by each region in `history`.
///
/// Sorted by share descending, ties broken by region name ascending. When the
/// parameter sums to zero every present region gets 0 instead of a division
/// by zero. An empty history yields no rows.
pub fn region_percentages<'a, I>(history: I, parameter: Parameter) -> Vec<RegionShare>
where
    I: IntoIterator<Item = &'a Reading>,
{
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    for reading in history {
        *sums.entry(canonical_region(&reading.region)).or_insert(0.0) += reading.value(parameter);
    }

    let total: f64 = sums.values().sum();
    let mut shares: Vec<RegionShare> = sums
        .into_iter()
        .map(|(region, sum)| RegionShare {
            region,
            percentage: if total == 0.0 {
                0.0
            } else {
                sum / total * 100.0
            },
        })
        .collect();

    shares.sort_by(|a, b| {
        b.percentage
            .total_cmp(&a.percentage)
            .then_with(|| a.region.cmp(&b.region))
    });
    shares
}
