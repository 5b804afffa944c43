/*
[INPUT]:  Screening flags (`coins`) and instrument filters (`coins_info`)
[OUTPUT]: Entry candidates not yet tracked by the engine
[POS]:    Domain layer - join of the external screening feed
[UPDATE]: When the screening feed shape changes
*/

use std::collections::{HashMap, HashSet};

use bybit_hedge_adapter::InstrumentFilters;

use crate::settings::ScreeningFlags;

/// One symbol eligible for a new main leg
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub symbol: String,
    pub filters: InstrumentFilters,
    pub long: bool,
    pub short: bool,
}

impl Candidate {
    /// Entry direction; long wins when the feed flags both
    pub fn is_long(&self) -> bool {
        self.long
    }
}

/// Inner join of flags and filters, keeping flagged symbols that are not
/// already tracked. Sorted by symbol.
pub fn eligible(
    flags: &HashMap<String, ScreeningFlags>,
    filters: &HashMap<String, InstrumentFilters>,
    tracked: &HashSet<String>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = flags
        .iter()
        .filter(|(symbol, flag)| (flag.long || flag.short) && !tracked.contains(*symbol))
        .filter_map(|(symbol, flag)| {
            filters.get(symbol).map(|filters| Candidate {
                symbol: symbol.clone(),
                filters: *filters,
                long: flag.long,
                short: flag.short,
            })
        })
        .collect();
    candidates.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    candidates
}
