use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tracing::debug;
use ulid::Ulid;

use crate::model::DateRange;

pub type DateCounts = BTreeMap<NaiveDate, u32>;

/// Per-date appointment counts memoised per `(shop, range)`.
///
/// Each shop carries a generation number bumped on invalidation; a value
/// computed under an older generation is never stored, so a count that raced
/// with a mutation cannot outlive it.
#[derive(Default)]
pub struct CountsCache {
    entries: DashMap<(Ulid, DateRange), Arc<DateCounts>>,
    generations: DashMap<Ulid, u64>,
}

impl CountsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self, shop_id: Ulid) -> u64 {
        self.generations.get(&shop_id).map_or(0, |g| *g)
    }

    pub fn get(&self, shop_id: Ulid, range: DateRange) -> Option<Arc<DateCounts>> {
        self.entries.get(&(shop_id, range)).map(|e| e.value().clone())
    }

    /// Store `counts` unless the shop was invalidated after `generation` was read.
    pub fn insert(&self, shop_id: Ulid, range: DateRange, generation: u64, counts: Arc<DateCounts>) {
        let current = self.generations.entry(shop_id).or_insert(0);
        if *current == generation {
            self.entries.insert((shop_id, range), counts);
        }
    }

    /// Drop every cached range for the shop.
    pub fn invalidate_shop(&self, shop_id: Ulid) {
        *self.generations.entry(shop_id).or_insert(0) += 1;
        let before = self.entries.len();
        self.entries.retain(|(shop, _), _| *shop != shop_id);
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            debug!("revalidating appointment counts for shop {shop_id}: dropped {dropped} cached ranges");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
