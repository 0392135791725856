//! Per compact group statistics.
//!
//! Group 0 holds young regions; group `1 + age` holds tenure regions of that
//! logical age, capped at the oldest group.

/// Survival history of one group, carried across collections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactGroupHistory {
    /// Fraction of collected-set bytes that survived, averaged over cycles.
    pub historical_survival_rate: f64,
    /// Historical rate blended with the rates of older groups.
    pub weighted_survival_rate: f64,
}

impl Default for CompactGroupHistory {
    fn default() -> Self {
        Self {
            historical_survival_rate: 1.0,
            weighted_survival_rate: 1.0,
        }
    }
}

/// Measurements of one group within a single collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactGroupCycle {
    pub regions: usize,
    pub free_bytes: usize,
    /// Free bytes a compaction of the scored regions would recover.
    pub recoverable_bytes: usize,
    pub live_before_group: usize,
    pub live_before_collected_set: usize,
    pub live_after_collected_set: usize,
}

const OLDER_GROUP_WEIGHT: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct CompactGroups {
    history: Vec<CompactGroupHistory>,
    cycle: Vec<CompactGroupCycle>,
}

impl CompactGroups {
    pub fn new(count: usize) -> Self {
        Self {
            history: vec![CompactGroupHistory::default(); count],
            cycle: vec![CompactGroupCycle::default(); count],
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self, group: usize) -> &CompactGroupHistory {
        &self.history[group]
    }

    pub fn cycle(&self, group: usize) -> &CompactGroupCycle {
        &self.cycle[group]
    }

    pub fn cycle_mut(&mut self, group: usize) -> &mut CompactGroupCycle {
        &mut self.cycle[group]
    }

    pub fn weighted_survival_rate(&self, group: usize) -> f64 {
        self.history[group].weighted_survival_rate
    }

    pub fn reset_cycle(&mut self) {
        self.cycle.fill(CompactGroupCycle::default());
    }

    /// Folds this cycle's collected-set survival into each group's history,
    /// then re-derives the weighted rates from the oldest group down.
    pub fn update_survival_rates(&mut self) {
        for (history, cycle) in self.history.iter_mut().zip(&self.cycle) {
            if cycle.live_before_collected_set == 0 || cycle.live_before_group == 0 {
                continue;
            }
            let weight = (cycle.live_before_collected_set as f64 / cycle.live_before_group as f64).min(1.0);
            let rate =
                (cycle.live_after_collected_set as f64 / cycle.live_before_collected_set as f64).min(1.0);
            history.historical_survival_rate =
                history.historical_survival_rate * (1.0 - weight) + rate * weight;
        }

        let mut older: Option<f64> = None;
        for history in self.history.iter_mut().rev() {
            let own = history.historical_survival_rate;
            let weighted = match older {
                Some(older) => (OLDER_GROUP_WEIGHT * older + (1.0 - OLDER_GROUP_WEIGHT) * own).min(own),
                None => own,
            };
            history.weighted_survival_rate = weighted;
            older = Some(weighted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_groups_assume_everything_survives() {
        let groups = CompactGroups::new(4);
        assert!((0..4).all(|g| groups.weighted_survival_rate(g) == 1.0));
    }

    #[test]
    fn survival_history_is_weighted_by_collected_share() {
        let mut groups = CompactGroups::new(3);
        *groups.cycle_mut(2) = CompactGroupCycle {
            live_before_group: 1000,
            live_before_collected_set: 500,
            live_after_collected_set: 100,
            ..CompactGroupCycle::default()
        };
        groups.update_survival_rates();

        let oldest = groups.history(2);
        assert!((oldest.historical_survival_rate - 0.6).abs() < 1e-9, "half weight on rate 0.2");
        assert!((oldest.weighted_survival_rate - 0.6).abs() < 1e-9, "oldest group uses its own rate");

        let middle = groups.history(1);
        assert_eq!(middle.historical_survival_rate, 1.0);
        assert!(
            (middle.weighted_survival_rate - (0.7 * 0.6 + 0.3)).abs() < 1e-9,
            "blended with the older group"
        );
    }

    #[test]
    fn weighted_rate_never_exceeds_own_rate() {
        let mut groups = CompactGroups::new(2);
        *groups.cycle_mut(0) = CompactGroupCycle {
            live_before_group: 100,
            live_before_collected_set: 100,
            live_after_collected_set: 10,
            ..CompactGroupCycle::default()
        };
        groups.update_survival_rates();
        assert!((groups.weighted_survival_rate(0) - 0.1).abs() < 1e-9);
    }
}
