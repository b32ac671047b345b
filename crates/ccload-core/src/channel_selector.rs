//! Filters and orders channels for a request: model/type match, drop
//! cooling channels, sort by effective priority, and break ties with a
//! smooth weighted round robin (the deterministic algorithm nginx uses for
//! its `weight=` upstream directive) so that, within a tie group, traffic
//! share tracks each channel's effective key count rather than always
//! picking the same channel first.

use ccload_storage::Channel;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelHealthStat {
    pub success_count: u64,
    pub failure_count: u64,
}

impl ChannelHealthStat {
    fn sample_count(&self) -> u64 {
        self.success_count + self.failure_count
    }

    fn failure_rate(&self) -> f64 {
        let total = self.sample_count();
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }

    fn confidence(&self, min_confident_sample: u64) -> f64 {
        if min_confident_sample == 0 {
            return 1.0;
        }
        (self.sample_count() as f64 / min_confident_sample as f64).min(1.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectorTuning {
    pub penalty_weight: f64,
    pub min_confident_sample: u64,
    /// Tie-group comparison precision for effective priority.
    pub tie_precision: f64,
    pub group_idle_timeout: Duration,
}

impl Default for SelectorTuning {
    fn default() -> Self {
        Self {
            penalty_weight: 10.0,
            min_confident_sample: 20,
            tie_precision: 0.1,
            group_idle_timeout: Duration::from_secs(300),
        }
    }
}

struct SmoothWeightedEntry {
    channel_id: i64,
    weight: i64,
    current_weight: i64,
}

struct GroupState {
    entries: Vec<SmoothWeightedEntry>,
    last_used: Instant,
}

/// Per-process state for channel ordering: smooth-weighted-RR tie-break
/// state, keyed by the sorted id-tuple of each tie group so that distinct
/// groups (which occur as cooldowns/health change over time) don't share
/// counters.
pub struct ChannelSelector {
    tuning: SelectorTuning,
    groups: Mutex<HashMap<Vec<i64>, GroupState>>,
}

impl ChannelSelector {
    pub fn new(tuning: SelectorTuning) -> Self {
        Self {
            tuning,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// `effective_key_counts` maps channel id -> `max(1, totalKeys -
    /// coolingKeys)`, used as the smooth-weighted-RR weight for ties.
    pub fn order(
        &self,
        mut candidates: Vec<Channel>,
        health: &HashMap<i64, ChannelHealthStat>,
        effective_key_counts: &HashMap<i64, u32>,
    ) -> Vec<Channel> {
        if candidates.is_empty() {
            return candidates;
        }

        let mut scored: Vec<(Channel, f64)> = candidates
            .drain(..)
            .map(|c| {
                let eff = self.effective_priority(&c, health);
                (c, eff)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut result = Vec::with_capacity(scored.len());
        let mut i = 0;
        while i < scored.len() {
            let mut j = i + 1;
            while j < scored.len() && (scored[i].1 - scored[j].1).abs() < self.tuning.tie_precision {
                j += 1;
            }
            let mut group: Vec<Channel> = scored[i..j].iter().map(|(c, _)| c.clone()).collect();
            if group.len() > 1 {
                self.reorder_tie_group(&mut group, effective_key_counts);
            }
            result.extend(group);
            i = j;
        }
        result
    }

    fn effective_priority(&self, channel: &Channel, health: &HashMap<i64, ChannelHealthStat>) -> f64 {
        let base = channel.priority as f64;
        match health.get(&channel.id) {
            Some(stat) => {
                let confidence = stat.confidence(self.tuning.min_confident_sample);
                base - stat.failure_rate() * self.tuning.penalty_weight * confidence
            }
            None => base,
        }
    }

    /// Places the smooth-weighted-RR winner first in `group`, leaving the
    /// rest in their incoming (priority-sorted) order.
    fn reorder_tie_group(&self, group: &mut Vec<Channel>, effective_key_counts: &HashMap<i64, u32>) {
        let mut ids: Vec<i64> = group.iter().map(|c| c.id).collect();
        ids.sort_unstable();

        let mut groups = self.groups.lock().unwrap();
        let now = Instant::now();
        groups.retain(|_, state| now.duration_since(state.last_used) < self.tuning.group_idle_timeout);

        let state = groups.entry(ids.clone()).or_insert_with(|| GroupState {
            entries: group
                .iter()
                .map(|c| SmoothWeightedEntry {
                    channel_id: c.id,
                    weight: *effective_key_counts.get(&c.id).unwrap_or(&1) as i64,
                    current_weight: 0,
                })
                .collect(),
            last_used: now,
        });
        state.last_used = now;

        // Reconcile membership: a tie group's composition can change
        // between calls (channel enabled/disabled, cooldown flips).
        let mut existing_ids: Vec<i64> = state.entries.iter().map(|e| e.channel_id).collect();
        existing_ids.sort_unstable();
        if existing_ids != ids {
            state.entries = group
                .iter()
                .map(|c| SmoothWeightedEntry {
                    channel_id: c.id,
                    weight: *effective_key_counts.get(&c.id).unwrap_or(&1) as i64,
                    current_weight: 0,
                })
                .collect();
        }

        let total_weight: i64 = state.entries.iter().map(|e| e.weight.max(1)).sum();
        let mut winner_idx = 0;
        let mut winner_weight = i64::MIN;
        for (idx, entry) in state.entries.iter_mut().enumerate() {
            entry.current_weight += entry.weight.max(1);
            if entry.current_weight > winner_weight {
                winner_weight = entry.current_weight;
                winner_idx = idx;
            }
        }
        state.entries[winner_idx].current_weight -= total_weight;
        let winner_id = state.entries[winner_idx].channel_id;

        if let Some(pos) = group.iter().position(|c| c.id == winner_id) {
            let winner = group.remove(pos);
            group.insert(0, winner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_common::{ChannelType, KeyStrategy};
    use std::collections::HashMap as Map;

    fn channel(id: i64, priority: i32) -> Channel {
        Channel {
            id,
            name: format!("chan-{id}"),
            base_url: "https://api.example.com".into(),
            channel_type: ChannelType::Anthropic,
            models: vec!["claude-3-opus".into()],
            model_redirects: Map::new(),
            key_strategy: KeyStrategy::Sequential,
            priority,
            enabled: true,
        }
    }

    #[test]
    fn higher_priority_channel_sorts_first() {
        let selector = ChannelSelector::new(SelectorTuning::default());
        let candidates = vec![channel(1, 5), channel(2, 10)];
        let health = Map::new();
        let weights = Map::new();
        let ordered = selector.order(candidates, &health, &weights);
        assert_eq!(ordered[0].id, 2);
    }

    #[test]
    fn failure_rate_lowers_effective_priority_below_healthy_peer() {
        let selector = ChannelSelector::new(SelectorTuning::default());
        let candidates = vec![channel(1, 10), channel(2, 10)];
        let mut health = Map::new();
        health.insert(
            1,
            ChannelHealthStat {
                success_count: 0,
                failure_count: 100,
            },
        );
        let weights = Map::new();
        let ordered = selector.order(candidates, &health, &weights);
        assert_eq!(ordered[0].id, 2);
    }

    #[test]
    fn smooth_weighted_rr_converges_to_weight_share() {
        let selector = ChannelSelector::new(SelectorTuning::default());
        let mut weights = Map::new();
        weights.insert(1, 3u32);
        weights.insert(2, 1u32);

        let mut wins = Map::new();
        for _ in 0..400 {
            let candidates = vec![channel(1, 10), channel(2, 10)];
            let health = Map::new();
            let ordered = selector.order(candidates, &health, &weights);
            *wins.entry(ordered[0].id).or_insert(0) += 1;
        }
        let share_1 = wins[&1] as f64 / 400.0;
        // weight 3:1 => ~75% of picks go to channel 1.
        assert!((share_1 - 0.75).abs() < 0.05, "share_1 = {share_1}");
    }
}
