//! Derives the display list from the source list.
//!
//! [`compute_display_list`] is pure: the same source, criteria, mode and seed
//! always produce the same output, and the source slice is never touched.
//! Randomness only enters through the seed held by [`DisplayState`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::media::{self, MediaType};
use crate::model::Post;

const DAY_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DateRange {
    #[default]
    All,
    Week,
    Month,
    Year,
}

impl DateRange {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(DateRange::All),
            "week" => Some(DateRange::Week),
            "month" => Some(DateRange::Month),
            "year" => Some(DateRange::Year),
            _ => None,
        }
    }

    /// Oldest `createdAt` (epoch seconds) that still passes, or `None` for `all`.
    pub fn cutoff(&self, now: i64) -> Option<i64> {
        let days = match self {
            DateRange::All => return None,
            DateRange::Week => 7,
            DateRange::Month => 30,
            DateRange::Year => 365,
        };
        Some(now - days * DAY_SECS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    #[default]
    Stable,
    Random,
}

/// Conjunction of every active filter. Empty sets mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub media_types: BTreeSet<MediaType>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub date_range: DateRange,
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        self.query.trim().is_empty()
            && self.media_types.is_empty()
            && self.groups.is_empty()
            && self.date_range == DateRange::All
    }

    pub fn matches(&self, post: &Post, now: i64) -> bool {
        let needle = self.query.trim().to_lowercase();
        if !needle.is_empty() {
            let hit = [post.title.as_str(), post.author.as_str(), post.group()]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }

        if !self.media_types.is_empty() {
            match media::classify(post) {
                Some(kind) if self.media_types.contains(&kind) => {}
                _ => return false,
            }
        }

        if !self.groups.is_empty() && !self.groups.contains(post.group()) {
            return false;
        }

        if let Some(cutoff) = self.date_range.cutoff(now) {
            if (post.created_utc as i64) < cutoff {
                return false;
            }
        }

        true
    }
}

pub fn compute_display_list(
    source: &[Arc<Post>],
    criteria: &FilterCriteria,
    mode: OrderMode,
    seed: Option<u64>,
) -> Vec<Arc<Post>> {
    compute_display_list_at(source, criteria, mode, seed, Utc::now().timestamp())
}

pub fn compute_display_list_at(
    source: &[Arc<Post>],
    criteria: &FilterCriteria,
    mode: OrderMode,
    seed: Option<u64>,
    now: i64,
) -> Vec<Arc<Post>> {
    let mut display: Vec<Arc<Post>> = source
        .iter()
        .filter(|post| criteria.matches(post, now))
        .cloned()
        .collect();

    if mode == OrderMode::Random {
        match seed {
            Some(seed) => display.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => display.shuffle(&mut rand::thread_rng()),
        }
    }
    display
}

/// Distinct provenance groups in first-seen order.
pub fn available_groups(source: &[Arc<Post>]) -> Vec<String> {
    let mut seen = HashSet::new();
    source
        .iter()
        .map(|post| post.group())
        .filter(|group| !group.is_empty() && seen.insert(group.to_string()))
        .map(str::to_string)
        .collect()
}

/// Order mode, filter criteria and the shuffle seed for one session.
///
/// In random mode the source is laid out in blocks: everything present when
/// the seed was drawn forms the first block, and each later append forms a
/// block of its own that is shuffled and placed after the earlier ones. Rows
/// already laid out keep their order when pages arrive; only a reshuffle or a
/// mode switch redraws the whole list.
#[derive(Debug, Clone)]
pub struct DisplayState {
    mode: OrderMode,
    criteria: FilterCriteria,
    seed: u64,
    block_ends: Vec<usize>,
}

impl DisplayState {
    pub fn new(mode: OrderMode) -> Self {
        Self {
            mode,
            criteria: FilterCriteria::default(),
            seed: rand::thread_rng().gen(),
            block_ends: Vec::new(),
        }
    }

    pub fn mode(&self) -> OrderMode {
        self.mode
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn set_criteria(&mut self, criteria: FilterCriteria) {
        self.criteria = criteria;
    }

    pub fn criteria_mut(&mut self) -> &mut FilterCriteria {
        &mut self.criteria
    }

    /// Switching into random mode draws a fresh permutation; switching back
    /// to stable drops the seed's influence entirely.
    pub fn set_mode(&mut self, mode: OrderMode) {
        if mode == OrderMode::Random && self.mode != OrderMode::Random {
            self.reseed();
        }
        self.mode = mode;
    }

    pub fn toggle_mode(&mut self) -> OrderMode {
        let next = match self.mode {
            OrderMode::Stable => OrderMode::Random,
            OrderMode::Random => OrderMode::Stable,
        };
        self.set_mode(next);
        next
    }

    /// Returns false when not in random mode, where reshuffling is meaningless.
    pub fn reshuffle(&mut self) -> bool {
        if self.mode != OrderMode::Random {
            return false;
        }
        self.reseed();
        true
    }

    fn reseed(&mut self) {
        let mut rng = rand::thread_rng();
        let previous = self.seed;
        loop {
            let next = rng.gen();
            if next != previous {
                self.seed = next;
                break;
            }
        }
        self.block_ends.clear();
    }

    /// Forgets the block layout; the next compute shuffles the whole source
    /// as one block. Used when the source list is replaced.
    pub fn reset_layout(&mut self) {
        self.block_ends.clear();
    }

    pub fn compute(&mut self, source: &[Arc<Post>]) -> Vec<Arc<Post>> {
        if self.mode == OrderMode::Stable {
            return compute_display_list(source, &self.criteria, OrderMode::Stable, None);
        }
        self.block_ends.retain(|&end| end <= source.len());
        if self.block_ends.last().copied().unwrap_or(0) < source.len() {
            self.block_ends.push(source.len());
        }
        let ordered = shuffle_in_blocks(source, self.seed, &self.block_ends);
        compute_display_list(&ordered, &self.criteria, OrderMode::Stable, None)
    }
}

fn shuffle_in_blocks(source: &[Arc<Post>], seed: u64, ends: &[usize]) -> Vec<Arc<Post>> {
    let mut ordered = Vec::with_capacity(source.len());
    let mut start = 0;
    for (index, &end) in ends.iter().enumerate() {
        let mut block = source[start..end].to_vec();
        block.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(index as u64)));
        ordered.extend(block);
        start = end;
    }
    ordered
}

/// Coalesces rapid recompute requests. Each request supersedes the previous
/// one and only the most recent generation is ever handed out. The deadline
/// is set by the first unapplied request, so steady input cannot postpone the
/// recompute past `delay`.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    generation: u64,
    due: Option<(u64, Instant)>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: 0,
            due: None,
        }
    }

    pub fn request(&mut self, now: Instant) -> u64 {
        self.generation += 1;
        let at = match self.due {
            Some((_, at)) => at,
            None => now + self.delay,
        };
        self.due = Some((self.generation, at));
        self.generation
    }

    pub fn is_pending(&self) -> bool {
        self.due.is_some()
    }

    pub fn take_due(&mut self, now: Instant) -> Option<u64> {
        match self.due {
            Some((generation, at)) if at <= now => {
                self.due = None;
                Some(generation)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn record(id: &str, created: i64, url: &str, group: &str) -> Arc<Post> {
        Arc::new(Post {
            id: id.into(),
            title: format!("Post {id}"),
            author: format!("author_{id}"),
            subreddit: group.into(),
            url: url.into(),
            created_utc: created as f64,
            ..Post::default()
        })
    }

    fn ids(list: &[Arc<Post>]) -> Vec<&str> {
        list.iter().map(|p| p.id.as_str()).collect()
    }

    fn sample() -> Vec<Arc<Post>> {
        vec![
            record("A", 100, "https://i.redd.it/a.jpg", "pics"),
            record("B", 200, "https://v.redd.it/b.mp4", "videos"),
            record("C", 50, "https://i.redd.it/c.gif", "gifs"),
        ]
    }

    #[test]
    fn media_type_filter_keeps_relative_order() {
        let criteria = FilterCriteria {
            media_types: [MediaType::Image, MediaType::Video].into_iter().collect(),
            ..FilterCriteria::default()
        };
        let out = compute_display_list_at(&sample(), &criteria, OrderMode::Stable, None, NOW);
        assert_eq!(ids(&out), vec!["A", "B"]);
    }

    #[test]
    fn stable_mode_is_idempotent() {
        let source = sample();
        let criteria = FilterCriteria::default();
        let first = compute_display_list_at(&source, &criteria, OrderMode::Stable, None, NOW);
        let second = compute_display_list_at(&source, &criteria, OrderMode::Stable, None, NOW);
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(ids(&first), vec!["A", "B", "C"]);
    }

    #[test]
    fn query_matches_title_author_and_group() {
        let source = sample();
        let by_group = FilterCriteria {
            query: "VIDEOS".into(),
            ..FilterCriteria::default()
        };
        let out = compute_display_list_at(&source, &by_group, OrderMode::Stable, None, NOW);
        assert_eq!(ids(&out), vec!["B"]);

        let by_author = FilterCriteria {
            query: "author_c".into(),
            ..FilterCriteria::default()
        };
        let out = compute_display_list_at(&source, &by_author, OrderMode::Stable, None, NOW);
        assert_eq!(ids(&out), vec!["C"]);
    }

    #[test]
    fn group_and_date_filters_conjoin() {
        let source = vec![
            record("old", NOW - 40 * DAY_SECS, "https://i.redd.it/o.png", "pics"),
            record("new", NOW - 2 * DAY_SECS, "https://i.redd.it/n.png", "pics"),
            record("other", NOW - 2 * DAY_SECS, "https://i.redd.it/x.png", "art"),
        ];
        let criteria = FilterCriteria {
            groups: ["pics".to_string()].into_iter().collect(),
            date_range: DateRange::Month,
            ..FilterCriteria::default()
        };
        let out = compute_display_list_at(&source, &criteria, OrderMode::Stable, None, NOW);
        assert_eq!(ids(&out), vec!["new"]);
    }

    #[test]
    fn random_mode_never_mutates_source() {
        let source = sample();
        let before = ids(&source).join(",");
        let out = compute_display_list_at(
            &source,
            &FilterCriteria::default(),
            OrderMode::Random,
            Some(7),
            NOW,
        );
        assert_eq!(ids(&source).join(","), before);
        let mut sorted = ids(&out);
        sorted.sort();
        assert_eq!(sorted, vec!["A", "B", "C"]);
    }

    #[test]
    fn same_seed_same_permutation() {
        let source: Vec<_> = (0..20)
            .map(|i| record(&i.to_string(), 0, "https://i.redd.it/x.png", "g"))
            .collect();
        let criteria = FilterCriteria::default();
        let a = compute_display_list_at(&source, &criteria, OrderMode::Random, Some(42), NOW);
        let b = compute_display_list_at(&source, &criteria, OrderMode::Random, Some(42), NOW);
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn shuffle_positions_are_roughly_uniform() {
        let source: Vec<_> = (0..4)
            .map(|i| record(&i.to_string(), 0, "https://i.redd.it/x.png", "g"))
            .collect();
        let criteria = FilterCriteria::default();
        let trials = 8000u64;
        let mut counts = [[0u32; 4]; 4];
        for seed in 0..trials {
            let out = compute_display_list_at(&source, &criteria, OrderMode::Random, Some(seed), NOW);
            for (pos, post) in out.iter().enumerate() {
                let idx: usize = post.id.parse().unwrap();
                counts[idx][pos] += 1;
            }
        }
        let expected = trials as f64 / 4.0;
        for row in counts {
            for count in row {
                let deviation = (count as f64 - expected).abs() / expected;
                assert!(deviation < 0.1, "position count {count} too far from {expected}");
            }
        }
    }

    #[test]
    fn reshuffle_draws_new_seed_only_in_random_mode() {
        let mut state = DisplayState::new(OrderMode::Stable);
        let seed = state.seed();
        assert!(!state.reshuffle());
        assert_eq!(state.seed(), seed);

        state.set_mode(OrderMode::Random);
        let seed = state.seed();
        assert!(state.reshuffle());
        assert_ne!(state.seed(), seed);
    }

    #[test]
    fn toggling_back_to_stable_restores_source_order() {
        let source: Vec<_> = (0..10)
            .map(|i| record(&i.to_string(), 0, "https://i.redd.it/x.png", "g"))
            .collect();
        let mut state = DisplayState::new(OrderMode::Random);
        let _ = state.compute(&source);
        assert_eq!(state.toggle_mode(), OrderMode::Stable);
        assert_eq!(ids(&state.compute(&source)), ids(&source));
    }

    #[test]
    fn available_groups_first_seen_order() {
        let mut source = sample();
        source.push(record("D", 0, "https://i.redd.it/d.png", "pics"));
        assert_eq!(available_groups(&source), vec!["pics", "videos", "gifs"]);
    }

    #[test]
    fn debounce_last_request_wins() {
        let start = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(100));
        let first = debounce.request(start);
        let second = debounce.request(start + Duration::from_millis(50));
        assert_ne!(first, second);
        assert_eq!(debounce.take_due(start + Duration::from_millis(90)), None);
        assert_eq!(
            debounce.take_due(start + Duration::from_millis(100)),
            Some(second)
        );
        assert!(!debounce.is_pending());
    }

    #[test]
    fn steady_requests_still_apply_within_delay() {
        let start = Instant::now();
        let delay = Duration::from_millis(100);
        let mut debounce = Debounce::new(delay);
        let mut applied = Vec::new();
        for step in 0..20u64 {
            let now = start + Duration::from_millis(step * 50);
            debounce.request(now);
            if let Some(due) = debounce.take_due(now) {
                applied.push((step, due));
            }
        }
        // The first request is due at 100ms, where request #3 is the latest.
        assert_eq!(applied.first(), Some(&(2, 3)));
        for pair in applied.windows(2) {
            let gap = Duration::from_millis((pair[1].0 - pair[0].0) * 50);
            assert!(gap <= delay + Duration::from_millis(50), "gap {gap:?}");
        }
    }

    #[test]
    fn append_keeps_laid_out_rows_in_place() {
        let mut source: Vec<_> = (0..10)
            .map(|i| record(&format!("p{i}"), 0, "https://i.redd.it/x.png", "g"))
            .collect();
        let mut state = DisplayState::new(OrderMode::Random);
        let before: Vec<String> = ids(&state.compute(&source))
            .into_iter()
            .map(str::to_string)
            .collect();

        source.push(record("q0", 0, "https://i.redd.it/q.png", "g"));
        source.push(record("q1", 0, "https://i.redd.it/q.png", "g"));
        let after = state.compute(&source);
        assert_eq!(ids(&after[..10]), before);
        let mut tail = ids(&after[10..]);
        tail.sort();
        assert_eq!(tail, vec!["q0", "q1"]);

        assert!(state.reshuffle());
        let redrawn = state.compute(&source);
        assert_eq!(redrawn.len(), 12);
    }
}
