use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StreakError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct GroupId(pub u8);

impl GroupId {
    pub const NEUTRAL: Self = Self(0);

    #[must_use]
    pub fn is_neutral(self) -> bool {
        self == Self::NEUTRAL
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreakRuleset {
    pub ruleset_version: u32,
    pub min_streak: usize,
    pub window_size: usize,
    pub max_history: usize,
    pub display_limit: usize,
    pub groups: BTreeMap<u8, BTreeSet<u32>>,
}

impl StreakRuleset {
    #[must_use]
    pub fn v1() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            1,
            [1, 2, 3, 4, 5, 6, 16, 17, 18, 19, 20, 21, 25, 26, 27, 34, 35, 36]
                .into_iter()
                .collect(),
        );
        groups.insert(
            2,
            [7, 8, 9, 10, 11, 12, 13, 14, 15, 22, 23, 24, 28, 29, 30, 31, 32, 33]
                .into_iter()
                .collect(),
        );

        Self {
            ruleset_version: 1,
            min_streak: 5,
            window_size: 200,
            max_history: 1000,
            display_limit: 200,
            groups,
        }
    }

    /// Validates thresholds, capacities and the group partition.
    ///
    /// # Errors
    /// Returns [`StreakError::Configuration`] when a bound is zero or the
    /// group value sets are empty, overlapping or keyed by the neutral id.
    pub fn validate(&self) -> Result<(), StreakError> {
        if self.ruleset_version == 0 {
            return Err(StreakError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("min_streak", self.min_streak),
            ("window_size", self.window_size),
            ("max_history", self.max_history),
            ("display_limit", self.display_limit),
        ] {
            if value == 0 {
                return Err(StreakError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        if self.min_streak > self.window_size {
            return Err(StreakError::Configuration(
                "min_streak MUST be <= window_size".to_string(),
            ));
        }

        CategoryClassifier::new(&self.groups).map(|_| ())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`StreakError::Configuration`] when JSON decoding fails
    /// or decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, StreakError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            StreakError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

/// Maps raw outcome values onto streak groups.
///
/// Values outside every configured set classify as [`GroupId::NEUTRAL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryClassifier {
    lookup: BTreeMap<u32, GroupId>,
}

impl CategoryClassifier {
    /// Builds a classifier from disjoint per-group value sets.
    ///
    /// # Errors
    /// Returns [`StreakError::Configuration`] when no group is configured, a
    /// group uses the neutral id, a set is empty, or a value appears in more
    /// than one set.
    pub fn new(groups: &BTreeMap<u8, BTreeSet<u32>>) -> Result<Self, StreakError> {
        if groups.is_empty() {
            return Err(StreakError::Configuration(
                "at least one group MUST be configured".to_string(),
            ));
        }

        let mut lookup = BTreeMap::new();
        for (id, values) in groups {
            let group = GroupId(*id);
            if group.is_neutral() {
                return Err(StreakError::Configuration(
                    "group id 0 is reserved for neutral outcomes".to_string(),
                ));
            }
            if values.is_empty() {
                return Err(StreakError::Configuration(format!(
                    "group {group} MUST contain at least one value"
                )));
            }
            for value in values {
                if let Some(existing) = lookup.insert(*value, group) {
                    return Err(StreakError::Configuration(format!(
                        "value {value} is assigned to both group {existing} and group {group}"
                    )));
                }
            }
        }

        Ok(Self { lookup })
    }

    /// Builds a classifier from a validated ruleset.
    ///
    /// # Errors
    /// Returns [`StreakError::Configuration`] when the ruleset is invalid.
    pub fn from_ruleset(ruleset: &StreakRuleset) -> Result<Self, StreakError> {
        ruleset.validate()?;
        Self::new(&ruleset.groups)
    }

    #[must_use]
    pub fn classify(&self, value: u32) -> GroupId {
        self.lookup.get(&value).copied().unwrap_or(GroupId::NEUTRAL)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Outcome {
    pub value: u32,
    pub group: GroupId,
}

/// The most recent outcomes, stored oldest to newest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Window {
    outcomes: Vec<Outcome>,
}

impl Window {
    /// Builds a window from the newest-first feed, keeping at most `capacity`
    /// of the newest values.
    #[must_use]
    pub fn from_newest_first(
        values: &[u32],
        capacity: usize,
        classifier: &CategoryClassifier,
    ) -> Self {
        let outcomes = values
            .iter()
            .take(capacity)
            .rev()
            .map(|value| Outcome {
                value: *value,
                group: classifier.classify(*value),
            })
            .collect();
        Self { outcomes }
    }

    #[must_use]
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    #[must_use]
    pub fn newest_index(&self) -> Option<usize> {
        self.outcomes.len().checked_sub(1)
    }

    /// Converts an oldest-first index into the newest-first display position.
    #[must_use]
    pub fn display_position(&self, index: usize) -> usize {
        self.outcomes.len().saturating_sub(index + 1)
    }

    fn run_between(&self, start_index: usize, end_index: usize, group: GroupId) -> Run {
        Run {
            start_index,
            end_index,
            group,
            values: self.outcomes[start_index..=end_index]
                .iter()
                .map(|outcome| outcome.value)
                .collect(),
            active: Some(end_index) == self.newest_index(),
        }
    }
}

/// A contiguous same-group block of a [`Window`], in oldest-first coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    pub start_index: usize,
    pub end_index: usize,
    pub group: GroupId,
    pub values: Vec<u32>,
    pub active: bool,
}

impl Run {
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn key(&self) -> String {
        sequence_key(&self.values)
    }
}

/// Finds every maximal non-neutral run of at least `threshold` outcomes.
///
/// Runs come back ordered by start index and never overlap each other.
#[must_use]
pub fn detect_runs(window: &Window, threshold: usize) -> Vec<Run> {
    let outcomes = window.outcomes();
    let threshold = threshold.max(1);
    let mut runs = Vec::new();
    let mut start = 0;

    while start < outcomes.len() {
        let group = outcomes[start].group;
        if group.is_neutral() {
            start += 1;
            continue;
        }

        let mut end = start + 1;
        while end < outcomes.len() && outcomes[end].group == group {
            end += 1;
        }

        if end - start >= threshold {
            runs.push(window.run_between(start, end - 1, group));
        }
        start = end;
    }

    runs
}

/// Returns the run ending at the newest outcome, of any length.
#[must_use]
pub fn trailing_run(window: &Window) -> Option<Run> {
    let newest = window.newest_index()?;
    let outcomes = window.outcomes();
    let group = outcomes[newest].group;
    if group.is_neutral() {
        return None;
    }

    let mut start = newest;
    while start > 0 && outcomes[start - 1].group == group {
        start -= 1;
    }

    Some(window.run_between(start, newest, group))
}

/// Collapses possibly-overlapping candidates into one longest run per
/// overlap cluster.
///
/// Within a cluster the longest run wins; equal lengths keep the earliest
/// start.
#[must_use]
pub fn select_maximal_runs(mut candidates: Vec<Run>) -> Vec<Run> {
    candidates.sort_by(|lhs, rhs| {
        lhs.start_index
            .cmp(&rhs.start_index)
            .then_with(|| rhs.len().cmp(&lhs.len()))
    });

    let mut selected = Vec::new();
    let mut remaining = candidates.into_iter();
    let Some(mut best) = remaining.next() else {
        return selected;
    };
    let mut cluster_end = best.end_index;

    for run in remaining {
        if run.start_index <= cluster_end {
            cluster_end = cluster_end.max(run.end_index);
            if run.len() > best.len() {
                best = run;
            }
        } else {
            cluster_end = run.end_index;
            selected.push(std::mem::replace(&mut best, run));
        }
    }
    selected.push(best);

    selected
}

/// True when `small` occurs as an exact contiguous block of `big`.
///
/// An empty `small` is never contained.
#[must_use]
pub fn contained(small: &[u32], big: &[u32]) -> bool {
    if small.is_empty() || small.len() > big.len() {
        return false;
    }
    big.windows(small.len()).any(|block| block == small)
}

/// Display form of a sequence: `"1, 2, 3"`.
#[must_use]
pub fn format_sequence(values: &[u32]) -> String {
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Normalized lookup key of a sequence: `"1,2,3"`.
#[must_use]
pub fn sequence_key(values: &[u32]) -> String {
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a comma-separated sequence, ignoring whitespace.
///
/// # Errors
/// Returns [`StreakError::Validation`] when a token is not a non-negative
/// integer.
pub fn parse_sequence(raw: &str) -> Result<Vec<u32>, StreakError> {
    let normalized: String = raw.chars().filter(|ch| !ch.is_whitespace()).collect();
    if normalized.is_empty() {
        return Ok(Vec::new());
    }

    normalized
        .split(',')
        .map(|token| {
            token.parse::<u32>().map_err(|err| {
                StreakError::Validation(format!("invalid sequence value {token:?}: {err}"))
            })
        })
        .collect()
}

fn serialize_sequence<S>(values: &[u32], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_sequence(values))
}

fn deserialize_sequence<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_sequence(&raw).map_err(serde::de::Error::custom)
}

/// A persisted streak. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreakRecord {
    #[serde(
        serialize_with = "serialize_sequence",
        deserialize_with = "deserialize_sequence"
    )]
    pub sequence: Vec<u32>,
    pub group: GroupId,
    pub length: usize,
    #[serde(alias = "startNum")]
    pub start_value: u32,
    #[serde(alias = "endNum")]
    pub end_value: u32,
    #[serde(alias = "ts")]
    pub timestamp: i64,
}

impl StreakRecord {
    #[must_use]
    pub fn from_run(run: &Run, timestamp: i64) -> Self {
        Self {
            sequence: run.values.clone(),
            group: run.group,
            length: run.values.len(),
            start_value: run.values.first().copied().unwrap_or_default(),
            end_value: run.values.last().copied().unwrap_or_default(),
            timestamp,
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        sequence_key(&self.sequence)
    }

    /// Checks that the derived fields agree with the sequence.
    ///
    /// # Errors
    /// Returns [`StreakError::Validation`] for an empty sequence, a neutral
    /// group, or a `length`/`startValue`/`endValue` that disagrees with the
    /// sequence.
    pub fn validate(&self) -> Result<(), StreakError> {
        let (Some(first), Some(last)) = (self.sequence.first(), self.sequence.last()) else {
            return Err(StreakError::Validation(
                "sequence MUST contain at least one value".to_string(),
            ));
        };

        if self.group.is_neutral() {
            return Err(StreakError::Validation(
                "group MUST be a non-neutral id".to_string(),
            ));
        }

        if self.length != self.sequence.len() {
            return Err(StreakError::Validation(format!(
                "length {} does not match sequence of {} values",
                self.length,
                self.sequence.len()
            )));
        }

        if self.start_value != *first || self.end_value != *last {
            return Err(StreakError::Validation(
                "startValue/endValue MUST match the sequence endpoints".to_string(),
            ));
        }

        if self.timestamp < 0 {
            return Err(StreakError::Validation(
                "timestamp MUST be epoch milliseconds >= 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates one persisted record.
    ///
    /// # Errors
    /// Returns [`StreakError::Validation`] when a field is missing, has the
    /// wrong type, or fails [`StreakRecord::validate`].
    pub fn from_json(value: &Value) -> Result<Self, StreakError> {
        let record: Self = serde_json::from_value(value.clone())
            .map_err(|err| StreakError::Validation(format!("invalid streak record: {err}")))?;
        record.validate()?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted {
        group: GroupId,
        key: String,
        superseded: Vec<String>,
        evicted: Vec<String>,
    },
    RejectedDuplicate {
        group: GroupId,
        key: String,
    },
    RejectedContained {
        group: GroupId,
        key: String,
        container: String,
    },
}

impl InsertOutcome {
    #[must_use]
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

/// Newest-first streak history that stays free of duplicates and of
/// same-group records contained in one another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreakHistory {
    records: Vec<StreakRecord>,
    index: HashMap<GroupId, HashSet<String>>,
    max_count: usize,
}

impl StreakHistory {
    #[must_use]
    pub fn new(max_count: usize) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            max_count: max_count.max(1),
        }
    }

    /// Adopts an arbitrary record set, consolidating it and trimming the
    /// oldest records beyond `max_count`.
    #[must_use]
    pub fn from_records(records: &[StreakRecord], max_count: usize) -> Self {
        let mut history = Self::new(max_count);
        let mut consolidated = consolidate_all(records);
        consolidated.truncate(history.max_count);
        for record in &consolidated {
            history.index_insert(record.group, record.key());
        }
        history.records = consolidated;
        history
    }

    #[must_use]
    pub fn records(&self) -> &[StreakRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    #[must_use]
    pub fn contains_key(&self, group: GroupId, key: &str) -> bool {
        self.index
            .get(&group)
            .is_some_and(|keys| keys.contains(key))
    }

    fn index_insert(&mut self, group: GroupId, key: String) {
        self.index.entry(group).or_default().insert(key);
    }

    fn index_remove(&mut self, group: GroupId, key: &str) {
        if let Some(keys) = self.index.get_mut(&group) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(&group);
            }
        }
    }

    /// The newest `limit` records.
    #[must_use]
    pub fn newest(&self, limit: usize) -> &[StreakRecord] {
        &self.records[..self.records.len().min(limit)]
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    /// Records a completed run unless an equal or containing same-group
    /// record already exists.
    ///
    /// Same-group records contained in the new run are superseded; records
    /// beyond `max_count` are evicted from the oldest end.
    ///
    /// # Errors
    /// Returns [`StreakError::Validation`] for an empty run, a neutral run,
    /// or a run that is still active.
    pub fn try_insert(&mut self, run: &Run, timestamp: i64) -> Result<InsertOutcome, StreakError> {
        if run.is_empty() || run.group.is_neutral() {
            return Err(StreakError::Validation(
                "only non-empty, non-neutral runs can be recorded".to_string(),
            ));
        }
        if run.active {
            return Err(StreakError::Validation(
                "an active run cannot be recorded until it completes".to_string(),
            ));
        }

        let group = run.group;
        let key = run.key();
        if self.contains_key(group, &key) {
            return Ok(InsertOutcome::RejectedDuplicate { group, key });
        }

        if let Some(container) = self
            .records
            .iter()
            .find(|record| record.group == group && contained(&run.values, &record.sequence))
        {
            return Ok(InsertOutcome::RejectedContained {
                group,
                key,
                container: container.key(),
            });
        }

        let mut superseded = Vec::new();
        self.records.retain(|record| {
            if record.group == group && contained(&record.sequence, &run.values) {
                superseded.push(record.key());
                false
            } else {
                true
            }
        });
        for removed in &superseded {
            self.index_remove(group, removed);
        }

        self.records.insert(0, StreakRecord::from_run(run, timestamp));
        self.index_insert(group, key.clone());

        let mut evicted = Vec::new();
        while self.records.len() > self.max_count {
            if let Some(oldest) = self.records.pop() {
                let oldest_key = oldest.key();
                self.index_remove(oldest.group, &oldest_key);
                evicted.push(oldest_key);
            }
        }

        Ok(InsertOutcome::Inserted {
            group,
            key,
            superseded,
            evicted,
        })
    }
}

/// Drops duplicate and contained records, keeping the longest per overlap.
///
/// Longer records are considered first within a group (ties: earliest
/// timestamp, then input position). Survivors keep their input order, so a
/// newest-first list stays newest-first and a second pass changes nothing.
#[must_use]
pub fn consolidate_all(records: &[StreakRecord]) -> Vec<StreakRecord> {
    let mut order: Vec<usize> = (0..records.len())
        .filter(|position| !records[*position].sequence.is_empty())
        .collect();
    order.sort_by(|lhs, rhs| {
        let (left, right) = (&records[*lhs], &records[*rhs]);
        left.group
            .cmp(&right.group)
            .then_with(|| right.sequence.len().cmp(&left.sequence.len()))
            .then_with(|| left.timestamp.cmp(&right.timestamp))
            .then_with(|| lhs.cmp(rhs))
    });

    let mut kept_by_group: BTreeMap<GroupId, Vec<usize>> = BTreeMap::new();
    let mut keep = vec![false; records.len()];
    for position in order {
        let record = &records[position];
        let kept = kept_by_group.entry(record.group).or_default();
        if kept
            .iter()
            .any(|other| contained(&record.sequence, &records[*other].sequence))
        {
            continue;
        }
        kept.push(position);
        keep[position] = true;
    }

    records
        .iter()
        .zip(keep)
        .filter_map(|(record, kept)| kept.then(|| record.clone()))
        .collect()
}

/// Compares two histories by count and by per-position group and sequence.
#[must_use]
pub fn same_history(lhs: &[StreakRecord], rhs: &[StreakRecord]) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs)
            .all(|(left, right)| left.group == right.group && left.sequence == right.sequence)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActiveRunEventKind {
    Start,
    Extension,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveRunEvent {
    pub kind: ActiveRunEventKind,
    pub group: GroupId,
    pub length: usize,
    pub values: Vec<u32>,
}

impl ActiveRunEvent {
    fn for_run(kind: ActiveRunEventKind, run: &Run) -> Self {
        Self {
            kind,
            group: run.group,
            length: run.len(),
            values: run.values.clone(),
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        let verb = match self.kind {
            ActiveRunEventKind::Start => "started",
            ActiveRunEventKind::Extension => "extended",
        };
        format!(
            "Group {} streak {verb} \u{d7}{}\n{}",
            self.group,
            self.length,
            format_sequence(&self.values)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RememberedRun {
    group: GroupId,
    start_index: usize,
    end_index: usize,
    length: usize,
    window: Vec<u32>,
    notified_length: Option<usize>,
}

impl RememberedRun {
    fn new(run: &Run, window: Vec<u32>, notified_length: Option<usize>) -> Self {
        Self {
            group: run.group,
            start_index: run.start_index,
            end_index: run.end_index,
            length: run.len(),
            window,
            notified_length,
        }
    }

    /// True when `run` in `window` is this run grown by newer outcomes.
    ///
    /// The remembered start must still be in view at the position the
    /// window shift predicts, or have slid out with `run` starting at the
    /// oldest outcome.
    fn continued_by(&self, window: &[u32], run: &Run) -> bool {
        if run.group != self.group {
            return false;
        }
        let shift = arrival_shift(&self.window, window);
        shift <= self.end_index && run.start_index == self.start_index.saturating_sub(shift)
    }
}

/// Number of outcomes that arrived between two oldest-first snapshots of a
/// capped feed: the smallest shift that lines `previous` up as a prefix of
/// `current`.
fn arrival_shift(previous: &[u32], current: &[u32]) -> usize {
    (0..previous.len())
        .find(|&shift| current.starts_with(&previous[shift..]))
        .unwrap_or(previous.len())
}

/// Edge detector for the run ending at the newest outcome.
///
/// A run is announced once with a `Start` event when it first reaches the
/// threshold, then with an `Extension` event each time it grows past the
/// last announced length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRunTracker {
    threshold: usize,
    remembered: Option<RememberedRun>,
}

impl ActiveRunTracker {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            remembered: None,
        }
    }

    #[must_use]
    pub fn remembered_length(&self) -> Option<usize> {
        self.remembered.as_ref().map(|run| run.length)
    }

    /// Feeds one cycle's window and its trailing run.
    ///
    /// Continuity is judged by position: the window is lined up against the
    /// previous one, so a sliding capped window keeps one run alive and a run
    /// that broke and restarted between cycles is announced afresh.
    pub fn observe(&mut self, window: &Window, trailing: Option<&Run>) -> Option<ActiveRunEvent> {
        let Some(run) = trailing else {
            self.remembered = None;
            return None;
        };

        let values: Vec<u32> = window.outcomes().iter().map(|outcome| outcome.value).collect();
        let continues = self
            .remembered
            .as_ref()
            .is_some_and(|previous| previous.continued_by(&values, run));

        if !continues {
            let announce = run.len() >= self.threshold;
            self.remembered = Some(RememberedRun::new(
                run,
                values,
                announce.then_some(run.len()),
            ));
            return announce.then(|| ActiveRunEvent::for_run(ActiveRunEventKind::Start, run));
        }

        let threshold = self.threshold;
        let previous = self.remembered.as_mut()?;
        let notified_length = previous.notified_length;
        *previous = RememberedRun::new(run, values, notified_length);

        if run.len() < threshold {
            return None;
        }

        match notified_length {
            None => {
                previous.notified_length = Some(run.len());
                Some(ActiveRunEvent::for_run(ActiveRunEventKind::Start, run))
            }
            Some(notified) if run.len() > notified => {
                previous.notified_length = Some(run.len());
                Some(ActiveRunEvent::for_run(ActiveRunEventKind::Extension, run))
            }
            Some(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveRunPayload {
    pub positions: Vec<usize>,
    pub length: usize,
    pub group: GroupId,
}

/// Everything one evaluation cycle derives from a window, before any
/// history or notification side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAnalysis {
    pub runs: Vec<Run>,
    pub completed: Vec<Run>,
    pub highlight_positions: Vec<usize>,
    pub trailing: Option<Run>,
    pub active: Option<ActiveRunPayload>,
}

#[must_use]
pub fn analyze_window(window: &Window, threshold: usize) -> WindowAnalysis {
    let runs = detect_runs(window, threshold);
    let completed = select_maximal_runs(runs.clone())
        .into_iter()
        .filter(|run| !run.active)
        .collect();

    let highlight_positions = runs
        .iter()
        .flat_map(|run| run.start_index..=run.end_index)
        .map(|index| window.display_position(index))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let trailing = trailing_run(window);
    let active = trailing.as_ref().map(|run| ActiveRunPayload {
        positions: (run.start_index..=run.end_index)
            .rev()
            .map(|index| window.display_position(index))
            .collect(),
        length: run.len(),
        group: run.group,
    });

    WindowAnalysis {
        runs,
        completed,
        highlight_positions,
        trailing,
        active,
    }
}

#[must_use]
pub fn now_unix_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

/// Formats epoch milliseconds as an RFC3339 UTC timestamp.
///
/// # Errors
/// Returns [`StreakError::Validation`] when the value is out of range or
/// formatting fails.
pub fn format_unix_ms(timestamp: i64) -> Result<String, StreakError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp) * 1_000_000)
        .map_err(|err| StreakError::Validation(format!("timestamp out of range: {err}")))?
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StreakError::Validation(format!("failed to format timestamp: {err}")))
}
