//! Bounded, expiring set of revoked task ids

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

/// Default maximum number of remembered revokes
pub const DEFAULT_REVOKES_MAX: usize = 50_000;

/// Default lifetime of a revoke entry (3 hours)
pub const DEFAULT_REVOKE_EXPIRES: Duration = Duration::from_secs(3 * 60 * 60);

/// Longest entry lifetime a set keeps; longer expiries are clamped to it
pub const MAX_REVOKE_EXPIRES: Duration = Duration::from_millis(i64::MAX as u64);

/// Current wall time as a [`Timestamp`]
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// The capability the reconciler needs from the host's revoked set
///
/// A bounded collection of task ids, each with a timestamp, that can drop
/// expired entries. Hosts with their own structure implement this; everyone
/// else uses [`RevokedTaskSet`].
pub trait RevocationSet: Send {
    /// Insert or refresh an entry
    fn insert_at(&mut self, task_id: String, timestamp: Timestamp);

    fn contains(&self, task_id: &str) -> bool;

    fn timestamp(&self, task_id: &str) -> Option<Timestamp>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries and enforce the size bound; returns how many were dropped
    fn purge_at(&mut self, now: Timestamp) -> usize;

    /// Copy of the current contents
    fn snapshot(&self) -> RevokedTaskSet;

    /// Merge `other` in, keeping the later timestamp for ids present in both
    ///
    /// Returns the number of ids that were not present before.
    fn union(&mut self, other: &RevokedTaskSet) -> usize {
        let mut added = 0;
        for (task_id, timestamp) in other.iter() {
            match self.timestamp(task_id) {
                Some(existing) if existing >= timestamp => {}
                Some(_) => self.insert_at(task_id.to_string(), timestamp),
                None => {
                    self.insert_at(task_id.to_string(), timestamp);
                    added += 1;
                }
            }
        }
        added
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    timestamp: Timestamp,
    seq: u64,
}

/// Revoked task ids with insertion timestamps
///
/// Membership is a hash lookup. A secondary index ordered by
/// `(timestamp, insertion sequence)` makes evicting the oldest entry cheap.
/// `maxlen == 0` means unbounded; `expires == None` means entries never expire.
#[derive(Debug, Clone)]
pub struct RevokedTaskSet {
    maxlen: usize,
    expires: Option<Duration>,
    slots: HashMap<String, Slot>,
    by_age: BTreeMap<(Timestamp, u64), String>,
    next_seq: u64,
}

impl Default for RevokedTaskSet {
    fn default() -> Self {
        Self::new(DEFAULT_REVOKES_MAX, Some(DEFAULT_REVOKE_EXPIRES))
    }
}

impl PartialEq for RevokedTaskSet {
    fn eq(&self, other: &Self) -> bool {
        self.maxlen == other.maxlen
            && self.expires == other.expires
            && self.slots.len() == other.slots.len()
            && self
                .slots
                .iter()
                .all(|(id, slot)| other.slots.get(id).map(|s| s.timestamp) == Some(slot.timestamp))
    }
}

impl RevokedTaskSet {
    /// `expires` is kept at millisecond precision and clamped to [`MAX_REVOKE_EXPIRES`]
    pub fn new(maxlen: usize, expires: Option<Duration>) -> Self {
        let expires = expires.map(|d| {
            let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(millis).min(MAX_REVOKE_EXPIRES)
        });
        Self {
            maxlen,
            expires,
            slots: HashMap::new(),
            by_age: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// No size bound, no expiry
    pub fn unbounded() -> Self {
        Self::new(0, None)
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    pub fn expires(&self) -> Option<Duration> {
        self.expires
    }

    /// Insert with the current wall time
    pub fn insert(&mut self, task_id: impl Into<String>) {
        self.insert_at(task_id, now_ms());
    }

    /// Insert or refresh an entry, evicting the oldest entries past `maxlen`
    pub fn insert_at(&mut self, task_id: impl Into<String>, timestamp: Timestamp) {
        let task_id = task_id.into();
        if let Some(old) = self.slots.get(&task_id) {
            self.by_age.remove(&(old.timestamp, old.seq));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_age.insert((timestamp, seq), task_id.clone());
        self.slots.insert(task_id, Slot { timestamp, seq });

        self.enforce_maxlen();
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        match self.slots.remove(task_id) {
            Some(slot) => {
                self.by_age.remove(&(slot.timestamp, slot.seq));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.slots.contains_key(task_id)
    }

    pub fn timestamp(&self, task_id: &str) -> Option<Timestamp> {
        self.slots.get(task_id).map(|slot| slot.timestamp)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_age.clear();
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = (&str, Timestamp)> + '_ {
        self.by_age.iter().map(|((timestamp, _), id)| (id.as_str(), *timestamp))
    }

    /// Purge against the current wall time
    pub fn purge(&mut self) -> usize {
        self.purge_at(now_ms())
    }

    /// Drop entries older than `now - expires`, then enforce `maxlen`
    pub fn purge_at(&mut self, now: Timestamp) -> usize {
        let before = self.len();

        if let Some(expires) = self.expires {
            let lifetime = i64::try_from(expires.as_millis()).unwrap_or(i64::MAX);
            let cutoff = now.saturating_sub(lifetime);
            while let Some((&(timestamp, _), _)) = self.by_age.first_key_value() {
                if timestamp >= cutoff {
                    break;
                }
                self.pop_oldest();
            }
        }
        self.enforce_maxlen();

        before - self.len()
    }

    fn enforce_maxlen(&mut self) {
        if self.maxlen == 0 {
            return;
        }
        while self.slots.len() > self.maxlen {
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((_, task_id)) = self.by_age.pop_first() {
            self.slots.remove(&task_id);
        }
    }
}

impl RevocationSet for RevokedTaskSet {
    fn insert_at(&mut self, task_id: String, timestamp: Timestamp) {
        RevokedTaskSet::insert_at(self, task_id, timestamp);
    }

    fn contains(&self, task_id: &str) -> bool {
        RevokedTaskSet::contains(self, task_id)
    }

    fn timestamp(&self, task_id: &str) -> Option<Timestamp> {
        RevokedTaskSet::timestamp(self, task_id)
    }

    fn len(&self) -> usize {
        RevokedTaskSet::len(self)
    }

    fn purge_at(&mut self, now: Timestamp) -> usize {
        RevokedTaskSet::purge_at(self, now)
    }

    fn snapshot(&self) -> RevokedTaskSet {
        self.clone()
    }
}
