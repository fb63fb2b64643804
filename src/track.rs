//! Metadata side channel. The device echoes back one opaque 64-bit value
//! per buffer and nothing else, so caller metadata rides in a ring indexed
//! by a synthetic key carried through that field.

use log::{debug, warn};

/// Default ring depth; must stay at least twice the in-flight buffer count
/// or deep pipelines can alias keys.
pub const DEFAULT_TRACK_ENTRIES: usize = 128;

/// Caller-supplied per-payload metadata carried across the device round
/// trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub pos: i64,
    /// Opaque caller token, returned untouched.
    pub opaque: u64,
}

#[derive(Clone, Copy, Default)]
struct TrackEl {
    key: u64,
    meta: Meta,
    discard: bool,
}

/// Outcome of resolving a completion's echoed key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The slot still held this key; exact metadata recovered.
    Exact(Meta),
    /// The slot was overwritten by a later submission. The returned
    /// metadata is a degraded best effort: last known duration and DTS
    /// carried forward, precise PTS dropped.
    Mismatch(Meta),
    /// The entry was invalidated by a flush; the frame must be dropped,
    /// never delivered with stale metadata.
    Discarded,
}

pub struct MetadataTracker {
    els: Vec<TrackEl>,
    next_key: u64,
    last_dts: Option<i64>,
    last_duration: i64,
    last_opaque: u64,
}

impl MetadataTracker {
    pub fn new(entries: usize) -> Self {
        assert!(entries > 0);
        MetadataTracker {
            els: vec![TrackEl::default(); entries],
            next_key: 0,
            last_dts: None,
            last_duration: 0,
            last_opaque: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.els.len()
    }

    /// Stores `meta` and returns the key to embed in the device timestamp
    /// field. Keys increase monotonically and skip the reserved value 0.
    pub fn add(&mut self, meta: Meta) -> u64 {
        self.next_key = self.next_key.wrapping_add(1);
        if self.next_key == 0 {
            self.next_key = 1;
        }
        let key = self.next_key;
        let n = (key % self.els.len() as u64) as usize;
        if self.els[n].key != 0 && !self.els[n].discard {
            // An undelivered entry is being overwritten: the ring is
            // shallower than the in-flight depth. Worth reporting, the
            // eventual completion will degrade to Mismatch.
            warn!("metadata ring overwrite at {n}, key {}", self.els[n].key);
        }
        self.els[n] = TrackEl { key, meta, discard: false };
        key
    }

    /// Resolves an echoed key. Only an entry whose stored key still matches
    /// is trusted; anything else fails closed.
    pub fn lookup(&mut self, key: u64) -> Lookup {
        if key == 0 {
            // Reserved value; a device echoing it never carried our key.
            warn!("completion without a tracking key");
            return Lookup::Mismatch(self.degraded());
        }
        let n = (key % self.els.len() as u64) as usize;
        let el = &mut self.els[n];

        if el.key != key {
            warn!("metadata mismatch: key {key} at slot {n} holds {}", el.key);
            return Lookup::Mismatch(self.degraded());
        }
        if el.discard {
            debug!("discarding flushed completion, key {key}");
            el.key = 0;
            return Lookup::Discarded;
        }

        let meta = el.meta;
        el.key = 0;
        self.last_duration = meta.duration;
        self.last_dts = meta.dts.map(|d| d.wrapping_add(meta.duration));
        self.last_opaque = meta.opaque;
        Lookup::Exact(meta)
    }

    /// Forgets an entry whose submission never reached the device.
    pub fn cancel(&mut self, key: u64) {
        let n = (key % self.els.len() as u64) as usize;
        if self.els[n].key == key {
            self.els[n].key = 0;
        }
    }

    fn degraded(&self) -> Meta {
        Meta {
            pts: None,
            dts: self.last_dts,
            duration: self.last_duration,
            pos: -1,
            opaque: self.last_opaque,
        }
    }

    /// Flags every live entry so completions for pre-flush submissions are
    /// recognized as stale and dropped.
    pub fn discard_all(&mut self) {
        for el in &mut self.els {
            if el.key != 0 {
                el.discard = true;
            }
        }
        self.last_dts = None;
        self.last_duration = 0;
    }
}

/// Interval-based timestamp guesser for streams whose exact PTS got lost
/// to a ring mismatch: remembers the last seen PTS and the distance since,
/// and extrapolates.
pub struct PtsStats {
    last_pts: Option<i64>,
    last_interval: i64,
    since_last: i64,
}

impl PtsStats {
    pub fn new() -> Self {
        PtsStats { last_pts: None, last_interval: 0, since_last: 0 }
    }

    pub fn add(&mut self, pts: Option<i64>) {
        match pts {
            None => self.since_last += 1,
            Some(p) => {
                if let Some(last) = self.last_pts {
                    let gap = self.since_last + 1;
                    if gap > 0 && p > last {
                        self.last_interval = (p - last) / gap;
                    }
                }
                self.last_pts = Some(p);
                self.since_last = 0;
            }
        }
    }

    /// Best-effort PTS for the frame just added.
    pub fn guess(&self) -> Option<i64> {
        let last = self.last_pts?;
        Some(last + self.since_last * self.last_interval)
    }
}

impl Default for PtsStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pts: i64) -> Meta {
        Meta { pts: Some(pts), dts: Some(pts - 2), duration: 40, pos: pts * 100, opaque: pts as u64 }
    }

    #[test]
    fn recent_keys_resolve_exactly() {
        let mut t = MetadataTracker::new(16);
        let keys: Vec<_> = (0..8).map(|i| t.add(meta(i * 40))).collect();
        for (i, key) in keys.iter().enumerate().rev().take(4) {
            assert_eq!(t.lookup(*key), Lookup::Exact(meta(i as i64 * 40)));
        }
    }

    #[test]
    fn keys_skip_zero_and_stay_monotonic() {
        let mut t = MetadataTracker::new(4);
        t.next_key = u64::MAX;
        let a = t.add(meta(0));
        assert_eq!(a, 1);
        let b = t.add(meta(1));
        assert_eq!(b, 2);
    }

    #[test]
    fn evicted_key_reports_mismatch_not_stale_data() {
        let mut t = MetadataTracker::new(4);
        let old = t.add(meta(0));
        for i in 1..5 {
            t.add(meta(i * 40));
        }
        match t.lookup(old) {
            Lookup::Mismatch(m) => assert_eq!(m.pts, None),
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn mismatch_carries_last_known_duration_and_dts() {
        let mut t = MetadataTracker::new(4);
        let good = t.add(meta(40));
        assert!(matches!(t.lookup(good), Lookup::Exact(_)));
        let old = t.add(meta(80));
        for i in 0..4 {
            t.add(meta(200 + i));
        }
        match t.lookup(old) {
            Lookup::Mismatch(m) => {
                assert_eq!(m.duration, 40);
                assert_eq!(m.dts, Some(78)); // 38 + duration
                assert_eq!(m.pts, None);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn reserved_key_zero_fails_closed() {
        let mut t = MetadataTracker::new(8);
        assert!(matches!(t.lookup(0), Lookup::Mismatch(_)));
    }

    #[test]
    fn flush_discards_in_flight_entries() {
        let mut t = MetadataTracker::new(8);
        let key = t.add(meta(0));
        t.discard_all();
        assert_eq!(t.lookup(key), Lookup::Discarded);
        // The slot is consumed by the discarded lookup; a second resolve
        // of the same key no longer matches.
        assert!(matches!(t.lookup(key), Lookup::Mismatch(_)));
    }

    #[test]
    fn post_flush_submissions_are_live_again() {
        let mut t = MetadataTracker::new(8);
        t.add(meta(0));
        t.discard_all();
        let key = t.add(meta(40));
        assert_eq!(t.lookup(key), Lookup::Exact(meta(40)));
    }

    #[test]
    fn pts_stats_extrapolates_over_gaps() {
        let mut s = PtsStats::new();
        s.add(Some(0));
        s.add(Some(40));
        assert_eq!(s.guess(), Some(40));
        s.add(None);
        assert_eq!(s.guess(), Some(80));
        s.add(None);
        assert_eq!(s.guess(), Some(120));
        s.add(Some(160));
        assert_eq!(s.guess(), Some(160));
    }
}
