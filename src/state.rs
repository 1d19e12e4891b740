use crate::catalog::{Catalog, FieldIndex};
use crate::error::{ConfigError, SamplerError};
use crate::expr;
use crate::series::{Series, SeriesHandle, SeriesSet};
use crate::types::{AdvanceReason, Event, IteratorPosition, SampleClock, Timestamp};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

/// Aggregate state of one time slot.
#[derive(Debug, Clone)]
pub struct Bucket {
    values: Vec<Option<f64>>,
    /// `0` means no event arrived this cycle; forward-fill keys off it.
    event_count: u64,
    start_time: Option<Timestamp>,
    index: Arc<FieldIndex>,
}

impl Bucket {
    fn blank(index: &Arc<FieldIndex>) -> Self {
        Self {
            values: vec![None; index.len()],
            event_count: 0,
            start_time: None,
            index: Arc::clone(index),
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.index.slot(name).and_then(|slot| self.get_slot(slot))
    }

    #[inline]
    pub fn get_slot(&self, slot: usize) -> Option<f64> {
        self.values.get(slot).copied().flatten()
    }

    #[inline]
    pub(crate) fn set_slot(&mut self, slot: usize, value: Option<f64>) {
        self.values[slot] = value;
    }

    #[inline]
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    #[inline]
    pub fn start_time(&self) -> Option<Timestamp> {
        self.start_time
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    #[inline]
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    #[inline]
    pub fn field_names(&self) -> &[String] {
        self.index.names()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.index
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Re-lays values out for a new field index, keeping values by name.
    fn rebind(&mut self, index: &Arc<FieldIndex>) {
        self.values = index.names().iter().map(|name| self.get(name)).collect();
        self.index = Arc::clone(index);
    }
}

/// Fixed-capacity circular array of buckets for one track.
///
/// `cursor` always points at the accumulating bucket. Capacity is fixed at
/// construction; buckets are allocated once and reset in place.
#[derive(Debug)]
pub struct RingBuffer {
    buckets: Vec<Bucket>,
    cursor: usize,
    total_advances: u64,
    last_boundary_time: Option<Timestamp>,
    catalog: Arc<Catalog>,
    clock: SampleClock,
    series: Vec<OnceLock<SeriesHandle>>,
    // Rollback snapshot for the aggregation pass, reused across events.
    scratch: Vec<Option<f64>>,
}

impl RingBuffer {
    pub fn new(
        capacity: usize,
        catalog: Arc<Catalog>,
        clock: SampleClock,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroBufferLength);
        }
        let index = Arc::clone(catalog.index());
        Ok(Self {
            buckets: (0..capacity).map(|_| Bucket::blank(&index)).collect(),
            cursor: 0,
            total_advances: 0,
            last_boundary_time: None,
            series: (0..index.len()).map(|_| OnceLock::new()).collect(),
            scratch: Vec::with_capacity(index.len()),
            catalog,
            clock,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn total_advances(&self) -> u64 {
        self.total_advances
    }

    #[inline]
    pub fn last_boundary_time(&self) -> Option<Timestamp> {
        self.last_boundary_time
    }

    #[inline]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    #[inline]
    pub fn clock(&self) -> &SampleClock {
        &self.clock
    }

    /// Raw bucket array in physical order.
    #[inline]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    #[inline]
    pub fn current(&self) -> &Bucket {
        &self.buckets[self.cursor]
    }

    #[inline]
    pub(crate) fn current_mut(&mut self) -> &mut Bucket {
        &mut self.buckets[self.cursor]
    }

    /// Physical index of the bucket `offset` slots away from the cursor.
    #[inline]
    pub fn index_for(&self, offset: i64) -> usize {
        let cap = self.buckets.len() as i64;
        (self.cursor as i64 + offset).rem_euclid(cap) as usize
    }

    #[inline]
    pub fn get(&self, offset: i64) -> &Bucket {
        &self.buckets[self.index_for(offset)]
    }

    /// Buckets reachable from `offset`, capped once the ring has wrapped.
    #[inline]
    pub fn available_length(&self, offset: i64) -> usize {
        let filled = (self.buckets.len() as u64).min(self.total_advances.saturating_add(1));
        filled.saturating_sub(offset.unsigned_abs()) as usize
    }

    /// Most-recent-first traversal starting `|offset|` slots behind the cursor.
    pub fn backward(&self, offset: i64, limit: Option<usize>) -> Backward<'_> {
        let skip = offset.unsigned_abs() as usize;
        let cap = self.buckets.len();
        let bound = cap.saturating_sub(skip);
        Backward {
            buffer: self,
            index: self.index_for(-(skip.min(cap) as i64)),
            skip,
            ordinal: 0,
            remaining: limit.map_or(bound, |limit| limit.min(bound)),
        }
    }

    /// Oldest-to-newest traversal ending at the cursor.
    pub fn forward(&self, limit: Option<usize>) -> Forward<'_> {
        let cap = self.buckets.len();
        Forward {
            buffer: self,
            ordinal: 0,
            remaining: limit.map_or(cap, |limit| limit.min(cap)),
        }
    }

    /// Cached query handle for a stored field.
    pub fn series(&self, field: &str) -> Option<Series<'_>> {
        let slot = self.catalog.slot(field)?;
        let handle = self.series[slot].get_or_init(|| SeriesHandle::new(field, slot));
        Some(Series::new(handle, self))
    }

    pub fn series_set(&self) -> SeriesSet<'_> {
        SeriesSet::new(self)
    }

    /// Closes the current bucket and moves the cursor forward.
    pub fn advance(&mut self, reason: AdvanceReason) {
        let outgoing = self.cursor;
        let outgoing_start = self.buckets[outgoing].start_time;

        if self.buckets[outgoing].event_count == 0 {
            let previous = self.index_for(-1);
            if self.buckets[previous].event_count > 0 {
                self.forward_fill(outgoing, previous);
            }
        }

        self.total_advances += 1;
        self.cursor = (self.cursor + 1) % self.buckets.len();
        self.reset_current(outgoing);

        let start = outgoing_start.map(|t| t.saturating_add(self.clock.interval()));
        let time_slot = self.catalog.slot(self.clock.time_key());
        let current = &mut self.buckets[self.cursor];
        current.start_time = start;
        if let Some(slot) = time_slot {
            current.set_slot(slot, start.map(|t| t as f64));
        }

        trace!(
            reason = reason.as_str(),
            cursor = self.cursor,
            total_advances = self.total_advances,
            "advanced bucket"
        );
    }

    // Filled buckets count as having data so the next empty bucket chains off them.
    fn forward_fill(&mut self, target: usize, source: usize) {
        let catalog = Arc::clone(&self.catalog);
        for &slot in catalog.fill_slots() {
            if let Some(value) = catalog.public()[slot].fill(&self.buckets[source]) {
                self.buckets[target].set_slot(slot, value);
            }
        }
        self.buckets[target].event_count = 1;
    }

    // Blank template: everything cleared except cumulative fields, which carry
    // over from the bucket just closed.
    fn reset_current(&mut self, outgoing: usize) {
        let catalog = Arc::clone(&self.catalog);
        self.scratch.clear();
        self.scratch.extend(
            catalog
                .cumulative_slots()
                .iter()
                .map(|&slot| self.buckets[outgoing].get_slot(slot)),
        );

        let current = &mut self.buckets[self.cursor];
        current.values.fill(None);
        current.event_count = 0;
        current.start_time = None;
        for (&slot, &value) in catalog.cumulative_slots().iter().zip(self.scratch.iter()) {
            current.set_slot(slot, value);
        }
    }

    /// Inserts the advances a live timer would have produced since the last
    /// recorded boundary.
    ///
    /// Runs one full advance per missed boundary, so the cost grows with
    /// `(now - last_boundary) / interval` and not with capacity. A gap far
    /// wider than the ring still cycles through every boundary.
    pub fn fill_missing_samples(&mut self, now: Timestamp) -> Result<(), SamplerError> {
        let interval = self.clock.interval();
        if interval <= 0 {
            return Ok(());
        }
        let Some(last) = self.last_boundary_time else {
            return Ok(());
        };
        let elapsed = now
            .checked_sub(last)
            .ok_or(SamplerError::TimeOutOfRange { time: now })?;
        let missing = elapsed
            .div_euclid(interval)
            .saturating_sub(self.clock.natural_skip());
        if missing <= 0 {
            return Ok(());
        }
        if missing as u64 > self.buckets.len() as u64 {
            warn!(
                missing,
                capacity = self.buckets.len(),
                last_boundary = last,
                now,
                "gap spans more boundaries than the ring holds"
            );
        } else {
            debug!(missing, last_boundary = last, now, "gap-filling buckets");
        }
        let mut boundary = last;
        for _ in 0..missing {
            boundary += interval;
            self.advance(AdvanceReason::GapFill);
            self.last_boundary_time = Some(boundary);
        }
        Ok(())
    }

    /// One aggregation pass. Either fully applies or leaves the bucket untouched.
    /// Only the current bucket is restored on failure: boundary bookkeeping and
    /// gap-fill advances done by the caller beforehand stay committed.
    pub(crate) fn collect(
        &mut self,
        event: &mut Event,
        sample_time: Timestamp,
    ) -> Result<(), SamplerError> {
        let catalog = Arc::clone(&self.catalog);
        let idx = self.cursor;
        let saved_count = self.buckets[idx].event_count;
        let saved_start = self.buckets[idx].start_time;
        self.scratch.clear();
        self.scratch.extend_from_slice(&self.buckets[idx].values);

        let time_key = self.clock.time_key();
        if event.contains(time_key) || catalog.slot(time_key).is_some() {
            event.set_number(time_key, sample_time as f64);
        }

        let per_event = self.clock.interval() == 0;
        let bucket = &mut self.buckets[idx];
        bucket.event_count += 1;
        if bucket.start_time.is_none() || per_event {
            bucket.start_time = Some(sample_time);
        }

        for spec in catalog.hidden() {
            let _ = spec.accumulate(event, None, &self.buckets[idx]);
        }
        for (slot, spec) in catalog.public().iter().enumerate() {
            let bucket = &self.buckets[idx];
            if let Some(value) = spec.accumulate(event, bucket.get_slot(slot), bucket) {
                self.buckets[idx].set_slot(slot, Some(value));
            }
        }

        if let Err(err) = expr::evaluate(self) {
            let bucket = &mut self.buckets[idx];
            bucket.values.copy_from_slice(&self.scratch);
            bucket.event_count = saved_count;
            bucket.start_time = saved_start;
            return Err(err);
        }
        Ok(())
    }

    /// Live path. Advancing is left to the timer unless every event is its own
    /// bucket; with the timer suppressed, due gaps are filled first.
    ///
    /// A rejected event (failing expression) still leaves behind the first
    /// boundary it recorded and any gap-fill advances it triggered.
    pub fn capture(&mut self, mut event: Event, time: Option<Timestamp>) -> Result<(), SamplerError> {
        let sample_time = self.sample_time(self.event_time(&event, time)?)?;

        if self.last_boundary_time.is_none() {
            self.last_boundary_time = Some(sample_time);
        }
        if self.clock.interval() > 0 && self.clock.is_suppressed() {
            self.fill_missing_samples(sample_time)?;
        }

        self.collect(&mut event, sample_time)?;

        if self.clock.interval() == 0 {
            self.advance(AdvanceReason::Capture);
            self.last_boundary_time = Some(sample_time);
        }
        Ok(())
    }

    /// History-replay path: gap-fill, aggregate, then advance once the event's
    /// bucket crosses a boundary. Never relies on a timer.
    ///
    /// With auto-sampling suppressed there is no skip allowance, so the gap
    /// fill advances past the event's own boundary and the event is aggregated
    /// one bucket later: `preload(t=0)` then `preload(t=2000)` at interval 1000
    /// puts the second event into the bucket starting at 3000.
    pub fn preload(&mut self, mut event: Event) -> Result<(), SamplerError> {
        let sample_time = self.sample_time(self.event_time(&event, None)?)?;

        self.fill_missing_samples(sample_time)?;
        self.collect(&mut event, sample_time)?;

        if self
            .clock
            .should_advance(sample_time, self.last_boundary_time)
        {
            self.advance(AdvanceReason::Preload);
            self.last_boundary_time = Some(sample_time);
        }
        Ok(())
    }

    fn sample_time(&self, raw: Timestamp) -> Result<Timestamp, SamplerError> {
        self.clock
            .sample_time(raw)
            .ok_or(SamplerError::TimeOutOfRange { time: raw })
    }

    fn event_time(&self, event: &Event, explicit: Option<Timestamp>) -> Result<Timestamp, SamplerError> {
        explicit
            .or_else(|| event.time(self.clock.time_key()))
            .ok_or_else(|| SamplerError::MissingTime {
                key: self.clock.time_key().to_string(),
            })
    }

    /// Swaps in a rebuilt catalog. Stored values survive by field name and the
    /// series cache starts over.
    pub(crate) fn rebind(&mut self, catalog: Arc<Catalog>) {
        let index = Arc::clone(catalog.index());
        for bucket in &mut self.buckets {
            bucket.rebind(&index);
        }
        self.series = (0..index.len()).map(|_| OnceLock::new()).collect();
        self.catalog = catalog;
    }
}

/// Iterator returned by [`RingBuffer::backward`].
#[derive(Debug, Clone)]
pub struct Backward<'a> {
    buffer: &'a RingBuffer,
    index: usize,
    skip: usize,
    ordinal: usize,
    remaining: usize,
}

impl<'a> Iterator for Backward<'a> {
    type Item = (IteratorPosition, &'a Bucket);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let pos = IteratorPosition {
            index: self.index,
            relative: -((self.skip + self.ordinal) as i64),
            ordinal: self.ordinal,
        };
        let bucket = &self.buffer.buckets[self.index];
        self.index = if self.index == 0 {
            self.buffer.buckets.len() - 1
        } else {
            self.index - 1
        };
        self.ordinal += 1;
        self.remaining -= 1;
        Some((pos, bucket))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Backward<'_> {}

/// Iterator returned by [`RingBuffer::forward`].
#[derive(Debug, Clone)]
pub struct Forward<'a> {
    buffer: &'a RingBuffer,
    ordinal: usize,
    remaining: usize,
}

impl<'a> Iterator for Forward<'a> {
    type Item = (IteratorPosition, &'a Bucket);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let cap = self.buffer.buckets.len();
        let index = (self.buffer.cursor + 1 + self.ordinal) % cap;
        let pos = IteratorPosition {
            index,
            relative: self.ordinal as i64 - (cap as i64 - 1),
            ordinal: self.ordinal,
        };
        self.ordinal += 1;
        self.remaining -= 1;
        Some((pos, &self.buffer.buckets[index]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Forward<'_> {}
