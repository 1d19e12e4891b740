//! Windowed queries over one field of one ring buffer.
//!
//! Every query takes an `offset <= 0` (`0` is the accumulating bucket, `-1`
//! the one before it) and, for aggregates, a window size `n`. A window is
//! served only when all `n` buckets are reachable; otherwise the query yields
//! `Ok(None)`. That is the normal state while a buffer warms up, not an error.
//! A bucket that has no value for the field enters aggregates as NaN.

use crate::error::QueryError;
use crate::state::RingBuffer;
use crate::stats::{collect_window_moments, sample_std};
use crate::types::IteratorPosition;
use std::sync::Arc;

/// Cached binding of a field name to its slot; one per field per buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesHandle {
    field: Arc<str>,
    slot: usize,
}

impl SeriesHandle {
    pub(crate) fn new(field: &str, slot: usize) -> Self {
        Self {
            field: Arc::from(field),
            slot,
        }
    }

    #[inline]
    pub fn field(&self) -> &str {
        &self.field
    }
}

#[inline]
fn check_offset(offset: i64) -> Result<(), QueryError> {
    if offset > 0 {
        return Err(QueryError::PositiveOffset { offset });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct Series<'a> {
    handle: &'a SeriesHandle,
    buffer: &'a RingBuffer,
}

impl<'a> Series<'a> {
    pub(crate) fn new(handle: &'a SeriesHandle, buffer: &'a RingBuffer) -> Self {
        Self { handle, buffer }
    }

    #[inline]
    pub fn field(&self) -> &'a str {
        &self.handle.field
    }

    #[inline]
    pub fn handle(&self) -> &'a SeriesHandle {
        self.handle
    }

    /// Buckets reachable from the cursor.
    #[inline]
    pub fn available_length(&self) -> usize {
        self.buffer.available_length(0)
    }

    pub fn value(&self, offset: i64) -> Result<Option<f64>, QueryError> {
        check_offset(offset)?;
        if self.buffer.available_length(offset) == 0 {
            return Ok(None);
        }
        Ok(self.buffer.get(offset).get_slot(self.handle.slot))
    }

    fn window(
        &self,
        n: usize,
        offset: i64,
    ) -> Result<Option<impl Iterator<Item = f64> + 'a>, QueryError> {
        check_offset(offset)?;
        if n == 0 || self.buffer.available_length(offset) < n {
            return Ok(None);
        }
        let slot = self.handle.slot;
        Ok(Some(
            self.buffer
                .backward(offset, Some(n))
                .map(move |(_, bucket)| bucket.get_slot(slot).unwrap_or(f64::NAN)),
        ))
    }

    pub fn min(&self, n: usize, offset: i64) -> Result<Option<f64>, QueryError> {
        Ok(self
            .window(n, offset)?
            .and_then(collect_window_moments)
            .map(|m| m.min))
    }

    pub fn max(&self, n: usize, offset: i64) -> Result<Option<f64>, QueryError> {
        Ok(self
            .window(n, offset)?
            .and_then(collect_window_moments)
            .map(|m| m.max))
    }

    pub fn sum(&self, n: usize, offset: i64) -> Result<Option<f64>, QueryError> {
        Ok(self
            .window(n, offset)?
            .and_then(collect_window_moments)
            .map(|m| m.sum))
    }

    pub fn mean(&self, n: usize, offset: i64) -> Result<Option<f64>, QueryError> {
        Ok(self
            .window(n, offset)?
            .and_then(collect_window_moments)
            .map(|m| m.mean()))
    }

    /// Sample standard deviation (divides by `n - 1`); `0` for a one-bucket window.
    pub fn std_dev(&self, n: usize, offset: i64) -> Result<Option<f64>, QueryError> {
        let Some(mean) = self.mean(n, offset)? else {
            return Ok(None);
        };
        let mut sum_sq_dev = 0.0;
        self.custom(n, offset, |_, value| {
            let dev = value.unwrap_or(f64::NAN) - mean;
            sum_sq_dev += dev * dev;
        })?;
        Ok(Some(sample_std(sum_sq_dev, n)))
    }

    /// Visits the window most-recent-first. The visitor is not called at all
    /// when fewer than `n` buckets are reachable.
    pub fn custom<F>(&self, n: usize, offset: i64, mut visitor: F) -> Result<(), QueryError>
    where
        F: FnMut(IteratorPosition, Option<f64>),
    {
        check_offset(offset)?;
        if n == 0 || self.buffer.available_length(offset) < n {
            return Ok(());
        }
        for (pos, bucket) in self.buffer.backward(offset, Some(n)) {
            visitor(pos, bucket.get_slot(self.handle.slot));
        }
        Ok(())
    }
}

/// All series of one buffer, as handed to expressions.
#[derive(Debug, Clone, Copy)]
pub struct SeriesSet<'a> {
    buffer: &'a RingBuffer,
}

impl<'a> SeriesSet<'a> {
    pub(crate) fn new(buffer: &'a RingBuffer) -> Self {
        Self { buffer }
    }

    /// `None` when no stored field has that name (yet).
    #[inline]
    pub fn get(&self, field: &str) -> Option<Series<'a>> {
        self.buffer.series(field)
    }

    /// Shorthand for `get(field)?.value(offset)`, absent fields reading as `None`.
    pub fn value(&self, field: &str, offset: i64) -> Result<Option<f64>, QueryError> {
        match self.get(field) {
            Some(series) => series.value(offset),
            None => {
                check_offset(offset)?;
                Ok(None)
            }
        }
    }

    #[inline]
    pub fn field_names(&self) -> &'a [String] {
        self.buffer.catalog().field_names()
    }

    #[inline]
    pub fn available_length(&self) -> usize {
        self.buffer.available_length(0)
    }
}
