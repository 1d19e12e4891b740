//! Derived fields computed from series queries after each aggregation pass.
//!
//! Expressions run in registration order and may read the series of any
//! expression registered before them, observing the value written earlier in
//! the same pass. There is no cycle detection: a name registered later reads as
//! absent (or stale, for history) until its own registration.

use crate::error::{ConfigError, QueryError, SamplerError};
use crate::series::SeriesSet;
use crate::state::RingBuffer;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Returns `Ok(None)` to leave the field at its current value.
pub type ExpressionFn =
    Arc<dyn Fn(&SeriesSet<'_>) -> Result<Option<f64>, QueryError> + Send + Sync>;

#[derive(Clone)]
pub struct Expression {
    name: String,
    eval: ExpressionFn,
}

impl Expression {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn evaluate(&self, series: &SeriesSet<'_>) -> Result<Option<f64>, QueryError> {
        (self.eval)(series)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpressionSet {
    ordered: Vec<Expression>,
    names: HashSet<String>,
}

impl ExpressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, eval: F) -> Result<(), ConfigError>
    where
        F: Fn(&SeriesSet<'_>) -> Result<Option<f64>, QueryError> + Send + Sync + 'static,
    {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(ConfigError::DuplicateField { name });
        }
        self.ordered.push(Expression {
            name,
            eval: Arc::new(eval),
        });
        Ok(())
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expression> {
        self.ordered.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Evaluates every expression against `buffer` and writes defined results into
/// the current bucket. Stops at the first failing expression.
pub(crate) fn evaluate(buffer: &mut RingBuffer) -> Result<(), SamplerError> {
    let catalog = Arc::clone(buffer.catalog());
    for (ordinal, expr) in catalog.expressions().iter().enumerate() {
        let result = expr
            .evaluate(&SeriesSet::new(buffer))
            .map_err(|source| SamplerError::Expression {
                name: expr.name().to_string(),
                source,
            })?;
        if let Some(value) = result {
            let slot = catalog.expression_slot(ordinal);
            buffer.current_mut().set_slot(slot, Some(value));
        }
    }
    Ok(())
}
