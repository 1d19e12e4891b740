//! Field declarations and the catalog they resolve into.
//!
//! Declarations come in a few shapes (constant, passthrough, plain accumulator,
//! full declaration with fill/cumulative). They are resolved once, at catalog build
//! time, into a uniform [`FieldSpec`] so the aggregation pass never inspects
//! declaration shapes.
//!
//! Accumulators receive the whole bucket for cross-field reads (e.g. a
//! volume-weighted price reading `ttl_mv` and `ttl_vol`), but only the returned
//! value is written, and only into the accumulator's own field. Nothing stops an
//! accumulator from depending on fields declared after it; those read the value
//! from before the current event. Keeping dependencies in declaration order is
//! the caller's job.

use crate::error::ConfigError;
use crate::expr::ExpressionSet;
use crate::state::Bucket;
use crate::types::Event;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// `(event, current_value, bucket) -> new value`; `None` leaves the field unchanged.
pub type AccumulateFn = Arc<dyn Fn(&mut Event, Option<f64>, &Bucket) -> Option<f64> + Send + Sync>;
/// `(previous_bucket) -> value` carried into an empty successor bucket.
pub type FillFn = Arc<dyn Fn(&Bucket) -> Option<f64> + Send + Sync>;

fn accumulator<F>(f: F) -> AccumulateFn
where
    F: Fn(&mut Event, Option<f64>, &Bucket) -> Option<f64> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
pub enum FieldDecl {
    /// Every event sets the field to a constant.
    Constant(f64),
    /// Copies the event's numeric value of the same name. Has no fill and is
    /// never cumulative; `with_fill` or `cumulative` on it yields a no-op
    /// accumulator.
    Passthrough,
    Accumulate(AccumulateFn),
    Spec {
        accumulate: AccumulateFn,
        fill: Option<FillFn>,
        cumulative: bool,
    },
}

impl FieldDecl {
    pub fn accumulate<F>(f: F) -> Self
    where
        F: Fn(&mut Event, Option<f64>, &Bucket) -> Option<f64> + Send + Sync + 'static,
    {
        Self::Accumulate(accumulator(f))
    }

    pub fn with_fill<G>(self, fill: G) -> Self
    where
        G: Fn(&Bucket) -> Option<f64> + Send + Sync + 'static,
    {
        let (accumulate, _, cumulative) = self.into_parts();
        Self::Spec {
            accumulate,
            fill: Some(Arc::new(fill) as FillFn),
            cumulative,
        }
    }

    /// Marks the field as never reset by bucket advances.
    pub fn cumulative(self) -> Self {
        let (accumulate, fill, _) = self.into_parts();
        Self::Spec {
            accumulate,
            fill,
            cumulative: true,
        }
    }

    fn into_parts(self) -> (AccumulateFn, Option<FillFn>, bool) {
        match self {
            Self::Constant(value) => (accumulator(move |_, _, _| Some(value)), None, false),
            // Resolved against the field name at build time.
            Self::Passthrough => (accumulator(|_, _, _| None), None, false),
            Self::Accumulate(accumulate) => (accumulate, None, false),
            Self::Spec {
                accumulate,
                fill,
                cumulative,
            } => (accumulate, fill, cumulative),
        }
    }

    fn resolve(&self, name: &str) -> (AccumulateFn, Option<FillFn>, bool) {
        match self {
            Self::Passthrough => {
                let source = name.to_string();
                (
                    accumulator(move |event, _, _| event.number(&source)),
                    None,
                    false,
                )
            }
            other => other.clone().into_parts(),
        }
    }
}

impl fmt::Debug for FieldDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::Passthrough => f.write_str("Passthrough"),
            Self::Accumulate(_) => f.write_str("Accumulate(..)"),
            Self::Spec {
                fill, cumulative, ..
            } => f
                .debug_struct("Spec")
                .field("has_fill", &fill.is_some())
                .field("cumulative", cumulative)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NamedField {
    pub name: String,
    pub decl: FieldDecl,
}

impl NamedField {
    pub fn new(name: impl Into<String>, decl: FieldDecl) -> Self {
        Self {
            name: name.into(),
            decl,
        }
    }
}

impl From<&str> for NamedField {
    fn from(name: &str) -> Self {
        Self::new(name, FieldDecl::Passthrough)
    }
}

/// Field declaration set. The list form keeps its order; the map form is
/// iterated in key order.
#[derive(Debug, Clone)]
pub enum FieldDecls {
    List(Vec<NamedField>),
    Map(BTreeMap<String, FieldDecl>),
}

impl FieldDecls {
    fn entries(&self) -> Vec<(&str, &FieldDecl)> {
        match self {
            Self::List(fields) => fields.iter().map(|f| (f.name.as_str(), &f.decl)).collect(),
            Self::Map(fields) => fields.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        }
    }
}

impl From<Vec<NamedField>> for FieldDecls {
    fn from(fields: Vec<NamedField>) -> Self {
        Self::List(fields)
    }
}

impl From<BTreeMap<String, FieldDecl>> for FieldDecls {
    fn from(fields: BTreeMap<String, FieldDecl>) -> Self {
        Self::Map(fields)
    }
}

impl FromIterator<NamedField> for FieldDecls {
    fn from_iter<T: IntoIterator<Item = NamedField>>(iter: T) -> Self {
        Self::List(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Ordinary,
    /// Preprocessing only: runs before ordinary fields, never stored.
    Hidden,
    /// Survives bucket advances instead of resetting.
    Cumulative,
}

/// A single leading underscore marks a hidden field; a double one does not.
#[inline]
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('_') && !name.starts_with("__")
}

#[derive(Clone)]
pub struct FieldSpec {
    name: String,
    kind: FieldKind,
    accumulate: AccumulateFn,
    fill: Option<FillFn>,
}

impl FieldSpec {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    #[inline]
    pub fn has_fill(&self) -> bool {
        self.fill.is_some()
    }

    #[inline]
    pub(crate) fn accumulate(&self, event: &mut Event, current: Option<f64>, bucket: &Bucket) -> Option<f64> {
        (self.accumulate)(event, current, bucket)
    }

    #[inline]
    pub(crate) fn fill(&self, previous: &Bucket) -> Option<Option<f64>> {
        self.fill.as_ref().map(|fill| fill(previous))
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("has_fill", &self.fill.is_some())
            .finish()
    }
}

/// Name to slot mapping for stored (public + expression) fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldIndex {
    names: Vec<String>,
    slots: HashMap<String, usize>,
}

impl FieldIndex {
    fn new(names: Vec<String>) -> Self {
        let slots = names
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, name)| (name, idx))
            .collect();
        Self { names, slots }
    }

    #[inline]
    pub fn slot(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    hidden: Vec<FieldSpec>,
    public: Vec<FieldSpec>,
    expressions: ExpressionSet,
    index: Arc<FieldIndex>,
    cumulative_slots: Vec<usize>,
    fill_slots: Vec<usize>,
}

impl Catalog {
    /// Public slot order: declared fields, then expressions in registration order.
    pub fn build(decls: &FieldDecls, expressions: &ExpressionSet) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut hidden = Vec::new();
        let mut public = Vec::new();
        for (name, decl) in decls.entries() {
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::DuplicateField {
                    name: name.to_string(),
                });
            }
            let (accumulate, fill, cumulative) = decl.resolve(name);
            let kind = match (is_hidden_name(name), cumulative) {
                (true, true) => {
                    return Err(ConfigError::HiddenCumulative {
                        name: name.to_string(),
                    })
                }
                (true, false) => FieldKind::Hidden,
                (false, true) => FieldKind::Cumulative,
                (false, false) => FieldKind::Ordinary,
            };
            let spec = FieldSpec {
                name: name.to_string(),
                kind,
                accumulate,
                fill,
            };
            if kind == FieldKind::Hidden {
                hidden.push(spec);
            } else {
                public.push(spec);
            }
        }

        let mut names: Vec<String> = public.iter().map(|spec| spec.name.clone()).collect();
        for expr in expressions.iter() {
            if !seen.insert(expr.name().to_string()) {
                return Err(ConfigError::DuplicateField {
                    name: expr.name().to_string(),
                });
            }
            names.push(expr.name().to_string());
        }

        let cumulative_slots = public
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.kind == FieldKind::Cumulative)
            .map(|(slot, _)| slot)
            .collect();
        let fill_slots = public
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.has_fill())
            .map(|(slot, _)| slot)
            .collect();

        Ok(Self {
            hidden,
            public,
            expressions: expressions.clone(),
            index: Arc::new(FieldIndex::new(names)),
            cumulative_slots,
            fill_slots,
        })
    }

    /// Stored field names in slot order.
    #[inline]
    pub fn field_names(&self) -> &[String] {
        self.index.names()
    }

    pub fn hidden_names(&self) -> impl Iterator<Item = &str> {
        self.hidden.iter().map(FieldSpec::name)
    }

    pub fn cumulative_names(&self) -> impl Iterator<Item = &str> {
        self.cumulative_slots
            .iter()
            .map(|&slot| self.public[slot].name())
    }

    pub fn expression_names(&self) -> impl Iterator<Item = &str> {
        self.expressions.iter().map(|expr| expr.name())
    }

    #[inline]
    pub fn slot(&self, name: &str) -> Option<usize> {
        self.index.slot(name)
    }

    /// Whether `name` is taken by any field, hidden fields included.
    pub fn contains(&self, name: &str) -> bool {
        self.index.slot(name).is_some() || self.hidden.iter().any(|spec| spec.name == name)
    }

    #[inline]
    pub(crate) fn index(&self) -> &Arc<FieldIndex> {
        &self.index
    }

    #[inline]
    pub(crate) fn hidden(&self) -> &[FieldSpec] {
        &self.hidden
    }

    #[inline]
    pub(crate) fn public(&self) -> &[FieldSpec] {
        &self.public
    }

    #[inline]
    pub(crate) fn expressions(&self) -> &ExpressionSet {
        &self.expressions
    }

    #[inline]
    pub(crate) fn expression_slot(&self, ordinal: usize) -> usize {
        self.public.len() + ordinal
    }

    #[inline]
    pub(crate) fn cumulative_slots(&self) -> &[usize] {
        &self.cumulative_slots
    }

    #[inline]
    pub(crate) fn fill_slots(&self) -> &[usize] {
        &self.fill_slots
    }
}
