use crate::catalog::{Catalog, FieldDecls};
use crate::error::{ConfigError, QueryError, SamplerError};
use crate::expr::ExpressionSet;
use crate::series::{Series, SeriesSet};
use crate::state::RingBuffer;
use crate::types::{AdvanceReason, Datum, Event, SampleClock, SamplerOptions, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

pub type SharedTrack = Arc<Mutex<Track>>;

/// Notifications emitted by [`SamplingBuffer`].
///
/// Callbacks run while the affected track is locked (`on_interval` runs with
/// no track locked). Schema and track-table reads such as `catalog`,
/// `field_names`, `track` or `tracks` are safe from a callback. Anything that
/// locks a track is not: capturing, preloading, `advance_all`, `get_tracks`,
/// `add_expression` or locking a returned [`SharedTrack`] can deadlock.
/// Registering listeners from a callback deadlocks as well.
pub trait SamplerListener: Send + Sync {
    fn on_track_start(&self, _track: &Track) {}
    fn on_update(&self, _track: &Track) {}
    fn on_interval(&self) {}
}

/// One group: a ring buffer plus the grouping values that selected it.
#[derive(Debug)]
pub struct Track {
    key: String,
    tags: BTreeMap<String, Option<Datum>>,
    buffer: RingBuffer,
}

impl Track {
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn tags(&self) -> &BTreeMap<String, Option<Datum>> {
        &self.tags
    }

    #[inline]
    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    #[inline]
    pub fn series(&self, field: &str) -> Option<Series<'_>> {
        self.buffer.series(field)
    }

    #[inline]
    pub fn series_set(&self) -> SeriesSet<'_> {
        self.buffer.series_set()
    }

    pub fn capture(&mut self, event: Event, time: Option<Timestamp>) -> Result<(), SamplerError> {
        self.buffer.capture(event, time)
    }

    pub fn preload(&mut self, event: Event) -> Result<(), SamplerError> {
        self.buffer.preload(event)
    }

    pub fn advance(&mut self, reason: AdvanceReason) {
        self.buffer.advance(reason);
    }

    /// Buckets oldest-to-newest, for bulk export.
    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            key: self.key.clone(),
            tags: self.tags.clone(),
            fields: self.buffer.catalog().field_names().to_vec(),
            total_advances: self.buffer.total_advances(),
            buckets: self
                .buffer
                .forward(None)
                .map(|(_, bucket)| BucketSnapshot {
                    start_time: bucket.start_time(),
                    event_count: bucket.event_count(),
                    values: bucket.values().to_vec(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub start_time: Option<Timestamp>,
    pub event_count: u64,
    /// Aligned with [`TrackSnapshot::fields`].
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub key: String,
    pub tags: BTreeMap<String, Option<Datum>>,
    pub fields: Vec<String>,
    pub total_advances: u64,
    pub buckets: Vec<BucketSnapshot>,
}

#[derive(Debug)]
struct Schema {
    catalog: Arc<Catalog>,
    expressions: ExpressionSet,
}

#[derive(Debug, Default)]
struct TrackTable {
    ordered: Vec<SharedTrack>,
    by_key: HashMap<String, usize>,
}

#[derive(Debug)]
struct TimerHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Routes events to per-group ring buffers and drives the interval timer.
///
/// Lock order is schema, then track table, then an individual track.
pub struct SamplingBuffer {
    options: SamplerOptions,
    clock: SampleClock,
    fields: FieldDecls,
    schema: RwLock<Schema>,
    tracks: RwLock<TrackTable>,
    listeners: RwLock<Vec<Arc<dyn SamplerListener>>>,
    // Serializes expression registration so rebinds land in order.
    registration: Mutex<()>,
    timer: Mutex<Option<TimerHandle>>,
}

impl SamplingBuffer {
    pub fn new(options: SamplerOptions, fields: impl Into<FieldDecls>) -> Result<Self, ConfigError> {
        options.validate()?;
        let fields = fields.into();
        let expressions = ExpressionSet::new();
        let catalog = Arc::new(Catalog::build(&fields, &expressions)?);
        Ok(Self {
            clock: SampleClock::from_options(&options),
            options,
            fields,
            schema: RwLock::new(Schema {
                catalog,
                expressions,
            }),
            tracks: RwLock::new(TrackTable::default()),
            listeners: RwLock::new(Vec::new()),
            registration: Mutex::new(()),
            timer: Mutex::new(None),
        })
    }

    #[inline]
    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.schema.read().catalog)
    }

    /// Stored field names: declared fields, then expressions.
    pub fn field_names(&self) -> Vec<String> {
        self.schema.read().catalog.field_names().to_vec()
    }

    pub fn add_listener(&self, listener: Arc<dyn SamplerListener>) {
        self.listeners.write().push(listener);
    }

    /// Registers a derived field. Existing tracks gain the field immediately.
    ///
    /// The new schema is published first; tracks created from then on start
    /// with it. Tracks that already existed are rebound afterwards, one track
    /// lock at a time, with no schema or table lock held.
    pub fn add_expression<F>(&self, name: impl Into<String>, eval: F) -> Result<(), ConfigError>
    where
        F: Fn(&SeriesSet<'_>) -> Result<Option<f64>, QueryError> + Send + Sync + 'static,
    {
        let name = name.into();
        let _registration = self.registration.lock();
        let catalog = {
            let mut schema = self.schema.write();
            if schema.catalog.contains(&name) {
                return Err(ConfigError::DuplicateField { name });
            }
            let mut expressions = schema.expressions.clone();
            expressions.register(name.clone(), eval)?;
            let catalog = Arc::new(Catalog::build(&self.fields, &expressions)?);
            schema.catalog = Arc::clone(&catalog);
            schema.expressions = expressions;
            catalog
        };

        let tracks = self.tracks();
        for track in &tracks {
            track.lock().buffer.rebind(Arc::clone(&catalog));
        }
        info!(name = %name, tracks = tracks.len(), "registered expression");
        Ok(())
    }

    /// Composite group key; absent grouping values contribute an empty string.
    pub fn track_key(&self, event: &Event) -> String {
        let mut key = String::new();
        for (idx, name) in self.options.track_keys.iter().enumerate() {
            if idx > 0 {
                key.push('.');
            }
            if let Some(value) = event.get(name) {
                let _ = write!(key, "{value}");
            }
        }
        key
    }

    pub fn track(&self, key: &str) -> Option<SharedTrack> {
        let tracks = self.tracks.read();
        tracks.by_key.get(key).map(|&idx| Arc::clone(&tracks.ordered[idx]))
    }

    /// All tracks in creation order.
    pub fn tracks(&self) -> Vec<SharedTrack> {
        self.tracks.read().ordered.clone()
    }

    pub fn get_tracks<F>(&self, filter: F) -> Vec<SharedTrack>
    where
        F: Fn(&Track) -> bool,
    {
        self.tracks()
            .into_iter()
            .filter(|track| filter(&*track.lock()))
            .collect()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.read().ordered.len()
    }

    fn resolve_track(&self, event: &Event) -> Result<SharedTrack, SamplerError> {
        let key = self.track_key(event);
        if let Some(track) = self.track(&key) {
            return Ok(track);
        }

        let schema = self.schema.read();
        let mut tracks = self.tracks.write();
        if let Some(&idx) = tracks.by_key.get(&key) {
            return Ok(Arc::clone(&tracks.ordered[idx]));
        }
        let buffer = RingBuffer::new(
            self.options.buffer_length,
            Arc::clone(&schema.catalog),
            self.clock.clone(),
        )?;
        let tags = self
            .options
            .track_keys
            .iter()
            .map(|name| (name.clone(), event.get(name).cloned()))
            .collect();
        let track = Arc::new(Mutex::new(Track {
            key: key.clone(),
            tags,
            buffer,
        }));
        let idx = tracks.ordered.len();
        tracks.by_key.insert(key.clone(), idx);
        tracks.ordered.push(Arc::clone(&track));
        drop(tracks);
        drop(schema);

        debug!(key = %key, "created track");
        let guard = track.lock();
        for listener in self.listeners.read().iter() {
            listener.on_track_start(&*guard);
        }
        drop(guard);
        Ok(track)
    }

    /// Live ingestion. Advancing is the timer's job unless `interval == 0`.
    pub fn capture(&self, event: Event, time: Option<Timestamp>) -> Result<(), SamplerError> {
        let track = self.resolve_track(&event)?;
        let mut guard = track.lock();
        guard.capture(event, time)?;
        for listener in self.listeners.read().iter() {
            listener.on_update(&*guard);
        }
        Ok(())
    }

    /// History replay. Never relies on the timer.
    pub fn preload(&self, event: Event) -> Result<(), SamplerError> {
        let track = self.resolve_track(&event)?;
        let mut guard = track.lock();
        guard.preload(event)
    }

    /// Advances every track once; this is what each timer tick does.
    pub fn advance_all(&self) {
        let tracks = self.tracks();
        for track in &tracks {
            track.lock().advance(AdvanceReason::Timer);
        }
        for listener in self.listeners.read().iter() {
            listener.on_interval();
        }
    }

    /// Starts the periodic timer on the current tokio runtime. A no-op when
    /// sampling is suppressed, the interval is zero, or the timer already runs.
    pub fn start_sampling(self: &Arc<Self>) -> Result<(), SamplerError> {
        if self.clock.is_suppressed() || self.clock.interval() == 0 {
            return Ok(());
        }
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SamplerError::NoRuntime)?;

        let period = Duration::from_millis(self.clock.interval() as u64);
        let (shutdown, mut shutdown_rx) = mpsc::channel::<()>(1);
        let sampler: Weak<Self> = Arc::downgrade(self);

        info!(interval_ms = self.clock.interval(), "starting sampling timer");
        let task = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(sampler) = sampler.upgrade() else {
                            break;
                        };
                        sampler.advance_all();
                    }
                }
            }
            info!("sampling timer stopped");
        });
        *timer = Some(TimerHandle { shutdown, task });
        Ok(())
    }

    pub fn stop_sampling(&self) {
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.shutdown.try_send(());
            drop(handle.task);
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }
}

impl Drop for SamplingBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.task.abort();
        }
    }
}
