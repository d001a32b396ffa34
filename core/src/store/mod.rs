//! Reactive store
//!
//! A small memoizing dependency graph: reads are cached per atom, dependencies
//! are recorded while an atom's read function runs, and writing a primitive atom
//! marks everything downstream dirty so it is recomputed on its next read.
//!
//! The store provides the capabilities the eager engine consumes:
//! - `Getter`, the read capability handed to read functions (owned, so eager
//!   retries can keep reading after the evaluation that created it returned);
//! - `ReadContext`, carrying a per-evaluation `CancellationToken` (cancelled as
//!   soon as a newer evaluation of the same atom starts), the previous value, and
//!   an `Invalidator` ("mark dirty, re-run on next read");
//! - `Setter`, the write capability handed to write functions;
//! - subscriptions that fire whenever an atom is invalidated;
//! - the store-scoped settlement `Registry`.

mod atom;

pub use atom::{Atom, AtomId, ReadFn, WriteFn};
pub(crate) use atom::ErasedAtom;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::Config;
use crate::deferred::{Eventual, Payload};
use crate::error::{EngineError, Rejection};
use crate::init;
use crate::registry::Registry;
use atom::{Source, TrackFn};

type Listener = Arc<dyn Fn() + Send + Sync>;

/* ===================== State ===================== */

#[derive(Default)]
struct Entry {
    /// `Result<T, Rejection>` of the latest evaluation
    value: Option<Arc<dyn Any + Send + Sync>>,
    dirty: bool,
    epoch: u64,
    signal: Option<CancellationToken>,
    deps: HashSet<AtomId>,
    dependents: HashSet<AtomId>,
}

#[derive(Default)]
struct State {
    entries: HashMap<AtomId, Entry>,
    listeners: HashMap<AtomId, Vec<(u64, Listener)>>,
}

impl State {
    /// Mark everything downstream of `id` dirty, and `id` itself if
    /// `include_self`. Returns the listeners to notify.
    fn invalidate(&mut self, id: AtomId, include_self: bool) -> Vec<Listener> {
        let mut visited = HashSet::new();
        let mut stack = vec![id];

        while let Some(next) = stack.pop() {
            if !visited.insert(next) {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&next) {
                if next != id || include_self {
                    entry.dirty = true;
                }
                stack.extend(entry.dependents.iter().copied());
            }
        }

        visited
            .iter()
            .filter_map(|atom| self.listeners.get(atom))
            .flat_map(|listeners| listeners.iter().map(|(_, listener)| listener.clone()))
            .collect()
    }
}

/* ===================== Store ===================== */

/// Holds atom values. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<State>,
    registry: Registry,
    next_listener: AtomicU64,
}

impl Store {
    /// A store using the configuration from [`init::initialize`], or defaults
    pub fn new() -> Self {
        match init::get_config() {
            Some(config) => Self::with_config(config),
            None => Self::with_config(&Config::default()),
        }
    }

    pub fn with_config(config: &Config) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(State::default()),
                registry: Registry::with_config(&config.registry),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// The settlement registry scoped to this store
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// A read capability bound to no evaluation, so its reads register no
    /// dependencies
    pub fn getter(&self) -> Getter {
        Getter {
            store: self.clone(),
            reader: None,
        }
    }

    /// Read an atom, evaluating it if it has no current value
    pub fn get<T: Payload, W>(&self, atom: &Atom<T, W>) -> Result<T, Rejection> {
        let id = atom.id();
        let read = match &atom.inner.source {
            Source::Primitive(init) => return self.get_primitive(atom, init),
            Source::Derived(read) => read,
        };

        let (epoch, signal, previous, superseded) = {
            let mut state = self.inner.state.lock();
            let entry = state.entries.entry(id).or_default();
            if !entry.dirty {
                if let Some(value) = &entry.value {
                    return downcast::<T>(value, id);
                }
            }

            let previous = entry
                .value
                .as_ref()
                .and_then(|value| value.downcast_ref::<Result<T, Rejection>>())
                .and_then(|outcome| outcome.as_ref().ok().cloned());
            let superseded = entry.signal.take();
            let signal = CancellationToken::new();
            entry.signal = Some(signal.clone());
            entry.epoch += 1;
            entry.dirty = false;
            let epoch = entry.epoch;
            let old_deps = std::mem::take(&mut entry.deps);
            for dep in old_deps {
                if let Some(dep_entry) = state.entries.get_mut(&dep) {
                    dep_entry.dependents.remove(&id);
                }
            }
            (epoch, signal, previous, superseded)
        };

        if let Some(superseded) = superseded {
            superseded.cancel();
        }

        trace!(atom = %id, epoch, "Evaluating atom");
        let getter = Getter {
            store: self.clone(),
            reader: Some((id, epoch)),
        };
        let context = ReadContext {
            signal,
            invalidator: Invalidator {
                store: Arc::downgrade(&self.inner),
                atom: id,
            },
            previous,
        };
        let outcome = read(&getter, &context).map_err(Rejection::from);

        if let (Some(track), Ok(value)) = (atom.inner.track, &outcome) {
            track(value, &self.inner.registry);
        }

        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get_mut(&id) {
            if entry.epoch == epoch {
                entry.value = Some(Arc::new(outcome.clone()));
            }
        }
        outcome
    }

    fn get_primitive<T: Payload, W>(&self, atom: &Atom<T, W>, init: &T) -> Result<T, Rejection> {
        let id = atom.id();
        {
            let mut state = self.inner.state.lock();
            let entry = state.entries.entry(id).or_default();
            if let Some(value) = &entry.value {
                return downcast::<T>(value, id);
            }
            entry.value = Some(Arc::new(Ok::<T, Rejection>(init.clone())));
        }
        if let Some(track) = atom.inner.track {
            track(init, &self.inner.registry);
        }
        Ok(init.clone())
    }

    /// Write to an atom through its write function
    pub fn set<T, W>(&self, atom: &Atom<T, W>, arg: W) -> Result<(), Rejection> {
        let Some(write) = &atom.inner.write else {
            return Err(EngineError::ReadOnly(atom.to_string()).into());
        };
        let setter = Setter {
            store: self.clone(),
        };
        write(&setter, arg).map_err(Rejection::from)
    }

    /// Read an asynchronous atom and wait for its value, recording the settlement
    pub async fn resolve<T: Payload, W>(&self, atom: &Atom<Eventual<T>, W>) -> Result<T, Rejection> {
        match self.get(atom)? {
            Eventual::Now(value) => Ok(value),
            Eventual::Later(deferred) => self.inner.registry.observe(&deferred).await,
        }
    }

    /// Call `listener` every time `atom` is invalidated or written
    pub fn subscribe<T, W, F>(&self, atom: &Atom<T, W>, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let key = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        state
            .listeners
            .entry(atom.id())
            .or_default()
            .push((key, Arc::new(listener)));
        Subscription {
            store: Arc::downgrade(&self.inner),
            atom: atom.id(),
            key,
        }
    }

    fn put<T: Payload>(&self, id: AtomId, track: Option<TrackFn<T>>, value: T) {
        if let Some(track) = track {
            track(&value, &self.inner.registry);
        }
        let listeners = {
            let mut state = self.inner.state.lock();
            let entry = state.entries.entry(id).or_default();
            entry.value = Some(Arc::new(Ok::<T, Rejection>(value)));
            entry.dirty = false;
            state.invalidate(id, false)
        };
        trace!(atom = %id, notified = listeners.len(), "Wrote primitive atom");
        for listener in listeners {
            listener();
        }
    }

    fn add_dependency(&self, reader: AtomId, epoch: u64, dependency: AtomId) {
        let mut state = self.inner.state.lock();
        match state.entries.get_mut(&reader) {
            Some(entry) if entry.epoch == epoch => {
                entry.deps.insert(dependency);
            }
            _ => return,
        }
        state
            .entries
            .entry(dependency)
            .or_default()
            .dependents
            .insert(reader);
    }
}

impl StoreInner {
    fn invalidate(&self, id: AtomId) {
        let listeners = self.state.lock().invalidate(id, true);
        trace!(atom = %id, notified = listeners.len(), "Invalidated atom");
        for listener in listeners {
            listener();
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let atoms = self.inner.state.lock().entries.len();
        f.debug_struct("Store")
            .field("atoms", &atoms)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

fn downcast<T: Payload>(value: &Arc<dyn Any + Send + Sync>, id: AtomId) -> Result<T, Rejection> {
    match value.downcast_ref::<Result<T, Rejection>>() {
        Some(outcome) => outcome.clone(),
        None => Err(EngineError::TypeMismatch(id.to_string()).into()),
    }
}

/* ===================== Capabilities ===================== */

/// Read capability handed to read functions.
///
/// Reads register a dependency of the atom being evaluated, including reads made
/// after its read function returned, until a newer evaluation supersedes it.
#[derive(Clone)]
pub struct Getter {
    store: Store,
    reader: Option<(AtomId, u64)>,
}

impl Getter {
    pub fn get<T: Payload, W>(&self, atom: &Atom<T, W>) -> Result<T, Rejection> {
        if let Some((reader, epoch)) = self.reader {
            self.store.add_dependency(reader, epoch, atom.id());
        }
        self.store.get(atom)
    }

    pub fn registry(&self) -> &Registry {
        self.store.registry()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Per-evaluation context handed to read functions
pub struct ReadContext<T> {
    signal: CancellationToken,
    invalidator: Invalidator,
    previous: Option<T>,
}

impl<T> ReadContext<T> {
    /// Cancelled once a newer evaluation of the same atom starts
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    /// The value produced by the previous successful evaluation
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }
}

/// Marks an atom dirty so it is recomputed on its next read
#[derive(Clone)]
pub struct Invalidator {
    store: Weak<StoreInner>,
    atom: AtomId,
}

impl Invalidator {
    pub fn invalidate(&self) {
        if let Some(store) = self.store.upgrade() {
            store.invalidate(self.atom);
        }
    }

    pub fn atom(&self) -> AtomId {
        self.atom
    }
}

/// Write capability handed to write functions
pub struct Setter {
    store: Store,
}

impl Setter {
    pub fn get<T: Payload, W>(&self, atom: &Atom<T, W>) -> Result<T, Rejection> {
        self.store.get(atom)
    }

    pub fn set<T, W>(&self, atom: &Atom<T, W>, arg: W) -> Result<(), Rejection> {
        self.store.set(atom, arg)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn put<T: Payload>(&self, id: AtomId, track: Option<TrackFn<T>>, value: T) {
        self.store.put(id, track, value);
    }
}

/// Keeps a listener registered; dropping it unsubscribes
pub struct Subscription {
    store: Weak<StoreInner>,
    atom: AtomId,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            let mut state = store.state.lock();
            if let Some(listeners) = state.listeners.get_mut(&self.atom) {
                listeners.retain(|(key, _)| *key != self.key);
            }
        }
    }
}
