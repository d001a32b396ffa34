//! Atoms: identity-keyed nodes of the reactive graph
//!
//! An atom is only a description (initial value or read function, optional write
//! function). Values live in a [`Store`](super::Store), so one atom can be used
//! with any number of independent stores.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::{Getter, ReadContext, Setter};
use crate::deferred::{Eventual, Payload};
use crate::registry::Registry;

static NEXT_ATOM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u64);

impl AtomId {
    fn next() -> Self {
        AtomId(NEXT_ATOM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom#{}", self.0)
    }
}

pub type ReadFn<T> = Arc<dyn Fn(&Getter, &ReadContext<T>) -> anyhow::Result<T> + Send + Sync>;
pub type WriteFn<W> = Arc<dyn Fn(&Setter, W) -> anyhow::Result<()> + Send + Sync>;

/// Weak handle to an atom of any type
pub(crate) type ErasedAtom = Weak<dyn Any + Send + Sync>;

/// Instrumentation run on every value an atom produces
pub(crate) type TrackFn<T> = fn(&T, &Registry);

pub(crate) enum Source<T> {
    Primitive(T),
    Derived(ReadFn<T>),
}

pub(crate) struct AtomInner<T, W> {
    pub(crate) id: AtomId,
    pub(crate) source: Source<T>,
    pub(crate) write: Option<WriteFn<W>>,
    pub(crate) track: Option<TrackFn<T>>,
}

/// A node holding values of type `T`, accepting writes of type `W`
pub struct Atom<T, W = ()> {
    pub(crate) inner: Arc<AtomInner<T, W>>,
}

impl<T, W> Atom<T, W> {
    pub fn id(&self) -> AtomId {
        self.inner.id
    }

    pub fn is_writable(&self) -> bool {
        self.inner.write.is_some()
    }
}

impl<T: Payload> Atom<T, T> {
    /// A primitive atom holding `init` until written
    pub fn new(init: T) -> Self {
        Self::primitive(init, None)
    }

    fn primitive(init: T, track: Option<TrackFn<T>>) -> Self {
        let id = AtomId::next();
        let write: WriteFn<T> = Arc::new(move |setter: &Setter, value: T| {
            setter.put(id, track, value);
            Ok(())
        });
        Atom {
            inner: Arc::new(AtomInner {
                id,
                source: Source::Primitive(init),
                write: Some(write),
                track,
            }),
        }
    }
}

impl<U: Payload> Atom<Eventual<U>, Eventual<U>> {
    /// A primitive atom holding a possibly asynchronous value. Every deferred value
    /// it holds is tracked by the store's registry.
    pub fn deferred(init: Eventual<U>) -> Self {
        Self::primitive(init, Some(track_eventual::<U>))
    }
}

impl<T: Payload> Atom<T> {
    /// A read-only atom computed from other atoms
    pub fn derived<R>(read: R) -> Self
    where
        R: Fn(&Getter, &ReadContext<T>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::build(Arc::new(read), None, None)
    }
}

impl<U: Payload> Atom<Eventual<U>> {
    /// A read-only atom producing possibly asynchronous values, each tracked by
    /// the store's registry
    pub fn derived_async<R>(read: R) -> Self
    where
        R: Fn(&Getter, &ReadContext<Eventual<U>>) -> anyhow::Result<Eventual<U>>
            + Send
            + Sync
            + 'static,
    {
        Self::build(Arc::new(read), None, Some(track_eventual::<U>))
    }
}

impl<T: Payload, W> Atom<T, W> {
    /// A derived atom with a custom write function
    pub fn writable<R, F>(read: R, write: F) -> Self
    where
        R: Fn(&Getter, &ReadContext<T>) -> anyhow::Result<T> + Send + Sync + 'static,
        F: Fn(&Setter, W) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::build(Arc::new(read), Some(Arc::new(write)), None)
    }

    fn build(read: ReadFn<T>, write: Option<WriteFn<W>>, track: Option<TrackFn<T>>) -> Self {
        Atom {
            inner: Arc::new(AtomInner {
                id: AtomId::next(),
                source: Source::Derived(read),
                write,
                track,
            }),
        }
    }
}

impl<T: Payload, W: 'static> Atom<T, W> {
    pub(crate) fn downgrade(&self) -> ErasedAtom {
        let erased: Arc<dyn Any + Send + Sync> = self.inner.clone();
        Arc::downgrade(&erased)
    }

    /// `None` once every strong handle is gone, or if `handle` holds another type
    pub(crate) fn upgrade(handle: &ErasedAtom) -> Option<Self> {
        let inner = handle.upgrade()?.downcast::<AtomInner<T, W>>().ok()?;
        Some(Atom { inner })
    }
}

impl<T, W> Clone for Atom<T, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, W> fmt::Debug for Atom<T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.source {
            Source::Primitive(_) => "primitive",
            Source::Derived(_) => "derived",
        };
        f.debug_struct("Atom")
            .field("id", &self.inner.id)
            .field("kind", &kind)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl<T, W> fmt::Display for Atom<T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.id, f)
    }
}

fn track_eventual<U: Payload>(value: &Eventual<U>, registry: &Registry) {
    if let Eventual::Later(deferred) = value {
        registry.track(deferred);
    }
}
