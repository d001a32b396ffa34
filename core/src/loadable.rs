//! Loadable view of an asynchronous atom
//!
//! Never fails and never suspends: loading and failure are part of the value.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::trace;

use crate::deferred::{Eventual, Payload};
use crate::error::Rejection;
use crate::fallback::stale_state;
use crate::store::{Atom, AtomId, ErasedAtom};

/// Live loadable views, by source atom
static VIEWS: OnceLock<Mutex<HashMap<AtomId, ErasedAtom>>> = OnceLock::new();

#[derive(Debug, Clone)]
pub enum Loadable<T> {
    Loading,
    HasError(Rejection),
    HasData(T),
}

impl<T> Loadable<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, Loadable::Loading)
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Loadable::HasData(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Rejection> {
        match self {
            Loadable::HasError(reason) => Some(reason),
            _ => None,
        }
    }
}

/// `Loading` while `source` is pending, then its data or its error.
///
/// Calls with the same source return the same atom for as long as a handle to
/// it is alive.
pub fn loadable<T, W>(source: &Atom<Eventual<T>, W>) -> Atom<Loadable<T>>
where
    T: Payload,
    W: 'static,
{
    let mut views = VIEWS.get_or_init(Default::default).lock();
    if let Some(view) = views.get(&source.id()).and_then(Atom::<Loadable<T>>::upgrade) {
        return view;
    }

    views.retain(|_, view| view.strong_count() > 0);
    let view = build(source);
    trace!(source = %source.id(), view = %view.id(), "New loadable view");
    views.insert(source.id(), view.downgrade());
    view
}

fn build<T, W>(source: &Atom<Eventual<T>, W>) -> Atom<Loadable<T>>
where
    T: Payload,
    W: 'static,
{
    let state = stale_state(source, Loadable::HasData, |_| Loadable::Loading);
    Atom::derived(move |get, _| {
        Ok(match get.get(&state).and_then(|state| state.output) {
            Ok(output) => output,
            Err(reason) => Loadable::HasError(reason),
        })
    })
}
