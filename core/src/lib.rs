pub mod combinators;
pub mod config;
pub mod deferred;
pub mod derive;
pub mod eager;
pub mod error;
pub mod fallback;
pub mod init;
pub mod loadable;
pub mod registry;
pub mod store;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use combinators::{soon, soon_all, soon_with, SoonAll};
pub use deferred::{Deferred, DeferredId, Eventual, Payload, Settler};
pub use eager::{eager_atom, is_suspension_signal, resolve_eagerly, EagerGetter, Interrupt};
pub use error::{EngineError, Rejection};
pub use fallback::{with_fallback, with_pending, FallbackContext};
pub use loadable::{loadable, Loadable};
pub use registry::{Registry, Settlement};
pub use store::{Atom, AtomId, Getter, Setter, Store, Subscription};

// Re-export init API for convenience
pub use init::{initialize, InitBuilder, InitOptions};
