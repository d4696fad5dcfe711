//! Lazy proxies and collections
//!
//! Both are bound to the context that created them and fail with
//! [`OrmError::ContextClosed`](crate::OrmError::ContextClosed) once that context is closed,
//! whatever state they were in.

pub mod collection;
pub mod entity;

pub use collection::PersistentCollection;
pub use entity::EntityProxy;

/// Lifecycle of a proxy or collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Uninitialized,
    Initializing,
    Initialized,
    /// Evicted from its context; cannot be initialized any more
    Detached,
    /// Its context was closed
    Unavailable,
}
