//! Lazy entity proxies

use super::ProxyStatus;
use crate::backends::DatabaseValue;
use crate::context::ContextShared;
use crate::error::{OrmError, OrmResult};
use crate::instance::{ManagedEntity, PropertyValue};
use crate::loader;
use crate::metamodel::{EntityKey, Identifier};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

enum ProxyState {
    Uninitialized,
    Initializing,
    Initialized(ManagedEntity),
    Detached,
    Unavailable,
}

impl ProxyState {
    fn status(&self) -> ProxyStatus {
        match self {
            ProxyState::Uninitialized => ProxyStatus::Uninitialized,
            ProxyState::Initializing => ProxyStatus::Initializing,
            ProxyState::Initialized(_) => ProxyStatus::Initialized,
            ProxyState::Detached => ProxyStatus::Detached,
            ProxyState::Unavailable => ProxyStatus::Unavailable,
        }
    }
}

struct ProxyCell {
    key: EntityKey,
    context_id: u64,
    context: Weak<ContextShared>,
    state: Mutex<ProxyState>,
}

/// Stand-in for an entity that is loaded on first access.
///
/// A context hands out at most one proxy per key; clones share state.
#[derive(Clone)]
pub struct EntityProxy {
    inner: Arc<ProxyCell>,
}

impl fmt::Debug for EntityProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityProxy")
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .finish()
    }
}

impl EntityProxy {
    pub(crate) fn new(key: EntityKey, context: &Arc<ContextShared>) -> Self {
        Self {
            inner: Arc::new(ProxyCell {
                key,
                context_id: context.id(),
                context: Arc::downgrade(context),
                state: Mutex::new(ProxyState::Uninitialized),
            }),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.inner.key
    }

    pub fn kind(&self) -> &str {
        &self.inner.key.kind
    }

    /// The identifier is known without initialization
    pub fn id(&self) -> &Identifier {
        &self.inner.key.id
    }

    pub fn status(&self) -> ProxyStatus {
        self.inner.state.lock().status()
    }

    pub fn is_initialized(&self) -> bool {
        self.status() == ProxyStatus::Initialized
    }

    pub fn ptr_eq(&self, other: &EntityProxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Load the target if needed and return the managed instance
    pub async fn initialize(&self) -> OrmResult<ManagedEntity> {
        let context = self.open_context()?;
        {
            let mut state = self.inner.state.lock();
            match &*state {
                ProxyState::Initialized(entity) => return Ok(entity.clone()),
                ProxyState::Unavailable => return Err(self.closed_error()),
                ProxyState::Detached => return Err(self.detached_error()),
                ProxyState::Initializing => {
                    drop(state);
                    return context.managed(self.key()).ok_or_else(|| {
                        OrmError::LazyInitialization {
                            target: self.key().to_string(),
                            message: "initialization is already in progress".to_string(),
                        }
                    });
                }
                ProxyState::Uninitialized => *state = ProxyState::Initializing,
            }
        }

        let result = loader::load_entity(&context, self.key(), false).await;

        let mut state = self.inner.state.lock();
        match result {
            Ok(Some(entity)) => match &*state {
                ProxyState::Unavailable => Err(self.closed_error()),
                ProxyState::Detached => Err(self.detached_error()),
                _ => {
                    *state = ProxyState::Initialized(entity.clone());
                    Ok(entity)
                }
            },
            Ok(None) => {
                if matches!(*state, ProxyState::Initializing) {
                    *state = ProxyState::Uninitialized;
                }
                Err(OrmError::ObjectNotFound {
                    kind: self.kind().to_string(),
                    id: self.id().to_string(),
                })
            }
            Err(err) => {
                if err.is_context_closed() {
                    *state = ProxyState::Unavailable;
                } else if matches!(*state, ProxyState::Initializing) {
                    *state = ProxyState::Uninitialized;
                }
                Err(err)
            }
        }
    }

    /// Read an attribute of the target, initializing first
    pub async fn get(&self, attribute: &str) -> OrmResult<PropertyValue> {
        self.initialize().await?.get(attribute)
    }

    pub async fn value(&self, attribute: &str) -> OrmResult<DatabaseValue> {
        self.initialize().await?.value(attribute)
    }

    /// The target was registered by some other load
    pub(crate) fn resolve(&self, entity: ManagedEntity) {
        let mut state = self.inner.state.lock();
        if matches!(*state, ProxyState::Uninitialized | ProxyState::Initializing) {
            *state = ProxyState::Initialized(entity);
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock(), ProxyState::Uninitialized)
    }

    pub(crate) fn detach(&self) {
        let mut state = self.inner.state.lock();
        if !matches!(*state, ProxyState::Unavailable) {
            *state = ProxyState::Detached;
        }
    }

    pub(crate) fn invalidate(&self) {
        *self.inner.state.lock() = ProxyState::Unavailable;
    }

    fn open_context(&self) -> OrmResult<Arc<ContextShared>> {
        match self.inner.context.upgrade() {
            Some(context) if !context.is_closed() => Ok(context),
            _ => {
                self.invalidate();
                Err(self.closed_error())
            }
        }
    }

    fn closed_error(&self) -> OrmError {
        OrmError::closed(self.inner.context_id, format!("initialize proxy {}", self.key()))
    }

    fn detached_error(&self) -> OrmError {
        OrmError::LazyInitialization {
            target: self.key().to_string(),
            message: "proxy was evicted from its persistence context".to_string(),
        }
    }
}
