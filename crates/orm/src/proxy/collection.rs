//! Lazy collections

use super::ProxyStatus;
use crate::context::ContextShared;
use crate::error::{OrmError, OrmResult};
use crate::instance::ManagedEntity;
use crate::loader;
use crate::metamodel::{CollectionDescriptor, CollectionKey, EntityKey, Identifier};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

enum Contents {
    Uninitialized,
    Initializing,
    Initialized(Vec<EntityKey>),
    Detached,
    Unavailable,
}

struct CollectionState {
    contents: Contents,
    /// Remembered answers of extra-lazy probes
    size: Option<usize>,
    membership: HashMap<Identifier, bool>,
}

struct CollectionCell {
    key: CollectionKey,
    descriptor: Arc<CollectionDescriptor>,
    context_id: u64,
    context: Weak<ContextShared>,
    state: Mutex<CollectionState>,
}

/// One-to-many collection of a managed owner, loaded on first access
#[derive(Clone)]
pub struct PersistentCollection {
    inner: Arc<CollectionCell>,
}

impl fmt::Debug for PersistentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCollection")
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .finish()
    }
}

impl PersistentCollection {
    pub(crate) fn new(
        key: CollectionKey,
        descriptor: Arc<CollectionDescriptor>,
        context: &Arc<ContextShared>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionCell {
                key,
                descriptor,
                context_id: context.id(),
                context: Arc::downgrade(context),
                state: Mutex::new(CollectionState {
                    contents: Contents::Uninitialized,
                    size: None,
                    membership: HashMap::new(),
                }),
            }),
        }
    }

    pub fn key(&self) -> &CollectionKey {
        &self.inner.key
    }

    pub fn role(&self) -> &str {
        &self.inner.key.role
    }

    pub fn owner(&self) -> &Identifier {
        &self.inner.key.owner
    }

    pub fn descriptor(&self) -> &Arc<CollectionDescriptor> {
        &self.inner.descriptor
    }

    pub fn status(&self) -> ProxyStatus {
        match self.inner.state.lock().contents {
            Contents::Uninitialized => ProxyStatus::Uninitialized,
            Contents::Initializing => ProxyStatus::Initializing,
            Contents::Initialized(_) => ProxyStatus::Initialized,
            Contents::Detached => ProxyStatus::Detached,
            Contents::Unavailable => ProxyStatus::Unavailable,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.status() == ProxyStatus::Initialized
    }

    pub fn ptr_eq(&self, other: &PersistentCollection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Load the element identifiers if they are not loaded yet
    pub async fn initialize(&self) -> OrmResult<()> {
        let context = self.open_context()?;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.contents {
                Contents::Initialized(_) => return Ok(()),
                Contents::Unavailable => return Err(self.closed_error()),
                Contents::Detached => return Err(self.detached_error()),
                Contents::Initializing => {
                    return Err(OrmError::LazyInitialization {
                        target: self.describe(),
                        message: "initialization is already in progress".to_string(),
                    })
                }
                Contents::Uninitialized => state.contents = Contents::Initializing,
            }
        }

        let result = loader::initialize_collection(&context, self.key()).await;

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        match result {
            Ok(()) => match state.contents {
                Contents::Unavailable => Err(self.closed_error()),
                Contents::Detached => Err(self.detached_error()),
                Contents::Initialized(_) => Ok(()),
                _ => {
                    state.contents = Contents::Initialized(Vec::new());
                    Ok(())
                }
            },
            Err(err) => {
                if err.is_context_closed() {
                    state.contents = Contents::Unavailable;
                } else if matches!(state.contents, Contents::Initializing) {
                    state.contents = Contents::Uninitialized;
                }
                Err(err)
            }
        }
    }

    /// Element identifiers, in collection order
    pub async fn element_ids(&self) -> OrmResult<Vec<Identifier>> {
        Ok(self
            .element_keys()
            .await?
            .into_iter()
            .map(|key| key.id)
            .collect())
    }

    /// Managed elements, in collection order. Elements removed in this context are skipped.
    pub async fn elements(&self) -> OrmResult<Vec<ManagedEntity>> {
        let keys = self.element_keys().await?;
        let context = self.open_context()?;
        let ids: Vec<Identifier> = keys.into_iter().map(|key| key.id).collect();
        let loaded =
            loader::load_many(&context, self.inner.descriptor.element(), &ids, false).await?;
        Ok(loaded.into_iter().flatten().collect())
    }

    /// Number of elements; extra-lazy collections answer with a count query
    pub async fn size(&self) -> OrmResult<usize> {
        let context = self.open_context()?;
        {
            let state = self.inner.state.lock();
            match &state.contents {
                Contents::Initialized(keys) => return Ok(keys.len()),
                Contents::Unavailable => return Err(self.closed_error()),
                Contents::Detached => return Err(self.detached_error()),
                _ => {}
            }
            if let Some(size) = state.size {
                return Ok(size);
            }
        }

        if !self.inner.descriptor.is_extra_lazy() {
            return Ok(self.element_keys().await?.len());
        }

        let size = loader::collection_size(&context, &self.inner.descriptor, self.owner()).await?;
        self.inner.state.lock().size = Some(size);
        Ok(size)
    }

    /// Whether an element with `id` belongs to the collection; extra-lazy collections
    /// answer with an existence query
    pub async fn contains(&self, id: impl Into<Identifier>) -> OrmResult<bool> {
        let id = id.into();
        let context = self.open_context()?;
        {
            let state = self.inner.state.lock();
            match &state.contents {
                Contents::Initialized(keys) => return Ok(keys.iter().any(|key| key.id == id)),
                Contents::Unavailable => return Err(self.closed_error()),
                Contents::Detached => return Err(self.detached_error()),
                _ => {}
            }
            if let Some(present) = state.membership.get(&id) {
                return Ok(*present);
            }
        }

        if !self.inner.descriptor.is_extra_lazy() {
            return Ok(self.element_keys().await?.iter().any(|key| key.id == id));
        }

        let present =
            loader::collection_contains(&context, &self.inner.descriptor, self.owner(), &id)
                .await?;
        self.inner.state.lock().membership.insert(id, present);
        Ok(present)
    }

    async fn element_keys(&self) -> OrmResult<Vec<EntityKey>> {
        self.initialize().await?;
        let state = self.inner.state.lock();
        match &state.contents {
            Contents::Initialized(keys) => Ok(keys.clone()),
            Contents::Unavailable => Err(self.closed_error()),
            _ => Err(self.detached_error()),
        }
    }

    /// Store loaded elements; `false` when the collection was not waiting for them
    pub(crate) fn complete(&self, elements: Vec<EntityKey>) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        match state.contents {
            Contents::Uninitialized | Contents::Initializing => {
                state.size = Some(elements.len());
                state.membership.clear();
                state.contents = Contents::Initialized(elements);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.inner.state.lock().contents, Contents::Uninitialized)
    }

    /// Forget loaded elements and probe answers so the next access reloads
    pub(crate) fn reset(&self) {
        let mut state = self.inner.state.lock();
        if matches!(state.contents, Contents::Initialized(_)) {
            state.contents = Contents::Uninitialized;
        }
        state.size = None;
        state.membership.clear();
    }

    pub(crate) fn detach(&self) {
        let mut state = self.inner.state.lock();
        if !matches!(state.contents, Contents::Unavailable) {
            state.contents = Contents::Detached;
        }
    }

    pub(crate) fn invalidate(&self) {
        self.inner.state.lock().contents = Contents::Unavailable;
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

    fn describe(&self) -> String {
        format!("{}#{}", self.inner.key.role, self.inner.key.owner)
    }

    fn closed_error(&self) -> OrmError {
        OrmError::closed(
            self.inner.context_id,
            format!("initialize collection {}", self.describe()),
        )
    }

    fn detached_error(&self) -> OrmError {
        OrmError::LazyInitialization {
            target: self.describe(),
            message: "collection was evicted from its persistence context".to_string(),
        }
    }
}
