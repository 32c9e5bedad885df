//! Keyed provider store.
//!
//! Deduplicates providers by key: concurrent requests for the same key get
//! the same instance, each holding a [`UsageToken`]. Unreferenced and
//! disposed providers are evicted by [`ProviderStore::collect`].

use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::error::{DisposeReason, ProviderError};
use super::lifecycle::UsageToken;
use super::{ProviderStatus, TickProvider};

type Factory<K, P> = Box<dyn Fn(&K) -> Result<P, ProviderError> + Send + Sync>;

/// A provider handed out by a store, kept alive by its usage token.
#[derive(Debug)]
pub struct ProviderLease<P> {
    provider: Arc<P>,
    token: UsageToken,
}

impl<P> ProviderLease<P> {
    /// Shared handle to the provider.
    #[must_use]
    pub const fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Split into the provider and the token that pins it.
    #[must_use]
    pub fn into_parts(self) -> (Arc<P>, UsageToken) {
        (self.provider, self.token)
    }
}

impl<P> Deref for ProviderLease<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.provider
    }
}

/// Cache of providers keyed by `K`.
pub struct ProviderStore<K, P> {
    kind: &'static str,
    entries: DashMap<K, Arc<P>>,
    factory: Factory<K, P>,
    created: AtomicU64,
}

impl<K: Eq + Hash, P> Debug for ProviderStore<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderStore")
            .field("kind", &self.kind)
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<K, P> ProviderStore<K, P>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    P: TickProvider + 'static,
{
    /// Create a store that builds providers with `factory`.
    pub fn new(
        kind: &'static str,
        factory: impl Fn(&K) -> Result<P, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
            factory: Box::new(factory),
            created: AtomicU64::new(0),
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Return the provider for `key`, creating and starting it if needed.
    ///
    /// The usage token is taken while the entry is locked, so a concurrent
    /// [`collect`](Self::collect) can never evict the provider between lookup
    /// and acquisition. A disposed entry is replaced with a fresh instance.
    ///
    /// # Errors
    ///
    /// Returns the factory's error when the key is not a valid window. No
    /// entry is stored in that case.
    pub fn get_or_create(&self, key: &K) -> Result<ProviderLease<P>, ProviderError> {
        let (provider, token, created) = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().lifecycle().is_disposed() {
                    let provider = Arc::new((self.factory)(key)?);
                    let token = provider.lifecycle().acquire_usage();
                    occupied.insert(Arc::clone(&provider));
                    (provider, token, true)
                } else {
                    let provider = Arc::clone(occupied.get());
                    let token = provider.lifecycle().acquire_usage();
                    (provider, token, false)
                }
            }
            Entry::Vacant(vacant) => {
                let provider = Arc::new((self.factory)(key)?);
                let token = provider.lifecycle().acquire_usage();
                vacant.insert(Arc::clone(&provider));
                (provider, token, true)
            }
        };

        if created {
            self.created.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(store = self.kind, provider = %provider.name(), "Provider created");
            provider.start();
        }

        Ok(ProviderLease { provider, token })
    }

    /// Evict and dispose every provider that is unreferenced or already
    /// disposed. Returns the number evicted.
    pub fn collect(&self) -> usize {
        let candidates: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| is_collectable(entry.value().as_ref()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            let removed = self
                .entries
                .remove_if(&key, |_, provider| is_collectable(provider.as_ref()));
            if let Some((_, provider)) = removed {
                tracing::debug!(store = self.kind, provider = %provider.name(), "Provider evicted");
                provider.lifecycle().dispose(DisposeReason::Requested);
                evicted += 1;
            }
        }
        evicted
    }

    /// Dispose and drop every provider regardless of usage.
    pub fn dispose_all(&self) {
        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, provider)) = self.entries.remove(&key) {
                provider.lifecycle().dispose(DisposeReason::Requested);
            }
        }
    }

    /// True when a provider is stored under `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no providers are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total providers this store has constructed.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Status of every stored provider.
    #[must_use]
    pub fn statuses(&self) -> Vec<ProviderStatus> {
        let mut statuses: Vec<ProviderStatus> = self
            .entries
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

fn is_collectable<P: TickProvider + ?Sized>(provider: &P) -> bool {
    let lifecycle = provider.lifecycle();
    lifecycle.use_count() == 0 || lifecycle.is_disposed()
}
