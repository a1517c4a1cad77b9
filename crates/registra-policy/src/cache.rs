//! Response caching over resource-policy evaluation.
//!
//! Decisions are memoized under a digest of (policy name, context user,
//! actor, resource) until their expiry elapses, and indexed by actor and
//! resource identifier so a record write can invalidate every decision it
//! touched. Assembled policies are memoized separately. The cache registers
//! itself with an explicit [`CacheRegistry`] owned by the evaluation
//! context; closing the cache clears it and deregisters.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use registra_core::Record;
use sha2::{Digest, Sha256};

use crate::assemble::PolicyAssembler;
use crate::error::{PolicyError, PolicyResult};
use crate::model::{Policy, PolicyResponse};

const MAX_ENTRIES: usize = 10_000;
const MAX_AGE: Duration = Duration::from_secs(360);

fn digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Explicit registry of live response caches.
///
/// Owned by the evaluation context rather than living in a process global;
/// record writers invalidate through it without holding references to the
/// individual caches.
#[derive(Default)]
pub struct CacheRegistry {
    providers: DashMap<u64, Arc<ResponseCache>>,
    next_id: AtomicU64,
}

impl CacheRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, cache: Arc<ResponseCache>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.providers.insert(id, cache);
        id
    }

    fn deregister(&self, id: u64) {
        self.providers.remove(&id);
    }

    /// Invalidate the record across every registered cache.
    pub fn invalidate(&self, record: &Record) {
        for entry in self.providers.iter() {
            entry.value().invalidate(record);
        }
    }

    /// Clear every registered cache.
    pub fn clear_all(&self) {
        for entry in self.providers.iter() {
            entry.value().clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Caching decorator over [`PolicyAssembler::evaluate_resource_policy`].
pub struct ResponseCache {
    assembler: PolicyAssembler,
    responses: DashMap<String, PolicyResponse>,
    policies: DashMap<String, Policy>,
    actor_index: DashMap<String, Vec<String>>,
    resource_index: DashMap<String, Vec<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshed: Mutex<Instant>,
    registry: Option<Arc<CacheRegistry>>,
    registry_id: AtomicU64,
}

impl ResponseCache {
    /// Wrap an assembler, registering with the registry when one is given.
    pub fn new(assembler: PolicyAssembler, registry: Option<Arc<CacheRegistry>>) -> Arc<Self> {
        let cache = Arc::new(Self {
            assembler,
            responses: DashMap::new(),
            policies: DashMap::new(),
            actor_index: DashMap::new(),
            resource_index: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshed: Mutex::new(Instant::now()),
            registry: registry.clone(),
            registry_id: AtomicU64::new(0),
        });
        if let Some(registry) = registry {
            let id = registry.register(cache.clone());
            cache.registry_id.store(id, Ordering::SeqCst);
        }
        cache
    }

    #[must_use]
    pub fn assembler(&self) -> &PolicyAssembler {
        &self.assembler
    }

    fn context_key(
        context_user: &Record,
        policy_name: &str,
        actor: &Record,
        resource_id: &str,
    ) -> PolicyResult<String> {
        let context_urn = context_user
            .urn
            .as_deref()
            .ok_or_else(|| PolicyError::value("Expected a context user with a urn"))?;
        let actor_urn = actor
            .urn
            .as_deref()
            .ok_or_else(|| PolicyError::value("Expected an actor with a urn"))?;
        Ok(format!(
            "{policy_name}-{context_urn}-{actor_urn}-{resource_id}"
        ))
    }

    /// Evaluate through the cache.
    ///
    /// A cached response is returned as long as it has not expired; an
    /// expired entry is evicted and recomputed. The check-then-populate
    /// sequence on a miss is not atomic: concurrent misses may recompute
    /// the same decision, and both writes are equivalent.
    pub async fn evaluate_resource_policy(
        &self,
        context_user: &Record,
        policy_name: &str,
        actor: &Record,
        token: Option<&str>,
        resource: &Record,
    ) -> PolicyResult<PolicyResponse> {
        let resource_id = resource.identifier();
        let key = Self::context_key(context_user, policy_name, actor, &resource_id)?;
        let hash = digest(&key);

        if let Some(entry) = self.responses.get(&hash) {
            if entry.is_expired() {
                tracing::debug!(policy = policy_name, "Cached response expired");
                drop(entry);
                self.responses.remove(&hash);
            } else {
                tracing::debug!(policy = policy_name, "Cache hit");
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let response = self
            .assembler
            .evaluate_resource_policy(context_user, policy_name, actor, token, resource)
            .await?;
        self.sweep();
        self.store(hash, response.clone(), actor.urn.as_deref(), &resource_id);
        Ok(response)
    }

    /// Assemble through the policy cache.
    pub async fn resource_policy(
        &self,
        name: &str,
        actor: &Record,
        token: Option<&str>,
        resource: &Record,
    ) -> PolicyResult<Option<Policy>> {
        let key = format!(
            "{name}-{}-{}-{}",
            actor.urn.as_deref().unwrap_or_default(),
            token.unwrap_or_default(),
            resource.identifier()
        );
        let hash = digest(&key);
        if let Some(policy) = self.policies.get(&hash) {
            return Ok(Some(policy.clone()));
        }
        let policy = self
            .assembler
            .resource_policy(name, actor, token, resource)
            .await?;
        if let Some(policy) = &policy {
            self.policies.insert(hash, policy.clone());
        }
        Ok(policy)
    }

    fn store(
        &self,
        hash: String,
        response: PolicyResponse,
        actor_urn: Option<&str>,
        resource_id: &str,
    ) {
        if self.responses.contains_key(&hash) {
            return;
        }
        if let Some(actor_urn) = actor_urn {
            self.actor_index
                .entry(actor_urn.to_string())
                .or_default()
                .push(hash.clone());
        }
        self.resource_index
            .entry(resource_id.to_string())
            .or_default()
            .push(hash.clone());
        self.responses.insert(hash, response);
    }

    /// Wholesale reset once the cache is too old or too large.
    fn sweep(&self) {
        let mut refreshed = match self.refreshed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stale = refreshed.elapsed() > MAX_AGE
            || self.responses.len() > MAX_ENTRIES
            || self.actor_index.len() > MAX_ENTRIES
            || self.resource_index.len() > MAX_ENTRIES;
        if stale {
            tracing::info!("Clearing policy response cache");
            *refreshed = Instant::now();
            self.responses.clear();
            self.actor_index.clear();
            self.resource_index.clear();
        }
    }

    /// Drop every decision the record participated in, as actor or as
    /// resource.
    pub fn invalidate(&self, record: &Record) {
        let id = record.identifier();
        let mut keys = Vec::new();
        if let Some((_, actor_keys)) = self.actor_index.remove(&id) {
            keys.extend(actor_keys);
        }
        if let Some((_, resource_keys)) = self.resource_index.remove(&id) {
            keys.extend(resource_keys);
        }
        for key in keys {
            self.responses.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.responses.clear();
        self.policies.clear();
        self.actor_index.clear();
        self.resource_index.clear();
    }

    /// Clear and deregister from the owning registry.
    pub fn close(&self) {
        self.clear();
        if let Some(registry) = &self.registry {
            let id = self.registry_id.load(Ordering::SeqCst);
            if id != 0 {
                registry.deregister(id);
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
