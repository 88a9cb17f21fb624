// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Domain lookup with scoped release.

use crate::domain::Domain;
use hvm_defs::DomainId;
use hvm_defs::HvmError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Resolves domain ids to live domains.
///
/// A reference returned by [`lock_domain`](Self::lock_domain) keeps the domain
/// from being freed until it is passed back to
/// [`unlock_domain`](Self::unlock_domain). It does not serialize anything
/// else.
pub trait DomainDirectory: Send + Sync {
    /// Looks up `id`, resolving [`DomainId::SELF`] to `caller`.
    fn lock_domain(&self, id: DomainId, caller: DomainId) -> Option<Arc<Domain>>;

    /// Releases a reference returned by `lock_domain`.
    fn unlock_domain(&self, domain: &Domain);
}

/// A domain reference that is released when dropped.
pub struct DomainHandle<'a> {
    directory: &'a dyn DomainDirectory,
    domain: Arc<Domain>,
}

impl<'a> DomainHandle<'a> {
    /// Locks the domain named by `id`, which may be [`DomainId::SELF`].
    pub fn lock_by_any_id(
        directory: &'a dyn DomainDirectory,
        id: DomainId,
        caller: DomainId,
    ) -> Result<Self, HvmError> {
        let domain = directory
            .lock_domain(id, caller)
            .ok_or(HvmError::NoSuchDomain(id))?;
        Ok(Self { directory, domain })
    }

    /// Locks the calling domain.
    pub fn lock_current(
        directory: &'a dyn DomainDirectory,
        caller: DomainId,
    ) -> Result<Self, HvmError> {
        Self::lock_by_any_id(directory, DomainId::SELF, caller)
    }
}

impl Deref for DomainHandle<'_> {
    type Target = Domain;

    fn deref(&self) -> &Domain {
        &self.domain
    }
}

impl Drop for DomainHandle<'_> {
    fn drop(&mut self) {
        self.directory.unlock_domain(&self.domain);
    }
}

impl fmt::Debug for DomainHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DomainHandle").field(&self.domain.id()).finish()
    }
}

/// An in-memory [`DomainDirectory`].
#[derive(Default)]
pub struct DomainTable {
    domains: RwLock<BTreeMap<DomainId, Arc<Domain>>>,
    outstanding: AtomicUsize,
}

impl DomainTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `domain`, returning it back if its id is already present.
    pub fn insert(&self, domain: Arc<Domain>) -> Result<(), Arc<Domain>> {
        let mut domains = self.domains.write();
        if domains.contains_key(&domain.id()) {
            return Err(domain);
        }
        domains.insert(domain.id(), domain);
        Ok(())
    }

    /// Removes a domain. It is freed once the last handle is released.
    pub fn remove(&self, id: DomainId) -> Option<Arc<Domain>> {
        self.domains.write().remove(&id)
    }

    /// The number of handles that have been taken and not yet released.
    pub fn outstanding_handles(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl DomainDirectory for DomainTable {
    fn lock_domain(&self, id: DomainId, caller: DomainId) -> Option<Arc<Domain>> {
        let id = if id == DomainId::SELF { caller } else { id };
        let domain = self.domains.read().get(&id).cloned()?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(domain)
    }

    fn unlock_domain(&self, domain: &Domain) {
        let prev = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0, "unbalanced unlock of {}", domain.id());
    }
}
