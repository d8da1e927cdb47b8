//! Lock Coordinator
//!
//! Grants read or write access to the controller-wide maps and to single
//! resource definitions. Targets are always acquired in their `Ord` order
//! (maps before resource definitions), which keeps concurrent requests from
//! deadlocking each other.

use crate::error::{Error, Result};
use crate::model::ResourceName;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::trace;

/// Controller-wide lockable maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockObj {
    NodesMap,
    RscDfnMap,
    StorPoolDfnMap,
    CtrlConfig,
}

impl LockObj {
    const ALL: [LockObj; 4] = [
        LockObj::NodesMap,
        LockObj::RscDfnMap,
        LockObj::StorPoolDfnMap,
        LockObj::CtrlConfig,
    ];
}

/// Something that can be locked
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockTarget {
    Map(LockObj),
    ResourceDefinition(ResourceName),
}

impl std::fmt::Display for LockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockTarget::Map(obj) => write!(f, "{:?}", obj),
            LockTarget::ResourceDefinition(name) => write!(f, "RscDfn({})", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Read,
    Write,
}

/// A set of targets with the mode each is wanted in
#[derive(Debug, Clone, Default)]
pub struct LockRequest {
    targets: BTreeMap<LockTarget, LockMode>,
}

impl LockRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(self, target: LockTarget) -> Self {
        self.with(target, LockMode::Read)
    }

    /// Write mode wins over an earlier read of the same target
    pub fn write(self, target: LockTarget) -> Self {
        self.with(target, LockMode::Write)
    }

    fn with(mut self, target: LockTarget, mode: LockMode) -> Self {
        let entry = self.targets.entry(target).or_insert(mode);
        *entry = (*entry).max(mode);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn targets(&self) -> impl Iterator<Item = (&LockTarget, &LockMode)> {
        self.targets.iter()
    }
}

type ResourceLocks = DashMap<ResourceName, Arc<RwLock<()>>>;

enum HeldGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Guards of one granted request
///
/// Everything is released when the scope is released or dropped, on every
/// exit path.
pub struct LockScope {
    guards: Vec<(LockTarget, HeldGuard)>,
    resource_locks: Arc<ResourceLocks>,
}

impl LockScope {
    /// Release all held locks; calling it again does nothing
    pub fn release(&mut self) {
        if !self.guards.is_empty() {
            trace!(count = self.guards.len(), "Releasing locks");
        }
        // reverse acquisition order
        while let Some((target, guard)) = self.guards.pop() {
            drop(guard);
            if let LockTarget::ResourceDefinition(name) = target {
                // nobody holds or waits for it once only the registry refers to it
                self.resource_locks
                    .remove_if(&name, |_, lock| Arc::strong_count(lock) == 1);
            }
        }
    }

    pub fn is_held(&self) -> bool {
        !self.guards.is_empty()
    }

    pub fn holds(&self, target: &LockTarget, mode: LockMode) -> bool {
        self.guards.iter().any(|(t, g)| {
            t == target
                && match (g, mode) {
                    (HeldGuard::Write(_), _) => true,
                    (HeldGuard::Read(_), LockMode::Read) => true,
                    (HeldGuard::Read(_), LockMode::Write) => false,
                }
        })
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held: Vec<String> = self.guards.iter().map(|(t, _)| t.to_string()).collect();
        f.debug_struct("LockScope").field("held", &held).finish()
    }
}

/// Coordinator of all controller locks
///
/// Waiters are served first-in first-out, so a queued writer is not
/// starved by a stream of readers.
#[derive(Debug)]
pub struct LockCoordinator {
    maps: BTreeMap<LockObj, Arc<RwLock<()>>>,
    resource_definitions: Arc<ResourceLocks>,
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self {
            maps: LockObj::ALL
                .iter()
                .map(|obj| (*obj, Arc::new(RwLock::new(()))))
                .collect(),
            resource_definitions: Arc::new(DashMap::new()),
        }
    }

    /// Resource definitions that currently have a lock held or awaited
    pub fn resource_lock_count(&self) -> usize {
        self.resource_definitions.len()
    }

    fn lock_for(&self, target: &LockTarget) -> Result<Arc<RwLock<()>>> {
        match target {
            LockTarget::Map(obj) => self
                .maps
                .get(obj)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("no lock for {:?}", obj))),
            LockTarget::ResourceDefinition(name) => Ok(self
                .resource_definitions
                .entry(name.clone())
                .or_insert_with(|| Arc::new(RwLock::new(())))
                .clone()),
        }
    }

    /// Acquire every target in the same mode
    pub async fn acquire(&self, targets: &[LockTarget], mode: LockMode) -> Result<LockScope> {
        let request = targets
            .iter()
            .cloned()
            .fold(LockRequest::new(), |req, target| req.with(target, mode));
        self.acquire_request(&request).await
    }

    /// Acquire a mixed request; blocks until all targets are granted
    pub async fn acquire_request(&self, request: &LockRequest) -> Result<LockScope> {
        if request.is_empty() {
            return Err(Error::Internal("lock request without targets".into()));
        }

        let mut scope = LockScope {
            guards: Vec::with_capacity(request.targets.len()),
            resource_locks: self.resource_definitions.clone(),
        };
        for (target, mode) in request.targets() {
            let lock = self.lock_for(target)?;
            let guard = match mode {
                LockMode::Read => HeldGuard::Read(lock.read_owned().await),
                LockMode::Write => HeldGuard::Write(lock.write_owned().await),
            };
            trace!(target = %target, mode = ?mode, "Lock granted");
            scope.guards.push((target.clone(), guard));
        }
        Ok(scope)
    }
}
