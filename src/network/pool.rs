//! Package Pool
//!
//! Reusable fixed-size receive buffers handed from socket reader tasks to the
//! tick. A package moves `Free -> InUse -> PendingDispatch -> Free`; the
//! reader owns it while `InUse`, the dispatcher owns it while
//! `PendingDispatch`. The pool never shrinks.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::DispatchOrder;
use crate::protocol::NetId;

/// Index of a package inside its pool.
pub type PackageId = usize;

/// Package lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    /// Available for `acquire`.
    Free,
    /// Claimed by a receive, not yet visible to the dispatcher.
    InUse,
    /// Holds one undecoded batch.
    PendingDispatch,
}

/// Pool errors. Every one of them is a caller bug, not a network condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// No package with this id.
    #[error("unknown package {0}")]
    UnknownPackage(PackageId),

    /// Operation not legal in the package's current state.
    #[error("package {id} is {actual:?}, expected {expected:?}")]
    IllegalTransition {
        /// Package.
        id: PackageId,
        /// Required state.
        expected: PackageState,
        /// Found state.
        actual: PackageState,
    },

    /// More bytes than the fixed buffer holds.
    #[error("{len} bytes exceed package capacity {capacity}")]
    Oversize {
        /// Bytes offered.
        len: usize,
        /// Buffer size.
        capacity: usize,
    },
}

/// One pooled receive buffer.
#[derive(Debug)]
struct Package {
    state: PackageState,
    data: Vec<u8>,
    len: usize,
    origin: Option<NetId>,
    arrival: u64,
}

impl Package {
    fn new(capacity: usize) -> Self {
        Self {
            state: PackageState::Free,
            data: vec![0; capacity],
            len: 0,
            origin: None,
            arrival: 0,
        }
    }

    fn expect(&self, id: PackageId, expected: PackageState) -> Result<(), PoolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PoolError::IllegalTransition { id, expected, actual: self.state })
        }
    }

    fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
        self.origin = None;
        self.state = PackageState::Free;
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    packages: Vec<Package>,
    next_arrival: u64,
}

/// Growable pool of receive buffers, shared between reader tasks and the tick.
#[derive(Debug)]
pub struct PackagePool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl PackagePool {
    /// Create a pool of `initial` free packages of `capacity` bytes each.
    pub fn new(capacity: usize, initial: usize) -> Self {
        let packages = (0..initial).map(|_| Package::new(capacity)).collect();
        Self {
            capacity,
            inner: Mutex::new(PoolInner { packages, next_arrival: 0 }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes per package.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the first free package, growing the pool if none is free.
    pub fn acquire(&self) -> PackageId {
        let mut inner = self.lock();
        if let Some(id) = inner.packages.iter().position(|p| p.state == PackageState::Free) {
            inner.packages[id].state = PackageState::InUse;
            return id;
        }
        let mut package = Package::new(self.capacity);
        package.state = PackageState::InUse;
        inner.packages.push(package);
        let id = inner.packages.len() - 1;
        tracing::trace!(id, "package pool grew");
        id
    }

    /// Copy received bytes into an `InUse` package.
    pub fn fill(&self, id: PackageId, origin: NetId, bytes: &[u8]) -> Result<(), PoolError> {
        if bytes.len() > self.capacity {
            return Err(PoolError::Oversize { len: bytes.len(), capacity: self.capacity });
        }
        let mut inner = self.lock();
        let package = inner.packages.get_mut(id).ok_or(PoolError::UnknownPackage(id))?;
        package.expect(id, PackageState::InUse)?;
        package.data[..bytes.len()].copy_from_slice(bytes);
        package.len = bytes.len();
        package.origin = Some(origin);
        Ok(())
    }

    /// Make an `InUse` package visible to the dispatcher.
    pub fn publish(&self, id: PackageId) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let arrival = inner.next_arrival;
        let package = inner.packages.get_mut(id).ok_or(PoolError::UnknownPackage(id))?;
        package.expect(id, PackageState::InUse)?;
        package.state = PackageState::PendingDispatch;
        package.arrival = arrival;
        inner.next_arrival += 1;
        Ok(())
    }

    /// Acquire, fill and publish in one step (reader task path).
    pub fn receive(&self, origin: NetId, bytes: &[u8]) -> Result<PackageId, PoolError> {
        let id = self.acquire();
        if let Err(err) = self.fill(id, origin, bytes) {
            self.abandon(id)?;
            return Err(err);
        }
        self.publish(id)?;
        Ok(id)
    }

    /// Pending packages in dispatch order.
    pub fn pending(&self, order: DispatchOrder) -> Vec<PackageId> {
        let inner = self.lock();
        let mut ids: Vec<(u64, PackageId)> = inner
            .packages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PackageState::PendingDispatch)
            .map(|(id, p)| (p.arrival, id))
            .collect();
        if order == DispatchOrder::Arrival {
            ids.sort_unstable();
        }
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Copy a pending package's bytes into `out`, returning its origin.
    pub fn read(&self, id: PackageId, out: &mut Vec<u8>) -> Result<NetId, PoolError> {
        let inner = self.lock();
        let package = inner.packages.get(id).ok_or(PoolError::UnknownPackage(id))?;
        package.expect(id, PackageState::PendingDispatch)?;
        out.clear();
        out.extend_from_slice(&package.data[..package.len]);
        Ok(package.origin.unwrap_or(NetId(0)))
    }

    /// Return a dispatched package to the free list.
    pub fn release(&self, id: PackageId) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let package = inner.packages.get_mut(id).ok_or(PoolError::UnknownPackage(id))?;
        package.expect(id, PackageState::PendingDispatch)?;
        package.clear();
        Ok(())
    }

    /// Return a claimed but never published package.
    pub fn abandon(&self, id: PackageId) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let package = inner.packages.get_mut(id).ok_or(PoolError::UnknownPackage(id))?;
        package.expect(id, PackageState::InUse)?;
        package.clear();
        Ok(())
    }

    /// State of one package.
    pub fn state(&self, id: PackageId) -> Option<PackageState> {
        self.lock().packages.get(id).map(|p| p.state)
    }

    /// Total packages owned.
    pub fn len(&self) -> usize {
        self.lock().packages.len()
    }

    /// True if the pool owns no packages.
    pub fn is_empty(&self) -> bool {
        self.lock().packages.is_empty()
    }

    /// Packages currently `Free`.
    pub fn free_count(&self) -> usize {
        self.lock().packages.iter().filter(|p| p.state == PackageState::Free).count()
    }

    /// Packages waiting for dispatch.
    pub fn pending_count(&self) -> usize {
        self.lock().packages.iter().filter(|p| p.state == PackageState::PendingDispatch).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_acquire_reuses_first_free() {
        let pool = PackagePool::new(16, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!((a, b), (0, 1));

        pool.abandon(a).unwrap();
        assert_eq!(pool.acquire(), 0);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_grows_only_when_exhausted() {
        let pool = PackagePool::new(16, 1);
        pool.acquire();
        assert_eq!(pool.acquire(), 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_full_lifecycle() {
        let pool = PackagePool::new(8, 0);
        let id = pool.receive(NetId(3), &[1, 2, 3]).unwrap();
        assert_eq!(pool.state(id), Some(PackageState::PendingDispatch));

        let mut out = Vec::new();
        assert_eq!(pool.read(id, &mut out).unwrap(), NetId(3));
        assert_eq!(out, vec![1, 2, 3]);

        pool.release(id).unwrap();
        assert_eq!(pool.state(id), Some(PackageState::Free));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_illegal_transitions() {
        let pool = PackagePool::new(8, 1);
        assert_eq!(
            pool.release(0),
            Err(PoolError::IllegalTransition {
                id: 0,
                expected: PackageState::PendingDispatch,
                actual: PackageState::Free,
            })
        );

        let id = pool.acquire();
        assert!(pool.release(id).is_err());
        assert!(pool.fill(id, NetId(1), &[0; 9]).is_err());
        pool.publish(id).unwrap();
        assert!(pool.publish(id).is_err());
        pool.release(id).unwrap();
        assert!(pool.release(id).is_err());
        assert_eq!(pool.release(7), Err(PoolError::UnknownPackage(7)));
    }

    #[test]
    fn test_dispatch_order() {
        let pool = PackagePool::new(4, 3);
        // Occupy slot 0 so the first arrival lands in slot 1.
        let held = pool.acquire();
        let first = pool.receive(NetId(1), &[1]).unwrap();
        pool.abandon(held).unwrap();
        let second = pool.receive(NetId(2), &[2]).unwrap();
        assert_eq!((first, second), (1, 0));

        assert_eq!(pool.pending(DispatchOrder::Arrival), vec![1, 0]);
        assert_eq!(pool.pending(DispatchOrder::PoolSlot), vec![0, 1]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive,
        Acquire,
        ReleaseOldest,
        AbandonOne,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Receive), Just(Op::Acquire), Just(Op::ReleaseOldest), Just(Op::AbandonOne)]
    }

    proptest! {
        #[test]
        fn prop_pool_never_loses_or_double_hands_out(ops in prop::collection::vec(arb_op(), 1..200)) {
            let pool = PackagePool::new(4, 2);
            let mut claimed: Vec<PackageId> = Vec::new();

            for op in ops {
                match op {
                    Op::Receive => {
                        let id = pool.receive(NetId(1), &[9]).unwrap();
                        prop_assert!(!claimed.contains(&id));
                    }
                    Op::Acquire => {
                        let id = pool.acquire();
                        prop_assert!(!claimed.contains(&id));
                        prop_assert!(pool.pending(DispatchOrder::PoolSlot).iter().all(|p| *p != id));
                        claimed.push(id);
                    }
                    Op::ReleaseOldest => {
                        if let Some(id) = pool.pending(DispatchOrder::Arrival).first().copied() {
                            pool.release(id).unwrap();
                            prop_assert!(pool.release(id).is_err());
                        }
                    }
                    Op::AbandonOne => {
                        if let Some(id) = claimed.pop() {
                            pool.abandon(id).unwrap();
                        }
                    }
                }
                prop_assert_eq!(
                    pool.free_count() + pool.pending_count() + claimed.len(),
                    pool.len()
                );
            }
        }
    }
}
