//! Poison-tolerant lock helpers.
//!
//! Cache state is disposable: a panic while holding a lock leaves at worst a
//! stale entry, so guards are recovered instead of propagating the poison.

use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(
    result: LockResult<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind,
                result = "poisoned_recovered",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), target, op, "rwlock.read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), target, op, "rwlock.write")
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), target, op, "mutex.lock")
}
