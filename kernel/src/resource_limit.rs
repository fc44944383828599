//! Per-process quotas with atomic-or-nothing reservation and optional
//! blocking until capacity frees up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::class_token::ObjectKind;
use crate::object::{AutoObject, ObjRef, ObjectCore, ObjectCounters, TypedObject};
use crate::result::{KResult, KernelError};

/// Quota categories tracked per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitableResource {
    /// Bytes of guest physical memory.
    PhysicalMemory,
    /// Live thread count.
    Threads,
    /// Live event-pair count.
    Events,
    /// Live transfer-memory count.
    TransferMemory,
    /// Live session count.
    Sessions,
}

impl LimitableResource {
    /// All categories, in table order.
    pub const ALL: [LimitableResource; 5] = [
        LimitableResource::PhysicalMemory,
        LimitableResource::Threads,
        LimitableResource::Events,
        LimitableResource::TransferMemory,
        LimitableResource::Sessions,
    ];

    const fn index(self) -> usize {
        match self {
            LimitableResource::PhysicalMemory => 0,
            LimitableResource::Threads => 1,
            LimitableResource::Events => 2,
            LimitableResource::TransferMemory => 3,
            LimitableResource::Sessions => 4,
        }
    }
}

const NUM_RESOURCES: usize = 5;

#[derive(Debug, Clone, Copy)]
struct Values {
    limit: [i64; NUM_RESOURCES],
    current: [i64; NUM_RESOURCES],
    peak: [i64; NUM_RESOURCES],
}

/// A quota tracker. One instance per process plus one system-wide instance.
///
/// `current <= limit` holds for every category at every observable instant;
/// reservations either take the whole requested amount or change nothing.
pub struct KResourceLimit {
    core: ObjectCore,
    values: Mutex<Values>,
    capacity_freed: Condvar,
}

impl KResourceLimit {
    /// Create a limit with all categories at zero capacity.
    pub fn new(counters: &Arc<ObjectCounters>) -> ObjRef<KResourceLimit> {
        ObjRef::new(KResourceLimit {
            core: ObjectCore::new(counters, ObjectKind::ResourceLimit),
            values: Mutex::new(Values {
                limit: [0; NUM_RESOURCES],
                current: [0; NUM_RESOURCES],
                peak: [0; NUM_RESOURCES],
            }),
            capacity_freed: Condvar::new(),
        })
    }

    /// Raise or lower a category's limit. Fails with `InvalidState` if the
    /// new limit is below current usage.
    pub fn set_limit_value(&self, resource: LimitableResource, value: i64) -> KResult<()> {
        let mut values = self.values.lock();
        let index = resource.index();
        if values.current[index] > value {
            return Err(KernelError::InvalidState);
        }
        values.limit[index] = value;
        drop(values);
        self.capacity_freed.notify_all();
        Ok(())
    }

    /// Configured limit of a category.
    pub fn limit_value(&self, resource: LimitableResource) -> i64 {
        self.values.lock().limit[resource.index()]
    }

    /// Current usage of a category.
    pub fn current_value(&self, resource: LimitableResource) -> i64 {
        self.values.lock().current[resource.index()]
    }

    /// High-water mark of a category. Never decreases.
    pub fn peak_value(&self, resource: LimitableResource) -> i64 {
        self.values.lock().peak[resource.index()]
    }

    /// Remaining capacity of a category.
    pub fn free_value(&self, resource: LimitableResource) -> i64 {
        let values = self.values.lock();
        let index = resource.index();
        values.limit[index] - values.current[index]
    }

    /// Reserve `value` units of `resource`, or fail with `LimitReached`.
    ///
    /// Without a timeout the check is immediate. With a timeout the call
    /// blocks until capacity frees or the deadline passes, re-checking the
    /// predicate on each wake to absorb spurious wakeups. The reservation is
    /// all-or-nothing.
    pub fn reserve(
        &self,
        resource: LimitableResource,
        value: i64,
        timeout: Option<Duration>,
    ) -> KResult<()> {
        debug_assert!(value >= 0);
        let index = resource.index();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut values = self.values.lock();
        loop {
            if values.current[index] + value <= values.limit[index] {
                values.current[index] += value;
                values.peak[index] = values.peak[index].max(values.current[index]);
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .capacity_freed
                        .wait_until(&mut values, deadline)
                        .timed_out()
                    {
                        return Err(KernelError::LimitReached);
                    }
                }
                None => return Err(KernelError::LimitReached),
            }
        }
    }

    /// Release previously reserved units. Always succeeds; wakes blocked
    /// reservers.
    pub fn release(&self, resource: LimitableResource, value: i64) {
        let index = resource.index();
        let mut values = self.values.lock();
        assert!(
            values.current[index] >= value,
            "resource-limit release underflow: {:?} current={} release={}",
            resource,
            values.current[index],
            value
        );
        values.current[index] -= value;
        drop(values);
        self.capacity_freed.notify_all();
    }
}

impl AutoObject for KResourceLimit {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl TypedObject for KResourceLimit {
    const KIND: ObjectKind = ObjectKind::ResourceLimit;
}
