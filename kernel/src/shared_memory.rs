//! Owner-tracked guest memory objects. Neither is waitable; their job is
//! holding a quota reservation for the lifetime of the mapping.

use std::any::Any;
use std::sync::Arc;

use crate::class_token::ObjectKind;
use crate::object::{AutoObject, ObjRef, ObjectCore, PostDestroyArg, TypedObject};
use crate::process::KProcess;
use crate::resource_limit::LimitableResource;
use crate::result::KResult;
use crate::KernelCore;

/// A block of guest-physical memory shareable across processes. Charges
/// `size` bytes of physical-memory quota against the owner.
pub struct KSharedMemory {
    core: ObjectCore,
    owner: ObjRef<KProcess>,
    address: u64,
    size: u64,
}

/// Memory transferred from a process for the duration of an operation.
/// Charges one unit of transfer-memory quota against the owner.
pub struct KTransferMemory {
    core: ObjectCore,
    owner: ObjRef<KProcess>,
    address: u64,
    size: u64,
}

impl KSharedMemory {
    pub fn new(
        kernel: &KernelCore,
        owner: &ObjRef<KProcess>,
        address: u64,
        size: u64,
    ) -> KResult<ObjRef<KSharedMemory>> {
        owner
            .resource_limit()
            .reserve(LimitableResource::PhysicalMemory, size as i64, None)?;
        Ok(ObjRef::new(KSharedMemory {
            core: ObjectCore::new(kernel.counters(), ObjectKind::SharedMemory),
            owner: owner.clone(),
            address,
            size,
        }))
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl KTransferMemory {
    pub fn new(
        kernel: &KernelCore,
        owner: &ObjRef<KProcess>,
        address: u64,
        size: u64,
    ) -> KResult<ObjRef<KTransferMemory>> {
        owner
            .resource_limit()
            .reserve(LimitableResource::TransferMemory, 1, None)?;
        Ok(ObjRef::new(KTransferMemory {
            core: ObjectCore::new(kernel.counters(), ObjectKind::TransferMemory),
            owner: owner.clone(),
            address,
            size,
        }))
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AutoObject for KSharedMemory {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn post_destroy_argument(&self) -> PostDestroyArg {
        PostDestroyArg::ReleaseResource {
            owner: self.owner.clone(),
            resource: LimitableResource::PhysicalMemory,
            amount: self.size as i64,
        }
    }
}

impl TypedObject for KSharedMemory {
    const KIND: ObjectKind = ObjectKind::SharedMemory;
}

impl AutoObject for KTransferMemory {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn post_destroy_argument(&self) -> PostDestroyArg {
        PostDestroyArg::ReleaseResource {
            owner: self.owner.clone(),
            resource: LimitableResource::TransferMemory,
            amount: 1,
        }
    }
}

impl TypedObject for KTransferMemory {
    const KIND: ObjectKind = ObjectKind::TransferMemory;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_memory_charges_physical_memory_until_dropped() {
        let kernel = KernelCore::new();
        let process = KProcess::new(&kernel, "owner");
        let limit = process.resource_limit();

        let before = limit.current_value(LimitableResource::PhysicalMemory);
        let shared = KSharedMemory::new(&kernel, &process, 0x2000, 0x1000).unwrap();
        assert_eq!(
            limit.current_value(LimitableResource::PhysicalMemory),
            before + 0x1000
        );
        assert_eq!(shared.address(), 0x2000);
        assert_eq!(shared.size(), 0x1000);

        drop(shared);
        assert_eq!(
            limit.current_value(LimitableResource::PhysicalMemory),
            before
        );
    }

    #[test]
    fn transfer_memory_charges_one_unit_until_dropped() {
        let kernel = KernelCore::new();
        let process = KProcess::new(&kernel, "owner");
        let limit = process.resource_limit();

        let before = limit.current_value(LimitableResource::TransferMemory);
        let transfer = KTransferMemory::new(&kernel, &process, 0x8000, 0x200).unwrap();
        assert_eq!(
            limit.current_value(LimitableResource::TransferMemory),
            before + 1
        );

        drop(transfer);
        assert_eq!(
            limit.current_value(LimitableResource::TransferMemory),
            before
        );
    }
}
