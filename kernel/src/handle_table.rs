//! Per-process handle table mapping small integer handles to object
//! references.
//!
//! A handle packs a slot index (bits 15 and up) and a generation value
//! (low 15 bits). Generations come from a wrapping counter and are stored
//! alongside the slot, so a stale handle whose slot has been reused fails
//! validation instead of aliasing the new occupant. The generation array of
//! free slots doubles as a free list so allocation never scans the table.

use parking_lot::Mutex;

use crate::object::{AutoObject, ObjRef, TypedObject};
use crate::result::{KResult, KernelError};

/// A per-process object handle. Zero is never a valid handle.
pub type Handle = u32;

/// The invalid handle constant.
pub const INVALID_HANDLE: Handle = 0;

/// Maximum number of live handles per process.
pub const MAX_HANDLES: usize = 1024;

const GENERATION_BITS: u32 = 15;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

struct Slots {
    objects: Vec<Option<ObjRef<dyn AutoObject>>>,
    /// Generation of occupied slots; next-free-slot link for empty ones.
    generations: Vec<u16>,
    table_size: u16,
    next_generation: u16,
    next_free_slot: u16,
    count: u16,
}

/// The handle table. All operations are constant-time.
pub struct HandleTable {
    slots: Mutex<Slots>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Create a table with the maximum size.
    pub fn new() -> Self {
        Self::with_size(MAX_HANDLES as u16)
    }

    /// Create a table limited to `table_size` live handles.
    pub fn with_size(table_size: u16) -> Self {
        assert!(table_size as usize <= MAX_HANDLES);
        let mut generations = vec![0u16; MAX_HANDLES];
        for (i, gen) in generations.iter_mut().enumerate() {
            *gen = (i + 1) as u16;
        }
        HandleTable {
            slots: Mutex::new(Slots {
                objects: (0..MAX_HANDLES).map(|_| None).collect(),
                generations,
                table_size,
                next_generation: 1,
                next_free_slot: 0,
                count: 0,
            }),
        }
    }

    /// Insert an object, taking ownership of the given reference. Returns
    /// the new handle or `OutOfHandles` if the table is full.
    pub fn add(&self, object: ObjRef<dyn AutoObject>) -> KResult<Handle> {
        let mut guard = self.slots.lock();
        let slots = &mut *guard;
        if slots.count >= slots.table_size {
            return Err(KernelError::OutOfHandles);
        }

        let slot = slots.next_free_slot;
        slots.next_free_slot = slots.generations[slot as usize];

        let generation = slots.next_generation;
        // Generation 0 is reserved so a valid handle can never be 0.
        slots.next_generation = if generation >= GENERATION_MASK as u16 {
            1
        } else {
            generation + 1
        };

        slots.generations[slot as usize] = generation;
        slots.objects[slot as usize] = Some(object);
        slots.count += 1;

        Ok(((slot as u32) << GENERATION_BITS) | generation as u32)
    }

    /// Whether `handle` currently resolves to an object.
    pub fn is_valid(&self, handle: Handle) -> bool {
        let slots = self.slots.lock();
        Self::resolve(&slots, handle).is_some()
    }

    /// Look up a handle, opening a new reference to the object.
    pub fn get(&self, handle: Handle) -> KResult<ObjRef<dyn AutoObject>> {
        let slots = self.slots.lock();
        match Self::resolve(&slots, handle) {
            Some(slot) => Ok(slots.objects[slot].as_ref().unwrap().clone()),
            None => Err(KernelError::InvalidHandle),
        }
    }

    /// Look up a handle as a concrete type, using the class token for the
    /// type check. Wrong type is indistinguishable from a dangling handle.
    pub fn get_typed<T: TypedObject>(&self, handle: Handle) -> KResult<ObjRef<T>> {
        self.get(handle)?
            .downcast::<T>()
            .map_err(|_| KernelError::InvalidHandle)
    }

    /// Insert another handle referencing the same object.
    pub fn duplicate(&self, handle: Handle) -> KResult<Handle> {
        let object = self.get(handle)?;
        self.add(object)
    }

    /// Close a handle. Returns false if it was not valid. The object
    /// reference held by the slot is released.
    pub fn remove(&self, handle: Handle) -> bool {
        let released = {
            let mut guard = self.slots.lock();
            let slots = &mut *guard;
            let Some(slot) = Self::resolve(slots, handle) else {
                return false;
            };
            let released = slots.objects[slot].take();
            slots.generations[slot] = slots.next_free_slot;
            slots.next_free_slot = slot as u16;
            slots.count -= 1;
            released
        };
        // Close outside the table lock; destruction may take other locks.
        drop(released);
        true
    }

    /// Close every handle in the table.
    pub fn clear(&self) {
        let released: Vec<_> = {
            let mut guard = self.slots.lock();
            let slots = &mut *guard;
            let drained: Vec<_> = slots
                .objects
                .iter_mut()
                .filter_map(|entry| entry.take())
                .collect();
            for (i, gen) in slots.generations.iter_mut().enumerate() {
                *gen = (i + 1) as u16;
            }
            slots.next_free_slot = 0;
            slots.count = 0;
            drained
        };
        drop(released);
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots.lock().count as usize
    }

    /// Whether the table holds no handles.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(slots: &Slots, handle: Handle) -> Option<usize> {
        if handle == INVALID_HANDLE {
            return None;
        }
        let slot = (handle >> GENERATION_BITS) as usize;
        let generation = (handle & GENERATION_MASK) as u16;
        if slot >= slots.table_size as usize || slots.objects[slot].is_none() {
            return None;
        }
        if slots.generations[slot] != generation {
            return None;
        }
        Some(slot)
    }
}
