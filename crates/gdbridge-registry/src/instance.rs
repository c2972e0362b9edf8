//! Slot table of live extension instances.
//!
//! Each class owns one table. Slots are reused through a free list; every
//! reuse bumps the slot's generation so that [`InstanceHandle`]s issued for
//! the previous occupant stop resolving. A slot that reaches the last
//! generation is never reused.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use gdbridge_core::lifetime::Lifetime;
use gdbridge_core::object::{Acquire, Object};
use gdbridge_core::sys::{InstanceId, ObjectPtr};

use crate::handle::{ClassId, InstanceHandle};

pub(crate) type InstanceCell = Arc<Mutex<Box<dyn Any + Send>>>;

/// Engine object an extension instance is attached to.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Base {
    ptr: usize,
    instance_id: InstanceId,
}

impl Base {
    pub(crate) fn new(ptr: ObjectPtr, instance_id: InstanceId) -> Self {
        Self { ptr: ptr as usize, instance_id }
    }

    pub fn ptr(&self) -> ObjectPtr {
        self.ptr as ObjectPtr
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// A borrowed handle to the base object in `life`.
    ///
    /// Only valid while the engine keeps the object alive, which holds for
    /// the duration of any call dispatched to the instance.
    pub fn to_object(&self, life: &Lifetime) -> Object {
        unsafe { Object::from_raw(life, self.ptr(), Acquire::Borrowed) }
    }
}

impl fmt::Debug for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Base").field("ptr", &format_args!("{:#x}", self.ptr)).field("instance_id", &self.instance_id).finish()
    }
}

/// Lifecycle of one instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Allocated by `create_instance`, not yet bound to its engine object.
    Created,
    /// Bound; virtual and method calls may be dispatched to it.
    Active,
    /// Released by `free_instance`; the slot is waiting for reuse.
    Freed,
}

struct Slot {
    generation: u16,
    state: InstanceState,
    base: Option<Base>,
    value: Option<InstanceCell>,
}

pub(crate) struct InstanceTable {
    class: ClassId,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl InstanceTable {
    pub(crate) fn new(class: ClassId) -> Self {
        Self { class, slots: Vec::new(), free: Vec::new(), live: 0 }
    }

    /// Stores a new instance, reusing the most recently freed slot.
    pub(crate) fn insert(&mut self, value: Box<dyn Any + Send>) -> InstanceHandle {
        let cell = Arc::new(Mutex::new(value));
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.state = InstanceState::Created;
            slot.base = None;
            slot.value = Some(cell);
            return InstanceHandle::new(self.class, slot.generation, index);
        }
        let index = match u32::try_from(self.slots.len()) {
            Ok(index) => index,
            Err(_) => panic!("{} has more instances than a handle can address", self.class),
        };
        self.slots.push(Slot { generation: 0, state: InstanceState::Created, base: None, value: Some(cell) });
        InstanceHandle::new(self.class, 0, index)
    }

    fn slot(&self, handle: InstanceHandle) -> Option<&Slot> {
        if handle.class() != Some(self.class) {
            return None;
        }
        self.slots.get(handle.slot() as usize).filter(|slot| slot.generation == handle.generation())
    }

    fn slot_mut(&mut self, handle: InstanceHandle) -> Option<&mut Slot> {
        if handle.class() != Some(self.class) {
            return None;
        }
        self.slots.get_mut(handle.slot() as usize).filter(|slot| slot.generation == handle.generation())
    }

    /// State of the slot `handle` addresses. Stale handles read as `Freed`.
    pub(crate) fn state(&self, handle: InstanceHandle) -> Option<InstanceState> {
        match self.slot(handle) {
            Some(slot) => Some(slot.state),
            None if handle.class() == Some(self.class) && (handle.slot() as usize) < self.slots.len() => {
                Some(InstanceState::Freed)
            }
            None => None,
        }
    }

    /// Binds a created instance to its engine object.
    ///
    /// # Panics
    ///
    /// If the handle is stale or the instance is already active.
    pub(crate) fn activate(&mut self, handle: InstanceHandle, base: Base) {
        let class = self.class;
        match self.slot_mut(handle) {
            Some(slot) if slot.state == InstanceState::Created => {
                slot.state = InstanceState::Active;
                slot.base = Some(base);
            }
            Some(slot) => panic!("{handle} of {class} cannot be activated while {:?}", slot.state),
            None => panic!("stale {handle} for {class}"),
        }
    }

    /// The instance and its base object, if `handle` addresses an active slot.
    pub(crate) fn get(&self, handle: InstanceHandle) -> Option<(InstanceCell, Base)> {
        let slot = self.slot(handle)?;
        match (slot.state, &slot.value, slot.base) {
            (InstanceState::Active, Some(value), Some(base)) => Some((Arc::clone(value), base)),
            _ => None,
        }
    }

    /// Releases the slot for reuse and returns the instance it held.
    ///
    /// # Panics
    ///
    /// If the handle is stale or the slot was already freed.
    pub(crate) fn remove(&mut self, handle: InstanceHandle) -> InstanceCell {
        let class = self.class;
        let slot = match self.slot_mut(handle) {
            Some(slot) if slot.state != InstanceState::Freed => slot,
            _ => panic!("{handle} of {class} freed twice or never created"),
        };
        slot.state = InstanceState::Freed;
        slot.base = None;
        let value = slot.value.take();
        // A slot whose generation cannot advance again is retired for good.
        if slot.generation < u16::MAX {
            self.free.push(handle.slot());
        }
        self.live -= 1;
        match value {
            Some(value) => value,
            None => panic!("{handle} of {class} held no instance"),
        }
    }

    /// Handles of all active instances.
    pub(crate) fn active(&self) -> Vec<InstanceHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == InstanceState::Active)
            .map(|(index, slot)| InstanceHandle::new(self.class, slot.generation, index as u32))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> InstanceTable {
        InstanceTable::new(ClassId::next())
    }

    fn base() -> Base {
        Base::new(0x1000 as ObjectPtr, 7)
    }

    #[test]
    fn created_then_active_then_freed() {
        let mut table = table();
        let handle = table.insert(Box::new(5u32));
        assert_eq!(table.state(handle), Some(InstanceState::Created));
        assert!(table.get(handle).is_none());
        table.activate(handle, base());
        assert_eq!(table.state(handle), Some(InstanceState::Active));
        let (cell, bound) = table.get(handle).unwrap();
        assert_eq!(bound, base());
        assert_eq!(cell.lock().unwrap().downcast_ref::<u32>(), Some(&5));
        table.remove(handle);
        assert_eq!(table.state(handle), Some(InstanceState::Freed));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn freed_slots_are_reused_with_a_new_generation() {
        let mut table = table();
        let first = table.insert(Box::new(1u32));
        table.activate(first, base());
        table.remove(first);
        let second = table.insert(Box::new(2u32));
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second.generation(), first.generation());
        table.activate(second, base());
        assert!(table.get(first).is_none());
        assert_eq!(table.state(first), Some(InstanceState::Freed));
        assert!(table.get(second).is_some());
        assert_eq!(table.capacity(), 1);
    }

    #[test]
    fn exhausted_slot_is_retired() {
        let mut table = table();
        let first = table.insert(Box::new(1u32));
        table.remove(first);
        table.slots[first.slot() as usize].generation = u16::MAX - 1;

        let last = table.insert(Box::new(2u32));
        assert_eq!(last.slot(), first.slot());
        assert_eq!(last.generation(), u16::MAX);
        table.remove(last);

        let next = table.insert(Box::new(3u32));
        assert_ne!(next.slot(), last.slot());
        assert_eq!(table.capacity(), 2);
        assert_eq!(table.state(last), Some(InstanceState::Freed));
        assert_eq!(table.state(InstanceHandle::new(last.class().unwrap(), 0, last.slot())), Some(InstanceState::Freed));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let mut table = table();
        let handle = table.insert(Box::new(1u32));
        table.remove(handle);
        table.remove(handle);
    }

    #[test]
    fn handles_of_other_classes_do_not_resolve() {
        let mut table = table();
        let handle = table.insert(Box::new(1u32));
        let foreign = InstanceHandle::new(ClassId::next(), handle.generation(), handle.slot());
        assert_eq!(table.state(foreign), None);
    }

    #[test]
    fn active_lists_bound_instances() {
        let mut table = table();
        let a = table.insert(Box::new(1u32));
        let b = table.insert(Box::new(2u32));
        table.activate(b, base());
        assert_eq!(table.active(), vec![b]);
        table.activate(a, base());
        assert_eq!(table.active().len(), 2);
    }
}
