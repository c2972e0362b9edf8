//! Engine object references and the ownership tracker.
//!
//! Every engine object the managed side holds is recorded once in the
//! [`ObjectTracker`], keyed by pointer. The record holds the ownership state
//! and how many managed handles refer to it. Each [`Object`] wrapper is one
//! such handle and is registered to a scope like any other native value.
//!
//! ```text
//!   (untracked) --take--> ManagedOwned --give--> EngineOwned
//!        |                    |                     |
//!        +--wrap/borrow-------+---------------------+--> Freed (free / pre-delete)
//!        +--singleton--> Frozen
//! ```
//!
//! The tracker is a pure state machine. It returns a [`NativeAction`] that the
//! [`Runtime`](crate::runtime::Runtime) performs after releasing the lock, so
//! engine callbacks fired by that action may re-enter the tracker.

use std::fmt;

use log::trace;
use rustc_hash::FxHashMap;

use crate::error::ConversionError;
use crate::frame::Slot;
use crate::lifetime::{Handle, HandleKind, Lifetime, RawHandle};
use crate::marshal::{FromNative, NativeType, ToNative};
use crate::sys::{ConstTypePtr, InstanceId, ObjectPtr, TypePtr};
use crate::types::VariantType;
use crate::variant::{FromVariant, ToVariant, Variant, decode, encode};

/// Ownership state of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Destroyed by the managed side once no handle refers to it.
    ManagedOwned,
    /// Referenced by the managed side but destroyed only by the engine.
    EngineOwned,
    /// An engine singleton; never destroyed or counted.
    Frozen,
    /// Destroyed; remaining handles are stale.
    Freed,
}

/// How a pointer arrived on the managed side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Newly constructed; reference-counted objects need their first reference initialized.
    Fresh,
    /// A result whose reference the engine passed along with it.
    Transferred,
    /// Lent by the engine; reference-counted objects take their own reference.
    Borrowed,
}

/// Engine-side work a tracker transition requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeAction {
    None,
    InitRef(usize),
    Reference(usize),
    /// Drop one engine reference; destroy the object if it was the last.
    Unreference(usize),
    Destroy(usize),
}

/// Generational key of a tracker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    index: u32,
    generation: u32,
}

impl ObjectKey {
    pub const fn pack(self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    pub const fn unpack(bits: u64) -> Self {
        Self { index: (bits >> 32) as u32, generation: bits as u32 }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}.{}", self.index, self.generation)
    }
}

/// Result of bringing a pointer under tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub key: ObjectKey,
    pub action: NativeAction,
    /// True when no record existed; the runtime then watches for pre-delete.
    pub is_new: bool,
}

#[derive(Debug)]
struct ObjectRecord {
    ptr: usize,
    state: ObjectState,
    ref_counted: bool,
    handles: u32,
}

#[derive(Debug)]
struct ObjectSlot {
    generation: u32,
    record: Option<ObjectRecord>,
}

/// Identity cache and state machine for tracked engine objects.
#[derive(Debug, Default)]
pub struct ObjectTracker {
    slots: Vec<ObjectSlot>,
    free_list: Vec<u32>,
    by_pointer: FxHashMap<usize, ObjectKey>,
}

impl ObjectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of a pointer the managed side is now responsible for.
    ///
    /// An engine-owned record is taken over in place.
    ///
    /// # Panics
    ///
    /// If the pointer is already managed-owned or is a singleton.
    pub fn take(&mut self, ptr: usize, ref_counted: bool, acquire: Acquire) -> Tracked {
        match self.by_pointer.get(&ptr).copied() {
            Some(key) => {
                let state = self.record_mut(key).state;
                if state != ObjectState::EngineOwned {
                    panic!("object {ptr:#x} is already tracked as {key} ({state:?})");
                }
                let tracked = self.rewrap(key, ptr, acquire);
                self.record_mut(key).state = ObjectState::ManagedOwned;
                trace!("{key} taken over from the engine");
                tracked
            }
            None => self.insert(ptr, ObjectState::ManagedOwned, ref_counted, acquire),
        }
    }

    /// Returns the existing record for `ptr` or tracks it as engine-owned.
    pub fn wrap(&mut self, ptr: usize, ref_counted: bool, acquire: Acquire) -> Tracked {
        match self.by_pointer.get(&ptr).copied() {
            Some(key) => self.rewrap(key, ptr, acquire),
            None => self.insert(ptr, ObjectState::EngineOwned, ref_counted, acquire),
        }
    }

    fn rewrap(&mut self, key: ObjectKey, ptr: usize, acquire: Acquire) -> Tracked {
        let record = self.record_mut(key);
        record.handles += 1;
        // The record already holds its engine reference; a transferred one is surplus.
        let action = match acquire {
            Acquire::Transferred if record.ref_counted && record.state != ObjectState::Frozen => {
                NativeAction::Unreference(ptr)
            }
            _ => NativeAction::None,
        };
        Tracked { key, action, is_new: false }
    }

    /// Tracks an engine singleton.
    pub fn freeze(&mut self, ptr: usize) -> Tracked {
        match self.by_pointer.get(&ptr).copied() {
            Some(key) => {
                let record = self.record_mut(key);
                record.state = ObjectState::Frozen;
                record.handles += 1;
                Tracked { key, action: NativeAction::None, is_new: false }
            }
            None => {
                let key = self.alloc(ObjectRecord { ptr, state: ObjectState::Frozen, ref_counted: false, handles: 1 });
                Tracked { key, action: NativeAction::None, is_new: true }
            }
        }
    }

    fn insert(&mut self, ptr: usize, state: ObjectState, ref_counted: bool, acquire: Acquire) -> Tracked {
        let key = self.alloc(ObjectRecord { ptr, state, ref_counted, handles: 1 });
        trace!("tracking {ptr:#x} as {key} ({state:?})");
        Tracked { key, action: Self::acquire_action(ref_counted, ptr, acquire), is_new: true }
    }

    fn acquire_action(ref_counted: bool, ptr: usize, acquire: Acquire) -> NativeAction {
        match (ref_counted, acquire) {
            (false, _) | (true, Acquire::Transferred) => NativeAction::None,
            (true, Acquire::Fresh) => NativeAction::InitRef(ptr),
            (true, Acquire::Borrowed) => NativeAction::Reference(ptr),
        }
    }

    fn alloc(&mut self, record: ObjectRecord) -> ObjectKey {
        let ptr = record.ptr;
        let key = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            ObjectKey { index, generation: slot.generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(ObjectSlot { generation: 0, record: Some(record) });
            ObjectKey { index, generation: 0 }
        };
        self.by_pointer.insert(ptr, key);
        key
    }

    fn record(&self, key: ObjectKey) -> Option<&ObjectRecord> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn record_mut(&mut self, key: ObjectKey) -> &mut ObjectRecord {
        match self.slots.get_mut(key.index as usize) {
            Some(slot) if slot.generation == key.generation => match slot.record.as_mut() {
                Some(record) => record,
                None => panic!("{key} used after it was released"),
            },
            _ => panic!("{key} used after it was released"),
        }
    }

    fn vacate(&mut self, key: ObjectKey) {
        let slot = &mut self.slots[key.index as usize];
        if let Some(record) = slot.record.take()
            && self.by_pointer.get(&record.ptr) == Some(&key)
        {
            self.by_pointer.remove(&record.ptr);
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(key.index);
    }

    /// Counts one more managed handle.
    ///
    /// A record holds a single engine reference however many handles share
    /// it, so retaining never calls into the engine.
    ///
    /// # Panics
    ///
    /// If the object was freed.
    pub fn retain(&mut self, key: ObjectKey) {
        let record = self.record_mut(key);
        if record.state == ObjectState::Freed {
            panic!("{key} used after it was freed");
        }
        record.handles += 1;
    }

    /// Drops one managed handle. Only the last handle of a reference-counted
    /// record gives its engine reference back.
    pub fn release(&mut self, key: ObjectKey) -> NativeAction {
        let record = self.record_mut(key);
        record.handles = record.handles.saturating_sub(1);
        let remaining = record.handles;
        let action = match record.state {
            ObjectState::Freed | ObjectState::Frozen => NativeAction::None,
            _ if remaining > 0 => NativeAction::None,
            _ if record.ref_counted => NativeAction::Unreference(record.ptr),
            ObjectState::ManagedOwned => NativeAction::Destroy(record.ptr),
            _ => NativeAction::None,
        };
        if remaining == 0 {
            self.vacate(key);
        }
        action
    }

    /// Hands a managed-owned object to the engine.
    ///
    /// # Panics
    ///
    /// If the object is not managed-owned.
    pub fn give(&mut self, key: ObjectKey) {
        let record = self.record_mut(key);
        if record.state != ObjectState::ManagedOwned {
            panic!("{key} is {:?}, only managed-owned objects can be given to the engine", record.state);
        }
        record.state = ObjectState::EngineOwned;
    }

    /// Frees the object through one of its handles, consuming that handle.
    ///
    /// # Panics
    ///
    /// On a second free, on a singleton, or on a non-reference-counted object
    /// the engine owns.
    pub fn free(&mut self, key: ObjectKey) -> NativeAction {
        let record = self.record_mut(key);
        match record.state {
            ObjectState::Freed => panic!("{key} freed twice"),
            ObjectState::Frozen => panic!("{key} is an engine singleton and cannot be freed"),
            ObjectState::EngineOwned if !record.ref_counted => {
                panic!("{key} is owned by the engine and cannot be freed from the managed side")
            }
            _ => {}
        }
        if record.ref_counted {
            return self.release(key);
        }
        let ptr = record.ptr;
        record.state = ObjectState::Freed;
        record.handles = record.handles.saturating_sub(1);
        let remaining = record.handles;
        self.by_pointer.remove(&ptr);
        if remaining == 0 {
            self.vacate(key);
        }
        NativeAction::Destroy(ptr)
    }

    /// Records that the engine is deleting `ptr`. Handles become stale.
    pub fn destroyed(&mut self, ptr: usize) -> Option<ObjectKey> {
        let key = self.by_pointer.remove(&ptr)?;
        let record = self.record_mut(key);
        record.state = ObjectState::Freed;
        trace!("{key} deleted by the engine with {} handles outstanding", record.handles);
        Some(key)
    }

    /// Live pointer of a record; `None` once freed.
    pub fn pointer(&self, key: ObjectKey) -> Option<usize> {
        self.record(key).filter(|record| record.state != ObjectState::Freed).map(|record| record.ptr)
    }

    /// `None` means untracked.
    pub fn state(&self, key: ObjectKey) -> Option<ObjectState> {
        self.record(key).map(|record| record.state)
    }

    pub fn lookup(&self, ptr: usize) -> Option<ObjectKey> {
        self.by_pointer.get(&ptr).copied()
    }

    pub fn handle_count(&self, key: ObjectKey) -> u32 {
        self.record(key).map_or(0, |record| record.handles)
    }

    /// Number of records, including freed records with handles outstanding.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.record.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Object wrapper
// ============================================================================

const WORD_PTR: usize = 0;
const WORD_INSTANCE_ID: usize = 1;
const WORD_KEY: usize = 2;

/// A scope-owned reference to an engine object.
pub struct Object {
    handle: Handle,
}

impl Object {
    /// Constructs an engine object the managed side owns.
    ///
    /// # Panics
    ///
    /// If the engine does not know the class.
    pub fn construct(life: &Lifetime, class: &str) -> Object {
        let runtime = life.runtime();
        let name = match std::ffi::CString::new(class) {
            Ok(name) => name,
            Err(_) => panic!("class name {class:?} contains a nul byte"),
        };
        let ptr = runtime.api().classdb_construct_object(&name);
        if ptr.is_null() {
            panic!("engine could not construct class {class}");
        }
        unsafe { Self::track(life, ptr, Tracking::Take(Acquire::Fresh)) }
    }

    /// Looks up an engine singleton by name.
    pub fn singleton(life: &Lifetime, name: &str) -> Option<Object> {
        let name = std::ffi::CString::new(name).ok()?;
        let ptr = life.runtime().api().global_get_singleton(&name);
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { Self::track(life, ptr, Tracking::Freeze) })
    }

    /// Looks up a live object by instance id.
    pub fn from_instance_id(life: &Lifetime, id: InstanceId) -> Option<Object> {
        let ptr = life.runtime().api().object_get_instance_from_id(id);
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { Self::track(life, ptr, Tracking::Wrap(Acquire::Borrowed)) })
    }

    /// Wraps an engine pointer, reusing its record if already tracked.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live engine object.
    pub unsafe fn from_raw(life: &Lifetime, ptr: ObjectPtr, acquire: Acquire) -> Object {
        unsafe { Self::track(life, ptr, Tracking::Wrap(acquire)) }
    }

    /// Takes ownership of an engine pointer. A pointer already wrapped as
    /// engine-owned becomes managed-owned; its existing handles share the record.
    ///
    /// # Panics
    ///
    /// If the pointer is already managed-owned or is a singleton.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live engine object nothing else will destroy.
    pub unsafe fn take_raw(life: &Lifetime, ptr: ObjectPtr, acquire: Acquire) -> Object {
        unsafe { Self::track(life, ptr, Tracking::Take(acquire)) }
    }

    unsafe fn track(life: &Lifetime, ptr: ObjectPtr, tracking: Tracking) -> Object {
        let runtime = life.runtime();
        let address = ptr as usize;
        let tracked = match tracking {
            Tracking::Freeze => runtime.tracker().freeze(address),
            Tracking::Take(acquire) => {
                let ref_counted = runtime.is_ref_counted(ptr);
                runtime.tracker().take(address, ref_counted, acquire)
            }
            Tracking::Wrap(acquire) => {
                let ref_counted = runtime.is_ref_counted(ptr);
                runtime.tracker().wrap(address, ref_counted, acquire)
            }
        };
        if tracked.is_new {
            runtime.watch(ptr);
        }
        runtime.apply(tracked.action);
        let instance_id = unsafe { runtime.api().object_get_instance_id(ptr) };
        let raw = RawHandle::from_words(HandleKind::Object, [address as u64, instance_id, tracked.key.pack()]);
        Object { handle: life.register(raw) }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::unpack(self.handle.raw().words()[WORD_KEY])
    }

    pub fn instance_id(&self) -> InstanceId {
        self.handle.raw().words()[WORD_INSTANCE_ID]
    }

    /// The live engine pointer, or `None` once freed.
    pub fn try_ptr(&self) -> Option<ObjectPtr> {
        let key = self.key();
        self.handle.runtime().tracker().pointer(key).map(|ptr| ptr as ObjectPtr)
    }

    /// The live engine pointer.
    ///
    /// # Panics
    ///
    /// If the object was freed by either side.
    pub fn ptr(&self) -> ObjectPtr {
        match self.try_ptr() {
            Some(ptr) => ptr,
            None => panic!("{} used after it was freed", self.key()),
        }
    }

    pub fn is_freed(&self) -> bool {
        self.try_ptr().is_none()
    }

    pub fn state(&self) -> Option<ObjectState> {
        self.handle.runtime().tracker().state(self.key())
    }

    pub fn is_ref_counted(&self) -> bool {
        self.handle.runtime().is_ref_counted(self.ptr())
    }

    /// Whether the object is an instance of `class` or a subclass.
    pub fn is_class(&self, class: &str) -> bool {
        let runtime = self.handle.runtime();
        let Ok(tag) = crate::methods::ClassTag::resolve(runtime.api(), class) else {
            return false;
        };
        !unsafe { runtime.api().object_cast_to(self.ptr(), tag.as_ptr()) }.is_null()
    }

    /// A second handle to the object if it is a `class`.
    pub fn cast_to(&self, life: &Lifetime, class: &str) -> Option<Object> {
        self.is_class(class).then(|| self.clone_in(life))
    }

    /// A second handle to the same object, registered to `life`.
    pub fn clone_in(&self, life: &Lifetime) -> Object {
        let runtime = life.runtime();
        runtime.tracker().retain(self.key());
        Object { handle: life.register(self.handle.raw()) }
    }

    pub fn move_to(&self, life: &Lifetime) {
        self.handle.move_to(life);
    }

    /// Hands the object to the engine; this side will no longer destroy it.
    pub fn give(&self) {
        self.handle.runtime().tracker().give(self.key());
    }

    /// Destroys the object now.
    ///
    /// # Panics
    ///
    /// If it was already freed, is a singleton, or is engine-owned.
    pub fn free(self) {
        let key = self.key();
        let runtime = std::sync::Arc::clone(self.handle.runtime());
        self.handle.detach();
        let action = runtime.tracker().free(key);
        runtime.apply(action);
    }
}

enum Tracking {
    Take(Acquire),
    Wrap(Acquire),
    Freeze,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("key", &self.key())
            .field("instance_id", &self.instance_id())
            .field("state", &self.state())
            .finish()
    }
}

impl NativeType for Object {
    const VARIANT_TYPE: VariantType = VariantType::Object;
}

impl ToNative for Object {
    fn write_borrowed(&self, slot: &mut Slot) {
        slot.write(self.ptr());
    }

    unsafe fn write_owned(&self, dst: TypePtr) {
        let ptr = self.ptr();
        if self.is_ref_counted() {
            self.handle.runtime().apply(NativeAction::Reference(ptr as usize));
        }
        unsafe { std::ptr::write_unaligned(dst as *mut ObjectPtr, ptr) }
    }
}

impl NativeType for Option<Object> {
    const VARIANT_TYPE: VariantType = VariantType::Object;
}

impl ToNative for Option<Object> {
    fn write_borrowed(&self, slot: &mut Slot) {
        match self {
            Some(object) => object.write_borrowed(slot),
            None => slot.write(std::ptr::null_mut::<std::ffi::c_void>()),
        }
    }

    unsafe fn write_owned(&self, dst: TypePtr) {
        match self {
            Some(object) => unsafe { object.write_owned(dst) },
            None => unsafe { std::ptr::write_unaligned(dst as *mut ObjectPtr, std::ptr::null_mut()) },
        }
    }
}

impl FromNative for Option<Object> {
    unsafe fn adopt(src: ConstTypePtr, life: &Lifetime) -> Self {
        let ptr = unsafe { std::ptr::read_unaligned(src as *const ObjectPtr) };
        (!ptr.is_null()).then(|| unsafe { Object::from_raw(life, ptr, Acquire::Transferred) })
    }

    unsafe fn copy_from(src: ConstTypePtr, life: &Lifetime) -> Self {
        let ptr = unsafe { std::ptr::read_unaligned(src as *const ObjectPtr) };
        (!ptr.is_null()).then(|| unsafe { Object::from_raw(life, ptr, Acquire::Borrowed) })
    }

    unsafe fn take_converted(src: ConstTypePtr, life: &Lifetime) -> Self {
        unsafe { Self::copy_from(src, life) }
    }
}

impl ToVariant for Object {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        encode(self, life)
    }
}

impl FromVariant for Object {
    fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
        let null = ConversionError::TypeMismatch { expected: VariantType::Object, actual: VariantType::Nil };
        if variant.is_nil() {
            return Err(null);
        }
        decode::<Option<Object>>(variant, life)?.ok_or(null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: usize = 0x1000;

    #[test]
    fn take_then_release_destroys_plain_object() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.take(P, false, Acquire::Fresh);
        assert!(tracked.is_new);
        assert_eq!(tracked.action, NativeAction::None);
        assert_eq!(tracker.release(tracked.key), NativeAction::Destroy(P));
        assert_eq!(tracker.state(tracked.key), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn fresh_ref_counted_initializes_reference() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.take(P, true, Acquire::Fresh);
        assert_eq!(tracked.action, NativeAction::InitRef(P));
        assert_eq!(tracker.release(tracked.key), NativeAction::Unreference(P));
    }

    #[test]
    fn wrap_reuses_record() {
        let mut tracker = ObjectTracker::new();
        let first = tracker.wrap(P, false, Acquire::Borrowed);
        let second = tracker.wrap(P, false, Acquire::Borrowed);
        assert_eq!(first.key, second.key);
        assert!(!second.is_new);
        assert_eq!(tracker.handle_count(first.key), 2);
        assert_eq!(tracker.state(first.key), Some(ObjectState::EngineOwned));
    }

    #[test]
    fn engine_owned_release_never_destroys() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.take(P, false, Acquire::Fresh);
        tracker.give(tracked.key);
        assert_eq!(tracker.release(tracked.key), NativeAction::None);
    }

    #[test]
    fn ref_counted_handles_share_one_engine_reference() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.wrap(P, true, Acquire::Borrowed);
        assert_eq!(tracked.action, NativeAction::Reference(P));
        tracker.retain(tracked.key);
        tracker.retain(tracked.key);
        assert_eq!(tracker.handle_count(tracked.key), 3);
        assert_eq!(tracker.release(tracked.key), NativeAction::None);
        assert_eq!(tracker.release(tracked.key), NativeAction::None);
        assert_eq!(tracker.release(tracked.key), NativeAction::Unreference(P));
        assert!(tracker.lookup(P).is_none());
    }

    #[test]
    fn transferred_result_adds_no_reference() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.wrap(P, true, Acquire::Transferred);
        assert_eq!(tracked.action, NativeAction::None);
    }

    #[test]
    fn transferred_reference_to_a_tracked_object_is_dropped() {
        let mut tracker = ObjectTracker::new();
        let first = tracker.wrap(P, true, Acquire::Borrowed);
        let again = tracker.wrap(P, true, Acquire::Transferred);
        assert_eq!(again.key, first.key);
        assert_eq!(again.action, NativeAction::Unreference(P));
        assert_eq!(tracker.wrap(P, true, Acquire::Borrowed).action, NativeAction::None);
    }

    #[test]
    fn free_with_outstanding_handles_leaves_tombstone() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.take(P, false, Acquire::Fresh);
        tracker.retain(tracked.key);
        assert_eq!(tracker.free(tracked.key), NativeAction::Destroy(P));
        assert_eq!(tracker.pointer(tracked.key), None);
        assert_eq!(tracker.state(tracked.key), Some(ObjectState::Freed));
        assert_eq!(tracker.release(tracked.key), NativeAction::None);
        assert_eq!(tracker.state(tracked.key), None);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.take(P, false, Acquire::Fresh);
        tracker.retain(tracked.key);
        tracker.free(tracked.key);
        tracker.free(tracked.key);
    }

    #[test]
    #[should_panic(expected = "used after it was released")]
    fn free_through_stale_key_panics() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.take(P, false, Acquire::Fresh);
        tracker.free(tracked.key);
        tracker.free(tracked.key);
    }

    #[test]
    #[should_panic(expected = "singleton")]
    fn singleton_cannot_be_freed() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.freeze(P);
        tracker.free(tracked.key);
    }

    #[test]
    fn engine_owned_record_can_be_taken_over() {
        let mut tracker = ObjectTracker::new();
        let wrapped = tracker.wrap(P, false, Acquire::Borrowed);
        let taken = tracker.take(P, false, Acquire::Borrowed);
        assert_eq!(taken.key, wrapped.key);
        assert!(!taken.is_new);
        assert_eq!(tracker.state(taken.key), Some(ObjectState::ManagedOwned));
        assert_eq!(tracker.release(wrapped.key), NativeAction::None);
        assert_eq!(tracker.release(taken.key), NativeAction::Destroy(P));
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn taking_a_singleton_panics() {
        let mut tracker = ObjectTracker::new();
        tracker.freeze(P);
        tracker.take(P, false, Acquire::Borrowed);
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn double_take_panics() {
        let mut tracker = ObjectTracker::new();
        tracker.take(P, false, Acquire::Fresh);
        tracker.take(P, false, Acquire::Fresh);
    }

    #[test]
    fn engine_deletion_invalidates_handles() {
        let mut tracker = ObjectTracker::new();
        let tracked = tracker.wrap(P, false, Acquire::Borrowed);
        assert_eq!(tracker.destroyed(P), Some(tracked.key));
        assert_eq!(tracker.pointer(tracked.key), None);
        assert_eq!(tracker.release(tracked.key), NativeAction::None);
        assert!(tracker.destroyed(P).is_none());
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let mut tracker = ObjectTracker::new();
        let first = tracker.take(P, false, Acquire::Fresh);
        tracker.release(first.key);
        let second = tracker.take(P + 8, false, Acquire::Fresh);
        assert_ne!(first.key, second.key);
        assert_eq!(tracker.pointer(first.key), None);
    }

    #[test]
    fn nil_is_no_object() {
        let engine = crate::testing::FakeEngine::new();
        let ctx = crate::lifetime::Context::new(engine.runtime());
        let life = ctx.scope();
        let nil = Variant::nil(&life);
        assert!(matches!(nil.to::<Option<Object>>(&life), Ok(None)));
        assert_eq!(
            nil.to::<Object>(&life).unwrap_err(),
            ConversionError::TypeMismatch { expected: VariantType::Object, actual: VariantType::Nil }
        );

        let node = Object::construct(&life, "Node");
        let some = Some(node.clone_in(&life)).to_variant(&life);
        let back = some.to::<Option<Object>>(&life).unwrap();
        assert_eq!(back.map(|object| object.key()), Some(node.key()));
        assert_eq!(some.to::<Object>(&life).unwrap().ptr(), node.ptr());
        life.end();
        assert!(ctx.runtime().tracker().is_empty());
    }

    #[test]
    fn key_packing_round_trips() {
        let key = ObjectKey { index: 7, generation: 3 };
        assert_eq!(ObjectKey::unpack(key.pack()), key);
    }
}
