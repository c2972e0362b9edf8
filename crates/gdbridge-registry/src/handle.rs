//! Class identifiers and packed instance handles.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use gdbridge_core::sys::ClassInstancePtr;

// Instance handles travel as the engine's instance pointer and need all 64 bits.
#[cfg(not(target_pointer_width = "64"))]
compile_error!("gdbridge-registry requires a 64-bit target");

static NEXT_CLASS_ID: AtomicU16 = AtomicU16::new(1);

/// Process-wide identifier of a registered class. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u16);

impl ClassId {
    pub(crate) fn next() -> Self {
        let id = NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            panic!("class id space exhausted");
        }
        ClassId(id)
    }

    #[inline]
    pub fn get(self) -> u16 {
        self.0
    }

    /// The id as the class userdata handed to the engine.
    #[inline]
    pub fn as_userdata(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }

    /// Recovers the id from class userdata. `None` for null or out-of-range values.
    #[inline]
    pub fn from_userdata(userdata: *mut c_void) -> Option<Self> {
        match u16::try_from(userdata as usize) {
            Ok(0) | Err(_) => None,
            Ok(id) => Some(ClassId(id)),
        }
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// Engine-facing instance pointer: `class:16 | generation:16 | slot:32`.
///
/// The generation changes every time a slot is reused, so a handle kept past
/// `free_instance` never resolves to the slot's next occupant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    #[inline]
    pub fn new(class: ClassId, generation: u16, slot: u32) -> Self {
        InstanceHandle((u64::from(class.0) << 48) | (u64::from(generation) << 32) | u64::from(slot))
    }

    /// The class bits. `None` if they are zero.
    #[inline]
    pub fn class(self) -> Option<ClassId> {
        match (self.0 >> 48) as u16 {
            0 => None,
            id => Some(ClassId(id)),
        }
    }

    #[inline]
    pub fn generation(self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        InstanceHandle(bits)
    }

    #[inline]
    pub fn as_ptr(self) -> ClassInstancePtr {
        self.0 as usize as ClassInstancePtr
    }

    #[inline]
    pub fn from_ptr(ptr: ClassInstancePtr) -> Self {
        InstanceHandle(ptr as usize as u64)
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("class", &(self.0 >> 48))
            .field("generation", &self.generation())
            .field("slot", &self.slot())
            .finish()
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}.{}.{}", self.0 >> 48, self.slot(), self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_packs_all_fields() {
        let class = ClassId(0x1234);
        let handle = InstanceHandle::new(class, 0xbeef, 0xdead_0001);
        assert_eq!(handle.class(), Some(class));
        assert_eq!(handle.generation(), 0xbeef);
        assert_eq!(handle.slot(), 0xdead_0001);
        assert_eq!(InstanceHandle::from_ptr(handle.as_ptr()), handle);
    }

    #[test]
    fn high_bits_survive_the_pointer_round_trip() {
        let handle = InstanceHandle::new(ClassId(u16::MAX), u16::MAX, u32::MAX);
        assert_eq!(handle.to_bits(), u64::MAX);
        let back = InstanceHandle::from_ptr(handle.as_ptr());
        assert_eq!(back.class(), Some(ClassId(u16::MAX)));
        assert_eq!(back.generation(), u16::MAX);
        assert_eq!(back.slot(), u32::MAX);
    }

    #[test]
    fn zero_class_bits_do_not_resolve() {
        assert_eq!(InstanceHandle::from_bits(7).class(), None);
        assert_eq!(ClassId::from_userdata(std::ptr::null_mut()), None);
    }

    #[test]
    fn class_ids_round_trip_userdata() {
        let id = ClassId::next();
        assert_ne!(id.get(), 0);
        assert_eq!(ClassId::from_userdata(id.as_userdata()), Some(id));
        assert_ne!(ClassId::next(), id);
    }
}
