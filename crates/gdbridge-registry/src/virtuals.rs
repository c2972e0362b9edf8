//! Per-class table of overridden engine virtuals.
//!
//! The engine asks for overrides by name and gets back a function pointer;
//! each override is addressed by a one-byte index, and index 0 means "not
//! overridden". A class can therefore override at most 255 virtuals.

use rustc_hash::FxHashMap;

use crate::method::{ErasedMethod, Signature};

/// Largest virtual index a class can hand out.
pub const MAX_VIRTUALS: usize = u8::MAX as usize;

pub(crate) struct VirtualMethod {
    pub(crate) name: String,
    pub(crate) signature: Signature,
    pub(crate) call: ErasedMethod,
}

#[derive(Default)]
pub(crate) struct VirtualTable {
    by_name: FxHashMap<String, u8>,
    methods: Vec<VirtualMethod>,
}

impl VirtualTable {
    /// Adds an override and returns its index.
    ///
    /// # Panics
    ///
    /// On a duplicate name or a 256th override.
    pub(crate) fn insert(&mut self, class: &str, method: VirtualMethod) -> u8 {
        if self.by_name.contains_key(&method.name) {
            panic!("{class} overrides virtual {} twice", method.name);
        }
        if self.methods.len() >= MAX_VIRTUALS {
            panic!("{class} overrides more than {MAX_VIRTUALS} virtual methods (adding {})", method.name);
        }
        let index = (self.methods.len() + 1) as u8;
        self.by_name.insert(method.name.clone(), index);
        self.methods.push(method);
        index
    }

    /// Index of the override for `name`, or 0.
    pub(crate) fn index_of(&self, name: &str) -> u8 {
        self.by_name.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn get(&self, index: u8) -> Option<&VirtualMethod> {
        match index {
            0 => None,
            index => self.methods.get(usize::from(index) - 1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.methods.len()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|method| method.name.as_str())
    }
}
