//! Deterministic signature hashes for methods exposed to the engine.
//!
//! A [`MethodHash`] is computed from the owning class, the method name and the
//! argument/return kinds. Registration records carry it so the engine side can
//! verify that a binding was produced for the same signature it expects.
//!
//! Uses XXHash64 with domain mixing constants so that a method and a signal
//! sharing a name still hash differently, and argument order matters.

use std::fmt;

use xxhash_rust::xxh64::xxh64;

use crate::types::VariantType;

/// Domain mixing constants.
pub mod hash_constants {
    /// Separator used when folding in each argument.
    pub const SEP: u64 = 0x4bc94d6bd06053ad;

    /// Domain marker for exposed methods.
    pub const METHOD: u64 = 0x7d3c8b4a92e15f6d;

    /// Domain marker for virtual overrides.
    pub const VIRTUAL: u64 = 0x3e9f5d2a8c7b1403;

    /// Domain marker for signals.
    pub const SIGNAL: u64 = 0x9a7f3d5e2b8c4601;

    /// Folded in when the method returns a value.
    pub const RETURN: u64 = 0x1a095090689d4647;

    /// Per-position markers so `(int, float)` and `(float, int)` differ.
    pub const PARAM_MARKERS: [u64; 16] = [
        0x9e3779b97f4a7c15,
        0xbf58476d1ce4e5b9,
        0x94d049bb133111eb,
        0xd6e8feb86659fd93,
        0xe7037ed1a0b428db,
        0xc6a4a7935bd1e995,
        0x8648dbbc94d49b8d,
        0xa2b48b2c69e0d657,
        0x7c3e9f2a5b8d1403,
        0x5d8c7b4a3e9f2106,
        0x3f1e9d8c7b5a4203,
        0x1a2b3c4d5e6f7089,
        0x9f8e7d6c5b4a3210,
        0x2468ace013579bdf,
        0xfdb97531eca86420,
        0x123456789abcdef0,
    ];
}

/// Signature hash of an exposed method, virtual override or signal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MethodHash(pub u64);

impl MethodHash {
    pub const EMPTY: MethodHash = MethodHash(0);

    /// Hash of an exposed method.
    #[inline]
    pub fn of_method(class: &str, name: &str, params: &[VariantType], ret: Option<VariantType>) -> Self {
        Self::compute(hash_constants::METHOD, class, name, params, ret)
    }

    /// Hash of a virtual override.
    #[inline]
    pub fn of_virtual(class: &str, name: &str, params: &[VariantType], ret: Option<VariantType>) -> Self {
        Self::compute(hash_constants::VIRTUAL, class, name, params, ret)
    }

    /// Hash of a signal.
    #[inline]
    pub fn of_signal(class: &str, name: &str, params: &[VariantType]) -> Self {
        Self::compute(hash_constants::SIGNAL, class, name, params, None)
    }

    fn compute(domain: u64, class: &str, name: &str, params: &[VariantType], ret: Option<VariantType>) -> Self {
        let mut hash = domain ^ xxh64(class.as_bytes(), 0) ^ xxh64(name.as_bytes(), 1);
        for (i, param) in params.iter().enumerate() {
            let marker = hash_constants::PARAM_MARKERS
                .get(i)
                .copied()
                .unwrap_or_else(|| hash_constants::PARAM_MARKERS[0].wrapping_add(i as u64));
            hash = hash.wrapping_mul(hash_constants::SEP).wrapping_add(marker ^ u64::from(u32::from(*param)));
        }
        if let Some(ret) = ret {
            hash = hash.wrapping_mul(hash_constants::SEP).wrapping_add(hash_constants::RETURN ^ u64::from(u32::from(ret)));
        }
        MethodHash(hash)
    }

    /// 32-bit form carried in registration records.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        (self.0 ^ (self.0 >> 32)) as u32
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for MethodHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHash({:#018x})", self.0)
    }
}

impl fmt::Display for MethodHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_hash_determinism() {
        let a = MethodHash::of_method("Player", "jump", &[VariantType::Float], None);
        let b = MethodHash::of_method("Player", "jump", &[VariantType::Float], None);
        assert_eq!(a, b);
    }

    #[test]
    fn owner_class_changes_hash() {
        let a = MethodHash::of_method("Player", "jump", &[], None);
        let b = MethodHash::of_method("Enemy", "jump", &[], None);
        assert_ne!(a, b);
    }

    #[test]
    fn parameter_order_matters() {
        let a = MethodHash::of_method("C", "f", &[VariantType::Int, VariantType::Float], None);
        let b = MethodHash::of_method("C", "f", &[VariantType::Float, VariantType::Int], None);
        assert_ne!(a, b);
    }

    #[test]
    fn return_value_changes_hash() {
        let a = MethodHash::of_method("C", "f", &[], None);
        let b = MethodHash::of_method("C", "f", &[], Some(VariantType::Int));
        assert_ne!(a, b);
    }

    #[test]
    fn domains_are_distinct() {
        let method = MethodHash::of_method("C", "changed", &[], None);
        let signal = MethodHash::of_signal("C", "changed", &[]);
        let virt = MethodHash::of_virtual("C", "changed", &[], None);
        assert_ne!(method, signal);
        assert_ne!(method, virt);
    }

    #[test]
    fn many_parameters_supported() {
        let params = [VariantType::Int; 20];
        let hash = MethodHash::of_method("C", "wide", &params, None);
        assert!(!hash.is_empty());
    }

    #[test]
    fn display_uses_short_form() {
        let hash = MethodHash(0x0000_0001_0000_0002);
        assert_eq!(hash.as_u32(), 3);
        assert_eq!(format!("{hash}"), "0x00000003");
    }
}
