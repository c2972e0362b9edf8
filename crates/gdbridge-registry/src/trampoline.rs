//! Jump table of virtual-call entry points.
//!
//! The engine's virtual-call callback carries no index, so every override
//! index needs its own function pointer. Each trampoline bakes its index into
//! const generics and forwards to the shared dispatcher.

use gdbridge_core::sys::{CallVirtualFn, ClassInstancePtr, ConstTypePtr, TypePtr};

use crate::callbacks;

unsafe extern "C" fn call_virtual<const HI: u8, const LO: u8>(
    instance: ClassInstancePtr,
    args: *const ConstTypePtr,
    ret: TypePtr,
) {
    unsafe { callbacks::dispatch_virtual(instance, HI * 16 + LO, args, ret) }
}

macro_rules! row {
    ($hi:literal) => {
        [
            call_virtual::<$hi, 0> as CallVirtualFn,
            call_virtual::<$hi, 1>,
            call_virtual::<$hi, 2>,
            call_virtual::<$hi, 3>,
            call_virtual::<$hi, 4>,
            call_virtual::<$hi, 5>,
            call_virtual::<$hi, 6>,
            call_virtual::<$hi, 7>,
            call_virtual::<$hi, 8>,
            call_virtual::<$hi, 9>,
            call_virtual::<$hi, 10>,
            call_virtual::<$hi, 11>,
            call_virtual::<$hi, 12>,
            call_virtual::<$hi, 13>,
            call_virtual::<$hi, 14>,
            call_virtual::<$hi, 15>,
        ]
    };
}

static TRAMPOLINES: [[CallVirtualFn; 16]; 16] = [
    row!(0),
    row!(1),
    row!(2),
    row!(3),
    row!(4),
    row!(5),
    row!(6),
    row!(7),
    row!(8),
    row!(9),
    row!(10),
    row!(11),
    row!(12),
    row!(13),
    row!(14),
    row!(15),
];

/// Entry point for virtual index `index`; `None` for 0, which means "not overridden".
#[inline]
pub fn trampoline(index: u8) -> Option<CallVirtualFn> {
    match index {
        0 => None,
        index => Some(TRAMPOLINES[usize::from(index >> 4)][usize::from(index & 0x0f)]),
    }
}
