//! Extension class registration for gdbridge.
//!
//! A [`ClassBuilder`] declares a Rust type as an engine class: exposed
//! methods, virtual overrides, properties and signals. [`ClassRegistry`]
//! announces it to the engine and routes the engine's callbacks back to
//! managed instances.
//!
//! Instances are addressed by [`InstanceHandle`]s instead of raw pointers.
//! A handle carries its class, slot and slot generation, so a handle that
//! outlives its instance fails loudly instead of reaching the slot's next
//! occupant. Virtual overrides are reached through a fixed table of 255
//! [`trampoline`]s, one per override index.

mod callbacks;
pub mod class;
pub mod error;
pub mod handle;
pub mod instance;
pub mod method;
pub mod registry;
pub mod trampoline;
pub mod virtuals;

pub use class::{ClassBuilder, PropertyDef, SignalDef};
pub use error::RegistrationError;
pub use handle::{ClassId, InstanceHandle};
pub use instance::{Base, InstanceState};
pub use method::{Arguments, IntoMethod, ReturnSlot, Signature};
pub use registry::ClassRegistry;
pub use trampoline::trampoline;
pub use virtuals::MAX_VIRTUALS;
