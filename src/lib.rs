//! gdbridge: Rust bindings for engine extensions loaded through a C interface.
//!
//! The workspace splits into:
//!
//! - [`gdbridge_core`]: the engine function table, scopes that own engine
//!   handles, call frames, the Variant bridge, builtin handle types and the
//!   object ownership tracker.
//! - [`gdbridge_registry`]: extension classes, their instances and virtual
//!   dispatch.
//! - this crate: the load sequence and the [`extension_entry!`] macro.
//!
//! A library implements [`ExtensionLibrary`] and exports its entry point:
//!
//! ```ignore
//! use gdbridge::prelude::*;
//!
//! struct Game;
//!
//! impl ExtensionLibrary for Game {
//!     fn on_level_init(level: InitializationLevel, ext: &Extension) -> Result<(), InitError> {
//!         if level == InitializationLevel::Scene {
//!             ext.register(ClassBuilder::new("Player", "Node2D", |_| Player::default()))?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! gdbridge::extension_entry!(game_library_init, Game);
//! ```

pub mod init;

pub use gdbridge_core::{
    api, builtins, error, frame, hash, lifetime, logging, marshal, methods, object, runtime, sys, tables, types, values,
    variant,
};
pub use gdbridge_registry as registry;

pub use init::{Extension, ExtensionConfig, ExtensionLibrary, InitError};

pub mod prelude {
    pub use crate::init::{Extension, ExtensionConfig, ExtensionLibrary, InitError};
    pub use gdbridge_core::builtins::*;
    pub use gdbridge_core::error::{CallError, ConversionError, ResolutionError};
    pub use gdbridge_core::lifetime::{Context, Lifetime};
    pub use gdbridge_core::marshal::{FromNative, ToNative};
    pub use gdbridge_core::object::{Object, ObjectState};
    pub use gdbridge_core::types::{InitializationLevel, MethodFlags, Operator, PropertyUsage, VariantType};
    pub use gdbridge_core::values::*;
    pub use gdbridge_core::variant::{FromVariant, ToVariant, Variant};
    pub use gdbridge_registry::{Base, ClassBuilder, ClassId, ClassRegistry, InstanceHandle, RegistrationError};
}
