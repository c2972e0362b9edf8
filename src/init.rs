//! Library load sequence.
//!
//! The engine calls one exported entry function with its function table, a
//! library token and an initialization record. The entry fills the record
//! with the minimum level and two callbacks; the engine then initializes
//! level by level (core, servers, scene, editor) and deinitializes in
//! reverse. Each level links the engine tables it makes available and
//! unregisters the classes registered at it on the way down.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use log::{LevelFilter, debug, error, info};
use thiserror::Error;

use gdbridge_core::api::RawApi;
use gdbridge_core::error::ResolutionError;
use gdbridge_core::logging::EngineLogger;
use gdbridge_core::runtime::{LibraryToken, Runtime};
use gdbridge_core::sys::{Bool, ClassLibraryPtr, FALSE, RawInitialization, RawInterface, TRUE};
use gdbridge_core::types::InitializationLevel;
use gdbridge_registry::{ClassBuilder, ClassId, ClassRegistry, RegistrationError};

/// Failures while bringing a level up.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("unknown initialization level {0}")]
    UnknownLevel(u32),
}

/// Load-time settings of an extension library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionConfig {
    /// Lowest level the library asks the engine to initialize it at.
    pub minimum_level: InitializationLevel,
    pub log_level: LevelFilter,
    /// Install [`EngineLogger`] as the `log` backend.
    pub forward_logs: bool,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self { minimum_level: InitializationLevel::Scene, log_level: LevelFilter::Info, forward_logs: true }
    }
}

impl ExtensionConfig {
    pub fn with_minimum_level(mut self, level: InitializationLevel) -> Self {
        self.minimum_level = level;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_forward_logs(mut self, forward: bool) -> Self {
        self.forward_logs = forward;
        self
    }
}

/// Hooks of one extension library.
///
/// ```ignore
/// struct Game;
///
/// impl ExtensionLibrary for Game {
///     fn on_level_init(level: InitializationLevel, ext: &Extension) -> Result<(), InitError> {
///         if level == InitializationLevel::Scene {
///             ext.register(ClassBuilder::new("Player", "Node2D", |_| Player::default()))?;
///         }
///         Ok(())
///     }
/// }
///
/// extension_entry!(game_library_init, Game);
/// ```
pub trait ExtensionLibrary: 'static {
    fn config() -> ExtensionConfig {
        ExtensionConfig::default()
    }

    /// Runs after `level` has linked.
    fn on_level_init(level: InitializationLevel, extension: &Extension) -> Result<(), InitError> {
        let _ = (level, extension);
        Ok(())
    }

    /// Runs before the classes of `level` are unregistered.
    fn on_level_deinit(level: InitializationLevel, extension: &Extension) {
        let _ = (level, extension);
    }
}

/// State of a loaded library, alive from the entry call until core deinitializes.
pub struct Extension {
    runtime: Arc<Runtime>,
    registry: ClassRegistry,
    config: ExtensionConfig,
    level: Mutex<Option<InitializationLevel>>,
    failed: Mutex<bool>,
}

impl Extension {
    pub fn new(runtime: Arc<Runtime>, config: ExtensionConfig) -> Self {
        let registry = ClassRegistry::new(Arc::clone(&runtime));
        Self { runtime, registry, config, level: Mutex::new(None), failed: Mutex::new(false) }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExtensionConfig {
        &self.config
    }

    /// Level the engine is currently initialized to.
    pub fn level(&self) -> Option<InitializationLevel> {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a level failed to come up. Later levels are skipped.
    pub fn has_failed(&self) -> bool {
        *self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a class at the current level so it unregisters when that level goes down.
    pub fn register<T: Send + 'static>(&self, builder: ClassBuilder<T>) -> Result<ClassId, RegistrationError> {
        let level = self.level().unwrap_or(self.config.minimum_level);
        self.registry.register(builder.level(level))
    }

    /// Links every level up to `level` and runs the library hook.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn initialize<L: ExtensionLibrary>(&self, level: InitializationLevel) -> Result<(), InitError> {
        if self.has_failed() {
            debug!("skipping {level} level after an earlier failure");
            return Ok(());
        }
        let result = self.bring_up::<L>(level);
        if result.is_err() {
            *self.failed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        }
        result
    }

    fn bring_up<L: ExtensionLibrary>(&self, level: InitializationLevel) -> Result<(), InitError> {
        for code in u32::from(InitializationLevel::Core)..=u32::from(level) {
            let stage = InitializationLevel::try_from(code).map_err(|_| InitError::UnknownLevel(code))?;
            self.runtime.link(stage)?;
        }
        *self.level.lock().unwrap_or_else(PoisonError::into_inner) = Some(level);
        L::on_level_init(level, self)?;
        info!("initialized {level} level");
        Ok(())
    }

    /// Runs the library hook, then unregisters the classes of `level`.
    pub fn deinitialize<L: ExtensionLibrary>(&self, level: InitializationLevel) {
        if self.level().is_some_and(|current| current >= level) {
            L::on_level_deinit(level, self);
        }
        self.registry.unregister_level(level);
        self.runtime.unlink(level);
        let below = match level {
            InitializationLevel::Core => None,
            other => InitializationLevel::try_from(u32::from(other) - 1).ok(),
        };
        *self.level.lock().unwrap_or_else(PoisonError::into_inner) = below;
        info!("deinitialized {level} level");
    }

    /// Fills the engine's initialization record and hands ownership of the
    /// extension to it. The record's userdata is released when the core
    /// level deinitializes.
    ///
    /// # Safety
    ///
    /// `init` must point to a writable initialization record.
    pub unsafe fn attach<L: ExtensionLibrary>(self, init: *mut RawInitialization) -> bool {
        let Some(init) = (unsafe { init.as_mut() }) else {
            return false;
        };
        let minimum = self.config.minimum_level;
        let userdata = Box::into_raw(Box::new(Attached::<L> { extension: self, library: PhantomData }));
        *init = RawInitialization {
            minimum_initialization_level: minimum.into(),
            userdata: userdata.cast::<c_void>(),
            initialize: Some(initialize_level::<L>),
            deinitialize: Some(deinitialize_level::<L>),
        };
        true
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("level", &self.level())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

struct Attached<L> {
    extension: Extension,
    library: PhantomData<fn() -> L>,
}

unsafe extern "C" fn initialize_level<L: ExtensionLibrary>(userdata: *mut c_void, level: u32) {
    let Some(attached) = (unsafe { userdata.cast::<Attached<L>>().as_ref() }) else {
        return;
    };
    let extension = &attached.extension;
    let result = match InitializationLevel::try_from(level) {
        Ok(level) => extension.initialize::<L>(level),
        Err(_) => Err(InitError::UnknownLevel(level)),
    };
    if let Err(err) = result {
        error!("initialization failed: {err}");
        extension.runtime().print_error(&format!("initialization failed: {err}"), "initialize_level", file!(), line!());
    }
}

unsafe extern "C" fn deinitialize_level<L: ExtensionLibrary>(userdata: *mut c_void, level: u32) {
    let attached = userdata.cast::<Attached<L>>();
    let Some(state) = (unsafe { attached.as_ref() }) else {
        return;
    };
    let Ok(level) = InitializationLevel::try_from(level) else {
        return;
    };
    state.extension.deinitialize::<L>(level);
    if level == InitializationLevel::Core {
        drop(unsafe { Box::from_raw(attached) });
        debug!("released extension state");
    }
}

/// Body of the exported entry function. See [`extension_entry!`](crate::extension_entry).
///
/// Returns false if the engine's function table is missing entry points or
/// speaks another major version.
///
/// # Safety
///
/// The arguments must be the ones the engine passed to the entry function.
pub unsafe fn initialize_extension<L: ExtensionLibrary>(
    interface: *const RawInterface,
    library: ClassLibraryPtr,
    init: *mut RawInitialization,
) -> Bool {
    let api = match unsafe { RawApi::load(interface) } {
        Ok(api) => api,
        Err(err) => {
            error!("cannot load extension: {err}");
            return FALSE;
        }
    };
    let runtime = Runtime::new(api, LibraryToken::new(library));
    if unsafe { start::<L>(runtime, init) } { TRUE } else { FALSE }
}

/// Installs logging and attaches a fresh [`Extension`] over `runtime`.
///
/// # Safety
///
/// `init` must point to a writable initialization record.
pub unsafe fn start<L: ExtensionLibrary>(runtime: Arc<Runtime>, init: *mut RawInitialization) -> bool {
    let config = L::config();
    if config.forward_logs {
        if let Err(err) = EngineLogger::install(Arc::clone(&runtime), config.log_level) {
            debug!("engine logger not installed: {err}");
        }
    }
    unsafe { Extension::new(runtime, config).attach::<L>(init) }
}

/// Exports the library entry function under `$symbol`.
#[macro_export]
macro_rules! extension_entry {
    ($symbol:ident, $library:ty) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $symbol(
            interface: *const $crate::sys::RawInterface,
            library: $crate::sys::ClassLibraryPtr,
            init: *mut $crate::sys::RawInitialization,
        ) -> $crate::sys::Bool {
            unsafe { $crate::init::initialize_extension::<$library>(interface, library, init) }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdbridge_core::testing::FakeEngine;
    use std::ptr;

    struct Quiet;

    impl ExtensionLibrary for Quiet {
        fn config() -> ExtensionConfig {
            ExtensionConfig::default().with_forward_logs(false).with_minimum_level(InitializationLevel::Core)
        }
    }

    struct Probe;

    impl ExtensionLibrary for Probe {
        fn config() -> ExtensionConfig {
            ExtensionConfig::default().with_forward_logs(false)
        }

        fn on_level_init(level: InitializationLevel, extension: &Extension) -> Result<(), InitError> {
            if level == InitializationLevel::Scene {
                extension.register(ClassBuilder::new("Probe", "Node", |_| ()))?;
            }
            Ok(())
        }
    }

    fn empty_init() -> RawInitialization {
        RawInitialization { minimum_initialization_level: 0, userdata: ptr::null_mut(), initialize: None, deinitialize: None }
    }

    #[test]
    fn config_defaults() {
        let config = ExtensionConfig::default();
        assert_eq!(config.minimum_level, InitializationLevel::Scene);
        assert_eq!(config.log_level, LevelFilter::Info);
        assert!(config.forward_logs);
        assert_eq!(config.with_log_level(LevelFilter::Warn).log_level, LevelFilter::Warn);
    }

    #[test]
    fn missing_interface_fails_the_entry() {
        let mut init = empty_init();
        let ok = unsafe { initialize_extension::<Quiet>(ptr::null(), ptr::null_mut(), &mut init) };
        assert_eq!(ok, FALSE);
        assert!(init.initialize.is_none());
    }

    #[test]
    fn wrong_major_version_fails_the_entry() {
        let interface = RawInterface::empty(3, 0);
        let mut init = empty_init();
        assert_eq!(unsafe { initialize_extension::<Quiet>(&interface, ptr::null_mut(), &mut init) }, FALSE);
    }

    #[test]
    fn start_fills_the_initialization_record() {
        let engine = FakeEngine::new();
        let mut init = empty_init();
        assert!(unsafe { start::<Quiet>(engine.unlinked_runtime(), &mut init) });
        assert_eq!(init.minimum_initialization_level, u32::from(InitializationLevel::Core));
        assert!(!init.userdata.is_null());
        let (initialize, deinitialize) = (init.initialize.unwrap(), init.deinitialize.unwrap());
        unsafe {
            initialize(init.userdata, 0);
            deinitialize(init.userdata, 0);
        }
    }

    #[test]
    fn levels_link_progressively_and_unregister_in_reverse() {
        let engine = FakeEngine::new();
        let runtime = engine.unlinked_runtime();
        let extension = Extension::new(Arc::clone(&runtime), Probe::config());

        extension.initialize::<Probe>(InitializationLevel::Core).unwrap();
        assert_eq!(runtime.level(), Some(InitializationLevel::Core));
        assert!(engine.registered_class("Probe").is_none());

        extension.initialize::<Probe>(InitializationLevel::Scene).unwrap();
        assert_eq!(runtime.level(), Some(InitializationLevel::Scene));
        assert!(engine.registered_class("Probe").is_some());

        extension.deinitialize::<Probe>(InitializationLevel::Scene);
        assert!(engine.registered_class("Probe").is_none());
        assert_eq!(extension.level(), Some(InitializationLevel::Servers));
        assert!(extension.registry().is_empty());
    }

    #[test]
    fn a_failed_level_skips_the_rest() {
        let engine = FakeEngine::new();
        engine.remove_method("RefCounted", "get_reference_count");
        let extension = Extension::new(engine.unlinked_runtime(), Probe::config());
        extension.initialize::<Probe>(InitializationLevel::Core).unwrap();
        let err = extension.initialize::<Probe>(InitializationLevel::Scene).unwrap_err();
        assert!(matches!(err, InitError::Resolution(ResolutionError::MissingMethodBind { .. })));
        assert!(extension.has_failed());
        assert!(extension.initialize::<Probe>(InitializationLevel::Editor).is_ok());
        assert!(engine.registered_class("Probe").is_none());
    }
}
