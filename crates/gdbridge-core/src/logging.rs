//! `log` backend that forwards warnings and errors to the engine's output.

use std::sync::Arc;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::runtime::Runtime;

/// Forwards `warn!`/`error!` records to the engine's print functions.
///
/// Lower levels are filtered by [`EngineLogger::level`] and dropped, since
/// the engine has no channel for them.
pub struct EngineLogger {
    runtime: Arc<Runtime>,
    level: LevelFilter,
}

impl EngineLogger {
    pub fn new(runtime: Arc<Runtime>, level: LevelFilter) -> Self {
        Self { runtime, level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Installs the logger as the process-wide `log` backend.
    pub fn install(runtime: Arc<Runtime>, level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(Self::new(runtime, level)))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for EngineLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        let function = record.module_path().unwrap_or(record.target());
        let file = record.file().unwrap_or("<unknown>");
        let line = record.line().unwrap_or(0);
        match record.level() {
            Level::Error => self.runtime.print_error(&message, function, file, line),
            Level::Warn => self.runtime.print_warning(&message, function, file, line),
            Level::Info | Level::Debug | Level::Trace => {}
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    fn record(level: Level, text: &str, f: impl FnOnce(&Record<'_>)) {
        f(&Record::builder().level(level).target("gdbridge").args(format_args!("{text}")).line(Some(12)).build());
    }

    #[test]
    fn warnings_and_errors_are_forwarded() {
        let engine = FakeEngine::new();
        let logger = EngineLogger::new(engine.runtime(), LevelFilter::Info);
        record(Level::Error, "broken", |r| logger.log(r));
        record(Level::Warn, "odd", |r| logger.log(r));
        record(Level::Info, "fine", |r| logger.log(r));
        assert_eq!(engine.messages(), vec!["error: broken".to_string(), "warning: odd".to_string()]);
    }

    #[test]
    fn filtered_levels_are_dropped() {
        let engine = FakeEngine::new();
        let logger = EngineLogger::new(engine.runtime(), LevelFilter::Error);
        record(Level::Warn, "odd", |r| logger.log(r));
        assert!(engine.messages().is_empty());
        assert!(!logger.enabled(&Metadata::builder().level(Level::Warn).build()));
    }
}
