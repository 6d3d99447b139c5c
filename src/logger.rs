//! Small logger on top of the [`log`] facade.
//!
//! Every subsystem logs with an explicit `target:` (`dnsengine`, `rpz`,
//! `sources`, `refresh`, `metrics`) so individual targets can be turned up
//! or down without touching the rest.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct Logger {
    /// The default logging level
    default_level: LevelFilter,

    /// Per-target level overrides, sorted by target prefix.
    target_levels: Vec<(String, LevelFilter)>,

    /// Whether to log on stderr or stdout
    stderr: bool,

    /// Whether to emit the periodic metrics report
    metrics: bool,
}

impl Logger {
    pub fn new() -> Logger {
        Logger {
            default_level: LevelFilter::Info,
            target_levels: Vec::new(),
            stderr: false,
            metrics: true,
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Logger {
        self.default_level = level;
        self
    }

    pub fn with_target_level(mut self, target: &str, level: LevelFilter) -> Logger {
        self.target_levels.push((target.to_string(), level));
        self.target_levels.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn with_metrics(mut self, metrics: bool) -> Logger {
        self.metrics = metrics;
        self
    }

    pub fn with_stderr(mut self, stderr: bool) -> Logger {
        self.stderr = stderr;
        self
    }

    pub fn max_level(&self) -> LevelFilter {
        let max_level = self
            .target_levels
            .iter()
            .map(|(_target, level)| level)
            .copied()
            .max();
        max_level
            .map(|lvl| lvl.max(self.default_level))
            .unwrap_or(self.default_level)
    }

    /// Install as the process-wide logger. Must be called once, early.
    pub fn init(self) -> Result<(), SetLoggerError> {
        log::set_max_level(self.max_level());
        log::set_boxed_logger(Box::new(self))
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new()
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        &metadata.level().to_level_filter()
            <= self
                .target_levels
                .iter()
                /* Sorted longest-prefix first, so the first match is the
                 * most specific one. */
                .find(|(target, _level)| metadata.target().starts_with(target))
                .map(|(_target, level)| level)
                .unwrap_or(&self.default_level)
            && (self.metrics || metadata.target() != "metrics")
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let level_string = format!("{:<5}", record.level().to_string());

            let target = if !record.target().is_empty() {
                record.target()
            } else {
                record.module_path().unwrap_or_default()
            };

            let message = format!("{} [{}] {}", level_string, target, record.args());

            if self.stderr {
                eprintln!("{}", message);
            } else {
                println!("{}", message);
            }
        }
    }

    fn flush(&self) {}
}
