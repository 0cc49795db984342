use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock, Weak};

static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INSTANCES: LazyLock<Mutex<Vec<Weak<LoggerInner>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));
static USER_LOG_HANDLER: LazyLock<RwLock<Option<UserLogHandler>>> =
    LazyLock::new(|| RwLock::new(None));

type SharedLogHandler = Arc<dyn Fn(&Logger, LogLevel, &str) + Send + Sync + 'static>;

/// Callback receiving every record emitted by any engine logger at or above its threshold.
pub type UserLogHandler = Arc<dyn Fn(&LogRecord) + Send + Sync + 'static>;

/// A single emitted log line as seen by a user log handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub logger: String,
    pub message: String,
}

/// Named logger shared by one engine component.
///
/// Components keep a `static LOGGER: LazyLock<Logger>` and emit preformatted
/// messages through it; the level threshold is checked before any handler runs.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(LoggerInner::new(name.into()));
        track_instance(&inner);
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.log_level.load(Ordering::SeqCst))
    }

    pub fn set_log_level<L>(&self, level: L) -> Result<(), LogError>
    where
        L: IntoLogLevel,
    {
        let level = level.into_log_level()?;
        self.inner.log_level.store(level as u8, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Silent && level >= self.log_level()
    }

    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(&Logger, LogLevel, &str) + Send + Sync + 'static,
    {
        *self
            .inner
            .log_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    pub fn reset_log_handler(&self) {
        *self
            .inner
            .log_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(default_log_handler);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.dispatch(LogLevel::Debug, message.into());
    }

    pub fn log(&self, message: impl Into<String>) {
        self.dispatch(LogLevel::Verbose, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.dispatch(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.dispatch(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.dispatch(LogLevel::Error, message.into());
    }

    fn dispatch(&self, level: LogLevel, message: String) {
        if !self.is_enabled(level) {
            return;
        }

        let user_handler = USER_LOG_HANDLER
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = user_handler {
            handler(&LogRecord {
                level,
                logger: self.name().to_owned(),
                message: message.clone(),
            });
        }

        let handler = self
            .inner
            .log_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        handler(self, level, &message);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name())
            .field("level", &self.log_level())
            .finish()
    }
}

struct LoggerInner {
    name: String,
    log_level: AtomicU8,
    log_handler: RwLock<SharedLogHandler>,
}

impl LoggerInner {
    fn new(name: String) -> Self {
        let level = GLOBAL_LOG_LEVEL.load(Ordering::SeqCst);
        Self {
            name,
            log_level: AtomicU8::new(level),
            log_handler: RwLock::new(Arc::new(default_log_handler)),
        }
    }
}

fn track_instance(inner: &Arc<LoggerInner>) {
    INSTANCES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Arc::downgrade(inner));
}

fn default_log_handler(logger: &Logger, level: LogLevel, message: &str) {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let header = format!("[{}]  {}:", now, logger.name());

    match level {
        LogLevel::Warn | LogLevel::Error => eprintln!("{header} {message}"),
        _ => println!("{header} {message}"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Verbose = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Silent = 5,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Verbose,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Silent,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "verbose" => Ok(LogLevel::Verbose),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "silent" => Ok(LogLevel::Silent),
            other => Err(LogError::InvalidLogLevel(other.to_string())),
        }
    }
}

pub trait IntoLogLevel {
    fn into_log_level(self) -> Result<LogLevel, LogError>;
}

impl IntoLogLevel for LogLevel {
    fn into_log_level(self) -> Result<LogLevel, LogError> {
        Ok(self)
    }
}

impl IntoLogLevel for &str {
    fn into_log_level(self) -> Result<LogLevel, LogError> {
        LogLevel::from_str(self)
    }
}

impl IntoLogLevel for String {
    fn into_log_level(self) -> Result<LogLevel, LogError> {
        LogLevel::from_str(&self)
    }
}

#[derive(Debug, Clone)]
pub enum LogError {
    InvalidLogLevel(String),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::InvalidLogLevel(level) => {
                write!(f, "Invalid value \"{level}\" assigned to `logLevel`")
            }
        }
    }
}

impl std::error::Error for LogError {}

/// Sets the level of every live logger and of loggers created afterwards.
pub fn set_log_level<L>(level: L) -> Result<(), LogError>
where
    L: IntoLogLevel,
{
    let level = level.into_log_level()?;
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    let mut instances = INSTANCES.lock().unwrap_or_else(PoisonError::into_inner);
    instances.retain(|weak| match weak.upgrade() {
        Some(inner) => {
            inner.log_level.store(level as u8, Ordering::SeqCst);
            true
        }
        None => false,
    });
    Ok(())
}

/// Installs (or clears with `None`) a handler that observes records from all loggers.
pub fn set_user_log_handler(handler: Option<UserLogHandler>) {
    *USER_LOG_HANDLER
        .write()
        .unwrap_or_else(PoisonError::into_inner) = handler;
}

pub fn set_user_log_handler_fn<F>(handler: F)
where
    F: Fn(&LogRecord) + Send + Sync + 'static,
{
    set_user_log_handler(Some(Arc::new(handler)));
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn reset_logging() {
        set_log_level(LogLevel::Info).unwrap();
        set_user_log_handler(None);
    }

    fn recording_logger(name: &str) -> (Logger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let logger = Logger::new(name);
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        logger.set_log_handler(move |_, level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });
        (logger, records)
    }

    #[test]
    fn log_methods_respect_global_level() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_logging();
        let (logger, records) = recording_logger("@firebase/firestore/logger-test");

        set_log_level(LogLevel::Debug).unwrap();
        logger.debug("debug message");
        logger.log("verbose message");
        logger.info("info message");
        logger.warn("warn message");
        logger.error("error message");

        let stored = records.lock().unwrap();
        let levels: Vec<_> = stored.iter().map(|(level, _)| *level).collect();
        assert_eq!(
            levels,
            [
                LogLevel::Debug,
                LogLevel::Verbose,
                LogLevel::Info,
                LogLevel::Warn,
                LogLevel::Error,
            ]
        );
        assert_eq!(stored[0].1, "debug message");
        reset_logging();
    }

    #[test]
    fn string_levels_filter_records() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_logging();
        let (logger, records) = recording_logger("@firebase/firestore/logger-level");
        set_log_level("warn").unwrap();

        logger.debug("debug message");
        logger.info("info message");
        logger.warn("warn message");
        logger.error("error message");

        let levels: Vec<_> = records.lock().unwrap().iter().map(|(l, _)| *l).collect();
        assert_eq!(levels, [LogLevel::Warn, LogLevel::Error]);
        reset_logging();
    }

    #[test]
    fn user_handler_observes_records() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_logging();
        let (logger, _) = recording_logger("@firebase/firestore/logger-user");
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        set_user_log_handler_fn(move |record| {
            if record.logger == "@firebase/firestore/logger-user" {
                sink.lock().unwrap().push(record.clone());
            }
        });

        logger.debug("hidden");
        logger.info("shown");

        let records = captured.lock().unwrap().clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Info);
        assert_eq!(records[0].message, "shown");
        reset_logging();
    }

    #[test]
    fn rejects_unknown_level() {
        let err = "loud".into_log_level().unwrap_err();
        assert_eq!(err.to_string(), "Invalid value \"loud\" assigned to `logLevel`");
    }
}
