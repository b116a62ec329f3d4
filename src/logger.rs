use crate::env;
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::Lazy;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug)]
struct Logger {
    level: LevelFilter,
    term_level: LevelFilter,
    file_level: LevelFilter,
    log_file: Option<Mutex<File>>,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if record.level() <= self.file_level
            && let Some(log_file) = &self.log_file
        {
            let mut log_file = log_file.lock().unwrap_or_else(|e| e.into_inner());
            let out = format!(
                "{now} {pid} {level} [{component}] {args}",
                now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                pid = std::process::id(),
                level = self.styled_level(record.level(), false),
                component = component(record.target()),
                args = record.args()
            );
            let _ = writeln!(log_file, "{}", console::strip_ansi_codes(&out));
        }
        if record.level() <= self.term_level {
            let out = self.render(record);
            eprintln!("{}", out);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Lazy<Logger> = Lazy::new(Logger::init);

impl Logger {
    fn init() -> Self {
        let term_level = *env::HAPPY_STACKS_LOG;
        let file_level = *env::HAPPY_STACKS_LOG_FILE_LEVEL;

        let mut logger = Logger {
            level: std::cmp::max(term_level, file_level),
            file_level,
            term_level,
            log_file: None,
        };

        let log_file = &*env::HAPPY_STACKS_LOG_FILE;
        if let Ok(log_file) = init_log_file(log_file) {
            logger.log_file = Some(Mutex::new(log_file));
        } else {
            warn!("could not open log file: {log_file:?}");
        }

        logger
    }

    fn render(&self, record: &Record) -> String {
        let label = console::style(format!("[{}]", component(record.target()))).dim();
        match record.level() {
            Level::Info => format!("{label} {}", record.args()),
            level => format!(
                "{label} {} {}",
                self.styled_level(level, true),
                record.args()
            ),
        }
    }

    fn styled_level(&self, level: Level, colored: bool) -> String {
        let s = match level {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        if !colored {
            return s.to_string();
        }
        let s = console::style(s);
        match level {
            Level::Error => s.red(),
            Level::Warn => s.yellow(),
            Level::Info => s.cyan(),
            Level::Debug => s.magenta(),
            Level::Trace => s.dim(),
        }
        .to_string()
    }
}

/// Stable component label for a log target.
///
/// `happy_stacks::daemon::controller` renders as `daemon`, anything outside
/// the crate keeps its top-level crate name.
pub fn component(target: &str) -> &str {
    let mut parts = target.split("::");
    match (parts.next(), parts.next()) {
        (Some("happy_stacks") | Some("happys"), Some(module)) => module,
        (Some("happy_stacks") | Some("happys"), None) => "happys",
        (Some(first), _) => first,
        _ => target,
    }
}

pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if let Err(err) = log::set_logger(&*LOGGER).map(|()| log::set_max_level(LOGGER.level)) {
            eprintln!("happys: could not initialize logger: {err}");
        }
    });
}

fn init_log_file(log_file: &std::path::Path) -> crate::Result<File> {
    if let Some(log_dir) = log_file.parent() {
        xx::file::mkdirp(log_dir)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| crate::error::FileError::WriteError {
            path: log_file.to_path_buf(),
            details: Some(e.to_string()),
        })?)
}
