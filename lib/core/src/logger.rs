use anyhow::Result;
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

const LOG_FILE_NAME: &str = "payorch.log";

/// Logger writing orchestrator records to `payorch.log` and optionally
/// forwarding them to the embedding application's logger
pub struct OrchestratorLogger {
    level: LevelFilter,
    app_logger: Option<Box<dyn Log>>,
    log_file: Mutex<Option<File>>,
}

impl OrchestratorLogger {
    /// Creates a logger appending to `payorch.log` inside `log_dir`,
    /// creating the directory if needed
    pub fn new(log_dir: &str, level: LevelFilter, app_logger: Option<Box<dyn Log>>) -> Result<Self> {
        let log_path = Path::new(log_dir);
        if !log_path.exists() {
            create_dir_all(log_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path.join(LOG_FILE_NAME))?;

        Ok(Self {
            level,
            app_logger,
            log_file: Mutex::new(Some(file)),
        })
    }

    /// Installs the logger as the global `log` backend
    pub fn init(log_dir: &str, level: LevelFilter, app_logger: Option<Box<dyn Log>>) -> Result<()> {
        let logger = Self::new(log_dir, level, app_logger)?;
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(level);
        Ok(())
    }

    fn format(record: &Record) -> String {
        format!(
            "{} [{}] {}: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for OrchestratorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Ok(mut file_guard) = self.log_file.lock() {
            if let Some(file) = file_guard.as_mut() {
                let _ = file.write_all(Self::format(record).as_bytes());
                let _ = file.flush();
            }
        }

        if let Some(app_logger) = &self.app_logger {
            app_logger.log(record);
        }
    }

    fn flush(&self) {
        if let Ok(mut file_guard) = self.log_file.lock() {
            if let Some(file) = file_guard.as_mut() {
                let _ = file.flush();
            }
        }

        if let Some(app_logger) = &self.app_logger {
            app_logger.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_writes_records_at_or_above_level() {
        let dir = std::env::temp_dir().join(format!("payorch-log-{}", uuid::Uuid::new_v4()));
        let dir_str = dir.to_string_lossy().to_string();
        let logger = OrchestratorLogger::new(&dir_str, LevelFilter::Info, None).unwrap();

        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("payorch::service")
                .args(format_args!("compensated ch_1"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("payorch::retry")
                .args(format_args!("retrying"))
                .build(),
        );
        logger.flush();

        let contents = std::fs::read_to_string(dir.join(LOG_FILE_NAME)).unwrap();
        assert!(contents.contains("[WARN] payorch::service: compensated ch_1"));
        assert!(!contents.contains("retrying"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
