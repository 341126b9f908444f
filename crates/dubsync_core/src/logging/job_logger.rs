//! Log file for one batch job.
//!
//! Lines go to `<dir>/<job>.log` and to an optional callback. The most recent
//! lines are also kept in memory so a failing job can replay them.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;

use super::types::{LogCallback, LogConfig, LogLevel, MessagePrefix};

struct Sink {
    file: Option<BufWriter<File>>,
    recent: VecDeque<String>,
}

pub struct JobLogger {
    job_name: String,
    log_path: PathBuf,
    config: LogConfig,
    callback: Option<LogCallback>,
    sink: Mutex<Sink>,
}

impl JobLogger {
    /// Open (truncating) the log file for `job_name` inside `log_dir`.
    ///
    /// # Arguments
    /// * `job_name` - Pair id; unsafe path characters are replaced
    /// * `log_dir` - Created if missing
    /// * `config` - Level, compaction and tail size
    /// * `callback` - Receives every line that reaches the file
    pub fn new(
        job_name: impl Into<String>,
        log_dir: impl AsRef<Path>,
        config: LogConfig,
        callback: Option<LogCallback>,
    ) -> io::Result<Self> {
        let job_name = job_name.into();
        let dir = log_dir.as_ref();
        fs::create_dir_all(dir)?;

        let log_path = dir.join(format!("{}.log", file_stem(&job_name)));
        let file = BufWriter::new(File::create(&log_path)?);

        Ok(Self {
            sink: Mutex::new(Sink {
                file: Some(file),
                recent: VecDeque::with_capacity(config.error_tail),
            }),
            job_name,
            log_path,
            config,
            callback,
        })
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Record one line. Lines below the configured level are dropped; in
    /// compact mode lines below info are kept for the tail only.
    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.config.level {
            return;
        }

        let line = self.stamp(message);
        let to_file = !(self.config.compact && level < LogLevel::Info);
        {
            let mut sink = self.sink.lock();
            if self.config.error_tail > 0 {
                while sink.recent.len() >= self.config.error_tail {
                    sink.recent.pop_front();
                }
                sink.recent.push_back(line.clone());
            }
            if to_file {
                write_line(&mut sink, &line);
            }
        }
        if to_file {
            self.notify(&line);
        }
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, &MessagePrefix::Warning.format(message));
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, &MessagePrefix::Error.format(message));
    }

    /// Section header.
    pub fn phase(&self, name: &str) {
        self.log(LogLevel::Info, &MessagePrefix::Phase.format(name));
    }

    pub fn success(&self, message: &str) {
        self.log(LogLevel::Info, &MessagePrefix::Success.format(message));
    }

    /// Write the remembered lines, including compacted debug lines, under a
    /// header. Used after a failure.
    pub fn show_tail(&self, header: &str) {
        let lines = self.tail();
        if lines.is_empty() {
            return;
        }

        let banner = self.stamp(&format!("[{}/tail]", header));
        let mut sink = self.sink.lock();
        write_line(&mut sink, &banner);
        for line in &lines {
            write_line(&mut sink, line);
        }
        drop(sink);

        self.notify(&banner);
        for line in &lines {
            self.notify(line);
        }
    }

    /// Remembered lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.sink.lock().recent.iter().cloned().collect()
    }

    pub fn flush(&self) {
        if let Some(file) = self.sink.lock().file.as_mut() {
            let _ = file.flush();
        }
    }

    /// Flush and release the file; the callback keeps receiving lines.
    pub fn close(&self) {
        if let Some(mut file) = self.sink.lock().file.take() {
            let _ = file.flush();
        }
    }

    fn stamp(&self, message: &str) -> String {
        if self.config.show_timestamps {
            format!("[{}] {}", Local::now().format("%H:%M:%S"), message)
        } else {
            message.to_string()
        }
    }

    fn notify(&self, line: &str) {
        if let Some(callback) = &self.callback {
            callback(line);
        }
    }
}

impl Drop for JobLogger {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_line(sink: &mut Sink, line: &str) {
    if let Some(file) = sink.file.as_mut() {
        let _ = writeln!(file, "{}", line);
    }
}

/// Pair ids come from user JSON; keep them inside the log folder.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn quiet() -> LogConfig {
        LogConfig {
            show_timestamps: false,
            ..LogConfig::default()
        }
    }

    fn open(config: LogConfig, callback: Option<LogCallback>) -> (TempDir, JobLogger) {
        let dir = tempfile::tempdir().unwrap();
        let logger = JobLogger::new("pair_001", dir.path(), config, callback).unwrap();
        (dir, logger)
    }

    fn contents(logger: &JobLogger) -> String {
        logger.flush();
        fs::read_to_string(logger.log_path()).unwrap()
    }

    #[test]
    fn lines_land_in_the_job_file() {
        let (_dir, logger) = open(quiet(), None);
        logger.phase("Coarse pass");
        logger.info("12 chunks");

        assert!(logger.log_path().ends_with("pair_001.log"));
        let text = contents(&logger);
        assert!(text.contains("=== Coarse pass ==="));
        assert!(text.contains("12 chunks"));
    }

    #[test]
    fn compact_debug_lines_reach_only_the_tail() {
        let config = LogConfig {
            level: LogLevel::Debug,
            ..quiet()
        };
        let (_dir, logger) = open(config, None);
        logger.debug("chunk 3 failed");
        logger.info("done");

        let text = contents(&logger);
        assert!(!text.contains("chunk 3 failed"));
        assert!(text.contains("done"));
        assert_eq!(logger.tail(), vec!["chunk 3 failed", "done"]);
    }

    #[test]
    fn show_tail_replays_hidden_lines() {
        let config = LogConfig {
            level: LogLevel::Debug,
            ..quiet()
        };
        let (_dir, logger) = open(config, None);
        logger.debug("decoder warning");
        logger.error("decode failed");
        logger.show_tail("pair_001");

        let text = contents(&logger);
        assert!(text.contains("[pair_001/tail]"));
        assert!(text.contains("decoder warning"));
    }

    #[test]
    fn tail_keeps_only_the_newest_lines() {
        let config = LogConfig {
            error_tail: 3,
            ..quiet()
        };
        let (_dir, logger) = open(config, None);
        for i in 0..6 {
            logger.info(&format!("line {}", i));
        }
        assert_eq!(logger.tail(), vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn callback_gets_written_lines_only() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: LogCallback = Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let (_dir, logger) = open(quiet(), Some(callback));
        logger.info("a");
        logger.warn("b");
        logger.debug("below level");

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsafe_characters_are_replaced() {
        assert_eq!(file_stem("ep_01"), "ep_01");
        assert_eq!(file_stem("a/b:c"), "a_b_c");
        assert_eq!(file_stem("x\ny"), "x_y");
    }
}
