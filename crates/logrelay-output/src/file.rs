use async_trait::async_trait;
use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use logrelay_core::config::FileSinkConfig;
use logrelay_core::{LogEntry, OutputError, Severity, Sink};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;

/// When the active log file is retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    /// Once the file reaches this many bytes
    Size(u64),
    /// At the first write of a new local day
    Daily,
    /// At the first write of a new local hour
    Hourly,
    None,
}

impl RotationStrategy {
    /// Unknown strategies and unparsable sizes fall back to 5MB size rotation
    pub fn from_config(rotation: &str, max_size: &str) -> Self {
        match rotation.trim().to_ascii_lowercase().as_str() {
            "daily" => Self::Daily,
            "hourly" => Self::Hourly,
            "none" | "off" | "disabled" => Self::None,
            _ => Self::Size(parse_size(max_size).unwrap_or(DEFAULT_MAX_SIZE)),
        }
    }

    /// Label of the time period `now` falls in, for time-based strategies
    fn period(&self, now: DateTime<Local>) -> Option<String> {
        match self {
            Self::Daily => Some(now.format("%Y-%m-%d").to_string()),
            Self::Hourly => Some(now.format("%Y-%m-%d-%H").to_string()),
            Self::Size(_) | Self::None => None,
        }
    }
}

/// "5MB", "512 KB", "1gb", "2048B"; a bare number is megabytes
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "K" | "KB" => 1024,
        "B" => 1,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// `<RFC3339 timestamp> <SEVERITY> <message>`
pub fn format_line(entry: &LogEntry) -> String {
    format!(
        "{} {} {}",
        entry.timestamp_rfc3339(),
        entry.severity,
        entry.raw
    )
}

/// `dir/stem-<suffix>.ext`
fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let stem = base.file_stem().unwrap_or_default().to_string_lossy();
    let name = match base.extension() {
        Some(ext) => format!("{}-{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}-{}", stem, suffix),
    };
    base.with_file_name(name)
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

fn open_append(path: &Path) -> Result<(BufWriter<File>, u64), OutputError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| OutputError::File(format!("Failed to open {}: {}", path.display(), e)))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);

    debug!(path = %path.display(), size, "Opened log file");
    Ok((BufWriter::new(file), size))
}

/// Replace `path` with a gzip copy at `path.gz`
fn gzip(path: &Path) -> Result<PathBuf, OutputError> {
    let target = gz_path(path);
    let err = |what: &str, e: io::Error| {
        OutputError::File(format!("Failed to {} {}: {}", what, path.display(), e))
    };

    let mut input = File::open(path).map_err(|e| err("read", e))?;
    let output = File::create(&target).map_err(|e| err("create archive for", e))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder).map_err(|e| err("compress", e))?;
    encoder.finish().map_err(|e| err("compress", e))?;
    fs::remove_file(path).map_err(|e| err("remove", e))?;

    debug!(path = %target.display(), "Compressed rotated log file");
    Ok(target)
}

/// An append-only log file that retires itself by size or by time
///
/// Size rotation renames the full file to `stem-<timestamp>.ext` and starts
/// over at the configured path. Time rotation writes straight into
/// `stem-<period>.ext`, so retiring is just moving on to the next name.
/// Either way at most `max_files` retired files are kept.
pub struct RotatingFile {
    base: PathBuf,
    strategy: RotationStrategy,
    keep: usize,
    compress: bool,
    writer: BufWriter<File>,
    path: PathBuf,
    period: Option<String>,
    size: u64,
    lines_written: u64,
}

impl RotatingFile {
    pub fn open(config: &FileSinkConfig) -> Result<Self, OutputError> {
        let base = PathBuf::from(&config.path);
        if let Some(dir) = base.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                OutputError::File(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let strategy = RotationStrategy::from_config(&config.rotation, &config.max_size);
        let period = strategy.period(Local::now());
        let path = match &period {
            Some(period) => with_suffix(&base, period),
            None => base.clone(),
        };
        let (writer, size) = open_append(&path)?;

        info!(path = %path.display(), rotation = ?strategy, "Writing log file");

        Ok(Self {
            base,
            strategy,
            keep: config.max_files,
            compress: config.compress,
            writer,
            path,
            period,
            size,
            lines_written: 0,
        })
    }

    /// Append one line, rotating first if the current file is due
    pub fn write_line(&mut self, line: &str) -> Result<(), OutputError> {
        if self.rotation_due() {
            self.rotate()?;
        }

        writeln!(self.writer, "{}", line).map_err(|e| {
            OutputError::File(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        self.size += line.len() as u64 + 1;
        self.lines_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush().map_err(|e| {
            OutputError::File(format!("Failed to flush {}: {}", self.path.display(), e))
        })
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    fn rotation_due(&self) -> bool {
        match self.strategy {
            RotationStrategy::Size(limit) => self.size >= limit,
            RotationStrategy::None => false,
            RotationStrategy::Daily | RotationStrategy::Hourly => {
                self.strategy.period(Local::now()) != self.period
            }
        }
    }

    fn rotate(&mut self) -> Result<(), OutputError> {
        self.flush()?;

        let retired = match self.strategy {
            RotationStrategy::Size(_) => {
                let archive = self.archive_path();
                fs::rename(&self.path, &archive).map_err(|e| {
                    OutputError::File(format!("Failed to rotate {}: {}", self.path.display(), e))
                })?;
                archive
            }
            _ => self.path.clone(),
        };

        self.period = self.strategy.period(Local::now());
        self.path = match &self.period {
            Some(period) => with_suffix(&self.base, period),
            None => self.base.clone(),
        };
        let (writer, size) = open_append(&self.path)?;
        self.writer = writer;
        self.size = size;

        info!(retired = %retired.display(), path = %self.path.display(), "Rotated log file");

        if self.compress {
            if let Err(e) = gzip(&retired) {
                warn!(error = %e, "Failed to compress rotated log file");
            }
        }
        self.prune();
        Ok(())
    }

    /// Unused `stem-<timestamp>[-n].ext` name for a size-rotated file
    fn archive_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        (0u32..)
            .map(|n| match n {
                0 => with_suffix(&self.base, &stamp),
                n => with_suffix(&self.base, &format!("{}-{}", stamp, n)),
            })
            .find(|p| !p.exists() && !gz_path(p).exists())
            .unwrap_or_else(|| with_suffix(&self.base, &stamp))
    }

    /// Delete the oldest retired files beyond `keep`
    fn prune(&self) {
        let dir = match self.base.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let prefix = format!(
            "{}-",
            self.base.file_stem().unwrap_or_default().to_string_lossy()
        );

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to list log directory");
                return;
            }
        };

        let mut retired: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
            .map(|entry| entry.path())
            .filter(|path| *path != self.path)
            .filter_map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();

        if retired.len() <= self.keep {
            return;
        }
        retired.sort();
        let excess = retired.len() - self.keep;

        for (_, path) in retired.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed old log file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove old log file"),
            }
        }
    }
}

impl Drop for RotatingFile {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush log file on drop");
        }
    }
}

enum Target {
    Stdout,
    File(RotatingFile),
}

/// Plain text sink: one line per entry to stdout or a rotated file
pub struct FileSink {
    level: Severity,
    target: Mutex<Target>,
}

impl FileSink {
    pub fn new(config: &FileSinkConfig) -> Result<Self, OutputError> {
        let target = if config.stdout {
            Target::Stdout
        } else {
            Target::File(RotatingFile::open(config)?)
        };

        Ok(Self {
            level: config.level,
            target: Mutex::new(target),
        })
    }

    /// Path of the file currently written, `None` for stdout
    pub fn current_path(&self) -> Option<PathBuf> {
        match &*self.target.lock() {
            Target::Stdout => None,
            Target::File(file) => Some(file.current_path().to_path_buf()),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn minimum_level(&self) -> Severity {
        self.level
    }

    async fn write(&self, entry: &LogEntry) -> Result<(), OutputError> {
        let line = format_line(entry);
        let mut target = self.target.lock();
        match &mut *target {
            Target::Stdout => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", line).map_err(|e| OutputError::Stdout(e.to_string()))
            }
            Target::File(file) => {
                file.write_line(&line)?;
                // Fatal exits the process shortly after; don't leave it in the buffer
                if entry.severity.is_escalation() {
                    file.flush()?;
                }
                Ok(())
            }
        }
    }

    async fn close(&self) {
        if let Target::File(file) = &mut *self.target.lock() {
            if let Err(e) = file.flush() {
                warn!(error = %e, "Failed to flush log file on close");
            }
        }
    }
}
