use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{info, warn};
use thiserror::Error;

use crate::{config::DATA_LOG_HEADER, types::LogEntry};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("{0} not found")]
    Missing(PathBuf),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl LogError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only CSV of readings.
///
/// The sampling loop is the only writer; HTTP handlers read and delete through a
/// clone, serialised by the shared lock.
#[derive(Debug, Clone)]
pub struct DataLog {
    path: Arc<PathBuf>,
    max_bytes: Option<u64>,
    lock: Arc<Mutex<()>>,
}

impl DataLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: Option<u64>) -> Self {
        Self {
            path: Arc::new(path.into()),
            max_bytes,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_ref()
    }

    /// Sibling file that receives the previous log when the size cap is hit.
    pub fn archive_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("data");
        self.path.with_file_name(format!("{stem}.old.csv"))
    }

    /// Writes the header into a missing or empty file. Existing rows are left alone.
    pub fn initialize(&self) -> Result<(), LogError> {
        let _guard = self.lock.lock().unwrap();
        self.ensure_header()
    }

    pub fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        let _guard = self.lock.lock().unwrap();
        let row = format!("{}\n", entry.to_row());

        if let Some(max_bytes) = self.max_bytes {
            let current = match fs::metadata(self.path()) {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == ErrorKind::NotFound => 0,
                Err(err) => return Err(LogError::io(self.path(), err)),
            };
            if current > 0 && current + row.len() as u64 > max_bytes {
                self.rotate()?;
            }
        }

        self.ensure_header()?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(self.path())
            .map_err(|err| LogError::io(self.path(), err))?;
        file.write_all(row.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|err| LogError::io(self.path(), err))
    }

    pub fn read_all(&self) -> Result<String, LogError> {
        let _guard = self.lock.lock().unwrap();
        match fs::read_to_string(self.path()) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(LogError::Missing(self.path().to_path_buf()))
            }
            Err(err) => Err(LogError::io(self.path(), err)),
        }
    }

    /// Opens the log for reading in pieces of at most `chunk_size` bytes.
    ///
    /// The lock is held until the reader is dropped, so appends wait for the
    /// whole file to go out.
    pub fn open_reader(&self, chunk_size: usize) -> Result<LogReader<'_>, LogError> {
        let guard = self.lock.lock().unwrap();
        let file = match File::open(self.path()) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(LogError::Missing(self.path().to_path_buf()))
            }
            Err(err) => return Err(LogError::io(self.path(), err)),
        };
        Ok(LogReader {
            _guard: guard,
            file,
            path: self.path(),
            buf: vec![0; chunk_size.max(1)],
        })
    }

    pub fn delete(&self) -> Result<(), LogError> {
        let _guard = self.lock.lock().unwrap();
        match fs::remove_file(self.path()) {
            Ok(()) => {
                info!("{} deleted", self.path().display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(LogError::Missing(self.path().to_path_buf()))
            }
            Err(err) => Err(LogError::io(self.path(), err)),
        }
    }

    fn ensure_header(&self) -> Result<(), LogError> {
        let needs_header = match fs::metadata(self.path()) {
            Ok(meta) => meta.len() == 0,
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => return Err(LogError::io(self.path(), err)),
        };

        if needs_header {
            if let Some(parent) = self.path().parent() {
                fs::create_dir_all(parent).map_err(|err| LogError::io(self.path(), err))?;
            }
            fs::write(self.path(), format!("{DATA_LOG_HEADER}\n"))
                .map_err(|err| LogError::io(self.path(), err))?;
            info!("{} created", self.path().display());
        }
        Ok(())
    }

    fn rotate(&self) -> Result<(), LogError> {
        let archive = self.archive_path();
        if let Err(err) = fs::remove_file(&archive) {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to drop old archive {}: {err}", archive.display());
            }
        }
        fs::rename(self.path(), &archive).map_err(|err| LogError::io(self.path(), err))?;
        info!(
            "{} reached its size cap; archived to {}",
            self.path().display(),
            archive.display()
        );
        Ok(())
    }
}

/// Chunked view of the log, see [`DataLog::open_reader`].
pub struct LogReader<'a> {
    _guard: MutexGuard<'a, ()>,
    file: File,
    path: &'a Path,
    buf: Vec<u8>,
}

impl LogReader<'_> {
    /// Next piece of the file, or `None` at the end.
    pub fn next_chunk(&mut self) -> Result<Option<&[u8]>, LogError> {
        loop {
            match self.file.read(&mut self.buf) {
                Ok(0) => return Ok(None),
                Ok(len) => return Ok(Some(&self.buf[..len])),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(LogError::io(self.path, err)),
            }
        }
    }
}
