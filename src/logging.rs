//! Log output shared between processes: each record is written to the
//! log file under an exclusive `flock`.
use crate::{Error, Result};
use nix::fcntl::{flock, FlockArg};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::fd::AsRawFd,
    path::Path,
    sync::Arc,
};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

#[derive(Clone)]
pub struct LockedFile {
    file: Arc<File>,
}

impl LockedFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::ConfigError(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(LockedFile {
            file: Arc::new(file),
        })
    }
}

/// Buffers one record and writes it out when dropped.
pub struct LockedRecord {
    file: Arc<File>,
    buf: Vec<u8>,
}

impl Write for LockedRecord {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let fd = self.file.as_raw_fd();
        flock(fd, FlockArg::LockExclusive).map_err(io::Error::from)?;
        let written = (&*self.file).write_all(&self.buf);
        flock(fd, FlockArg::Unlock).ok();
        self.buf.clear();
        written
    }
}

impl Drop for LockedRecord {
    fn drop(&mut self) {
        self.flush().ok();
    }
}

impl<'a> MakeWriter<'a> for LockedFile {
    type Writer = LockedRecord;

    fn make_writer(&'a self) -> Self::Writer {
        LockedRecord {
            file: self.file.clone(),
            buf: Vec::new(),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides `level`.
pub fn init(logfile: Option<&Path>, level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true);
    let installed = match logfile {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(LockedFile::open(path)?)
            .try_init(),
        None => builder.try_init(),
    };
    installed.map_err(|e| Error::Error(format!("cannot install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_appended() {
        let path = std::env::temp_dir().join(format!("b2bua-log-{}.log", std::process::id()));
        std::fs::remove_file(&path).ok();
        let file = LockedFile::open(&path).unwrap();
        {
            let mut record = file.make_writer();
            record.write_all(b"first ").unwrap();
            record.write_all(b"record\n").unwrap();
        }
        let mut other = LockedFile::open(&path).unwrap().make_writer();
        other.write_all(b"second record\n").unwrap();
        drop(other);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first record\nsecond record\n");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unwritable_log_file() {
        let missing = Path::new("/nonexistent-dir/b2bua.log");
        assert!(matches!(LockedFile::open(missing), Err(Error::ConfigError(_))));
    }
}
