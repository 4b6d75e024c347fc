//! Per-run named pipe between generator and analyzer.
//!
//! The FIFO lives in a private directory created for the run. Dropping the
//! [`Channel`] removes the FIFO and then the directory, whatever the outcome
//! of the run.

use crate::error::ChannelError;
use nix::sys::stat::Mode;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

#[derive(Debug)]
pub struct Channel {
    dir: Option<tempfile::TempDir>,
    path: PathBuf,
}

impl Channel {
    /// Create `<root>/lhc-sim-XXXXXX/<name>` as a FIFO readable and writable by
    /// the owner only.
    pub fn acquire(root: &Path, name: &str) -> Result<Self, ChannelError> {
        let mut components = Path::new(name).components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            return Err(ChannelError::InvalidName(name.to_string()));
        }

        let dir = tempfile::Builder::new()
            .prefix("lhc-sim-")
            .tempdir_in(root)
            .map_err(ChannelError::Directory)?;
        let path = dir.path().join(name);
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|source| {
            ChannelError::Fifo {
                path: path.clone(),
                source,
            }
        })?;
        tracing::debug!(path = %path.display(), "channel acquired");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the FIFO and its directory, reporting failures.
    pub fn release(mut self) -> Result<(), ChannelError> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Result<(), ChannelError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ChannelError::Release {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        let dir_path = dir.path().to_path_buf();
        dir.close().map_err(|source| ChannelError::Release {
            path: dir_path,
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "channel released");
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "channel cleanup failed");
        }
    }
}

/// Release a reader blocked opening `path` once no writer will come.
///
/// Opens the FIFO for writing without blocking and closes it again, which
/// the reader observes as end of input. With no reader present the open
/// fails with `ENXIO` and nothing happens.
pub fn unblock_reader(path: &Path) {
    let res = OpenOptions::new()
        .write(true)
        .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
        .open(path);
    match res {
        Ok(_) => tracing::debug!(path = %path.display(), "released waiting reader"),
        Err(e) => tracing::trace!(path = %path.display(), error = %e, "no reader to release"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn acquire_creates_fifo_and_drop_removes_everything() {
        let root = tempfile::tempdir().unwrap();
        let channel = Channel::acquire(root.path(), "events.fifo").unwrap();
        let path = channel.path().to_path_buf();
        let dir = path.parent().unwrap().to_path_buf();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
        drop(channel);
        assert!(!path.exists());
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn release_tolerates_fifo_already_gone() {
        let root = tempfile::tempdir().unwrap();
        let channel = Channel::acquire(root.path(), "events.fifo").unwrap();
        std::fs::remove_file(channel.path()).unwrap();
        channel.release().unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn cleanup_runs_when_owner_panics() {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().to_path_buf();
        let res = std::panic::catch_unwind(move || {
            let _channel = Channel::acquire(&root_path, "events.fifo").unwrap();
            panic!("worker crashed");
        });
        assert!(res.is_err());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_names_that_escape_the_directory() {
        let root = tempfile::tempdir().unwrap();
        for name in ["", "../x", "a/b", "/abs", ".."] {
            assert!(matches!(
                Channel::acquire(root.path(), name),
                Err(ChannelError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn rendezvous_passes_bytes_and_unblock_ends_reader() {
        let root = tempfile::tempdir().unwrap();
        let channel = Channel::acquire(root.path(), "events.fifo").unwrap();
        let path = channel.path().to_path_buf();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            let mut f = OpenOptions::new().write(true).open(writer_path).unwrap();
            f.write_all(b"1.5\n2.5\n").unwrap();
        });
        let mut buf = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut buf).unwrap();
        writer.join().unwrap();
        assert_eq!(buf, "1.5\n2.5\n");

        // A reader with no writer is released by unblock_reader.
        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            let mut s = String::new();
            std::fs::File::open(reader_path).unwrap().read_to_string(&mut s).unwrap();
            s
        });
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !reader.is_finished() && std::time::Instant::now() < deadline {
            unblock_reader(&path);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(reader.join().unwrap(), "");
    }
}
