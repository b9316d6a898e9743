//! Named pipes realised as Unix domain sockets.
//!
//! A pipe name (a coordination name, or a session data-pipe name derived from
//! it) maps to a socket file inside a [`PipeNamespace`] directory. Listeners
//! are non-blocking so that accept loops can observe cancellation; accepted
//! and connected streams are blocking.

use acq_core::config::PipeConfig;
use acq_pool::CancelToken;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Directory in which pipe names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeNamespace {
    directory: PathBuf,
}

impl PipeNamespace {
    /// Namespace rooted at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Namespace from configuration, defaulting to a subdirectory of the
    /// system temp dir.
    #[must_use]
    pub fn from_config(config: &PipeConfig) -> Self {
        match &config.directory {
            Some(dir) => Self::new(dir),
            None => Self::default(),
        }
    }

    /// Directory holding the socket files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Socket path for `name`. Path separators in the name are replaced.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.directory.join(format!("{file}.sock"))
    }
}

impl Default for PipeNamespace {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("lab-acq-pipes"))
    }
}

/// Name of the data pipe for one streaming session.
#[must_use]
pub fn session_pipe_name(coordination_name: &str, instance: u64, session: u64) -> String {
    format!("{coordination_name}.data.{instance}.{session}")
}

/// Listening end of a named pipe.
///
/// The socket file is removed on drop unless another listener has since
/// been bound at the same path.
pub struct PipeListener {
    listener: UnixListener,
    path: PathBuf,
    identity: Option<(u64, u64)>,
}

impl PipeListener {
    /// Bind `name` in `namespace`, replacing a stale socket file.
    pub fn bind(namespace: &PipeNamespace, name: &str) -> io::Result<Self> {
        fs::create_dir_all(namespace.directory())?;
        let path = namespace.path_for(name);
        if let Ok(meta) = fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                debug!(path = %path.display(), "removing stale pipe endpoint");
                fs::remove_file(&path)?;
            } else {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a pipe endpoint", path.display()),
                ));
            }
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        let identity = fs::metadata(&path).ok().map(|m| (m.dev(), m.ino()));
        trace!(path = %path.display(), "pipe listening");
        Ok(Self {
            listener,
            path,
            identity,
        })
    }

    /// Socket path of this listener.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a pending connection without blocking.
    pub fn try_accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Accept a connection, polling every `poll` until one of `cancel` fires.
    ///
    /// Returns `Ok(None)` on cancellation.
    pub fn accept_until(
        &self,
        cancel: &[&CancelToken],
        poll: Duration,
    ) -> io::Result<Option<UnixStream>> {
        loop {
            if cancel.iter().any(|c| c.is_cancelled()) {
                return Ok(None);
            }
            if let Some(stream) = self.try_accept()? {
                return Ok(Some(stream));
            }
            match cancel.first() {
                Some(token) => {
                    token.wait_timeout(poll);
                }
                None => std::thread::sleep(poll),
            }
        }
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let still_ours = fs::metadata(&self.path)
            .ok()
            .map(|m| (m.dev(), m.ino()))
            .is_some_and(|id| Some(id) == self.identity);
        if still_ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl std::fmt::Debug for PipeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeListener")
            .field("path", &self.path)
            .finish()
    }
}

/// Connect to `name`, retrying until the pipe exists and accepts or
/// `timeout` elapses.
pub fn connect(namespace: &PipeNamespace, name: &str, timeout: Duration) -> io::Result<UnixStream> {
    let path = namespace.path_for(name);
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(&path) {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no pipe listening at {} ({e})", path.display()),
                    ));
                }
                std::thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_session_pipe_name() {
        assert_eq!(session_pipe_name("Lab.Acq.Fake", 3, 7), "Lab.Acq.Fake.data.3.7");
    }

    #[test]
    fn test_path_for_sanitizes_separators() {
        let ns = PipeNamespace::new("/tmp/x");
        assert_eq!(ns.path_for("a/b\\c"), PathBuf::from("/tmp/x/a_b_c.sock"));
    }

    #[test]
    fn test_connect_accept_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ns = PipeNamespace::new(dir.path());
        let listener = PipeListener::bind(&ns, "ctl").unwrap();
        let mut client = connect(&ns, "ctl", Duration::from_secs(1)).unwrap();
        let cancel = CancelToken::new();
        let mut server = listener
            .accept_until(&[&cancel], Duration::from_millis(5))
            .unwrap()
            .unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_connect_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let ns = PipeNamespace::new(dir.path());
        let err = connect(&ns, "nobody", Duration::from_millis(30)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_accept_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let ns = PipeNamespace::new(dir.path());
        let listener = PipeListener::bind(&ns, "idle").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(listener
            .accept_until(&[&cancel], Duration::from_millis(5))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rebind_replaces_stale_endpoint_and_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let ns = PipeNamespace::new(dir.path());
        let first = PipeListener::bind(&ns, "same").unwrap();
        let second = PipeListener::bind(&ns, "same").unwrap();
        drop(first);
        assert!(ns.path_for("same").exists(), "newer endpoint kept");
        drop(second);
        assert!(!ns.path_for("same").exists());
    }
}
