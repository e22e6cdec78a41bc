//! Configuration provider: where to find the server when it is not given
//! on the command line.
//!
//! Some deployments keep the server address in a file on a partition that
//! has to be mounted first. That sequence is modelled as a scoped
//! acquisition: `MountGuard` mounts on construction and unmounts on drop,
//! so the unmount happens on every exit path, read failures included.
//! Performing the OS-level mount is left to `Mount` implementations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while fetching an address.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to mount: {0}")]
    Mount(#[source] io::Error),
    #[error("failed to unmount: {0}")]
    Unmount(#[source] io::Error),
    #[error("failed to read '{}': {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{}' contains no address", .0.display())]
    Empty(PathBuf),
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

/// Something that returns a server address as text.
pub trait AddressProvider {
    fn address(&self) -> Result<String, ProviderError>;
}

/// A filesystem that must be made available before it can be read.
pub trait Mount {
    /// Make the filesystem available and return its root.
    fn mount(&self) -> io::Result<PathBuf>;
    fn unmount(&self) -> io::Result<()>;
}

/// A directory that is already available; mounting and unmounting are no-ops.
#[derive(Debug, Clone)]
pub struct PreMounted {
    root: PathBuf,
}

impl PreMounted {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Mount for PreMounted {
    fn mount(&self) -> io::Result<PathBuf> {
        Ok(self.root.clone())
    }

    fn unmount(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Holds a mount for as long as it lives.
pub struct MountGuard<'a, M: Mount> {
    mount: &'a M,
    root: PathBuf,
    released: bool,
}

impl<'a, M: Mount> MountGuard<'a, M> {
    pub fn acquire(mount: &'a M) -> Result<Self, ProviderError> {
        let root = mount.mount().map_err(ProviderError::Mount)?;
        debug!(root = %root.display(), "Mounted");
        Ok(Self {
            mount,
            root,
            released: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unmount now and report the outcome, instead of leaving it to drop.
    pub fn release(mut self) -> Result<(), ProviderError> {
        self.released = true;
        self.mount.unmount().map_err(ProviderError::Unmount)
    }
}

impl<M: Mount> Drop for MountGuard<'_, M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.mount.unmount() {
            warn!(root = %self.root.display(), error = %e, "Failed to unmount");
        }
    }
}

/// Reads the address from a file relative to a mount root.
///
/// The first line that is neither blank nor a `#` comment is the address.
pub struct FileAddressProvider<M: Mount> {
    mount: M,
    relative_path: PathBuf,
}

impl<M: Mount> FileAddressProvider<M> {
    pub fn new(mount: M, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            mount,
            relative_path: relative_path.into(),
        }
    }
}

impl FileAddressProvider<PreMounted> {
    /// Provider for a plain file path, no mounting involved.
    pub fn for_path(path: &Path) -> Self {
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file = path.file_name().map(PathBuf::from).unwrap_or_default();
        Self::new(PreMounted::new(root), file)
    }
}

impl<M: Mount> AddressProvider for FileAddressProvider<M> {
    fn address(&self) -> Result<String, ProviderError> {
        let guard = MountGuard::acquire(&self.mount)?;
        let path = guard.root().join(&self.relative_path);

        let contents = fs::read_to_string(&path).map_err(|e| ProviderError::Read {
            path: path.clone(),
            source: e,
        })?;

        let address = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Empty(path.clone()))?;

        guard.release()?;
        Ok(address)
    }
}

/// Split an address into host and port.
///
/// Accepts `host`, `host:port`, and URLs such as `http://host:port/path`.
/// A missing port falls back to `default_port`.
pub fn parse_endpoint(text: &str, default_port: u16) -> Result<(String, u16), ProviderError> {
    let invalid = || ProviderError::InvalidEndpoint(text.to_string());

    let trimmed = text.trim();
    let without_scheme = match trimmed.find("://") {
        Some(pos) => &trimmed[pos + 3..],
        None => trimmed,
    };
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (authority, default_port),
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}
