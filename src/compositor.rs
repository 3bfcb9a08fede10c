use std::env;
use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

const DEFAULT_DISPLAY: &str = "wayland-0";

// Configured name, then $WAYLAND_DISPLAY. Relative names live in $XDG_RUNTIME_DIR.
pub fn resolve_socket(name: Option<&str>) -> Result<PathBuf> {
    let name = match name {
        Some(name) => name.to_owned(),
        None => env::var("WAYLAND_DISPLAY").unwrap_or_else(|_| DEFAULT_DISPLAY.to_owned()),
    };

    let path = Path::new(&name);
    if path.is_absolute() {
        return Ok(path.to_owned());
    }

    let runtime_dir = env::var_os("XDG_RUNTIME_DIR").ok_or_else(|| {
        Error::new(
            ErrorKind::NotFound,
            format!("XDG_RUNTIME_DIR is not set, cannot locate {}", name),
        )
    })?;
    Ok(PathBuf::from(runtime_dir).join(path))
}

#[derive(Debug, Clone)]
pub struct Connector {
    path: PathBuf,
}

impl Connector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Connector { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connects without blocking. A full listen backlog shows up as
    /// `WouldBlock` and, like any other error here, fails only the session
    /// being established.
    pub fn connect(&self) -> Result<UnixStream> {
        let bytes = self.path.as_os_str().as_bytes();

        unsafe {
            let mut addr: libc::sockaddr_un = mem::zeroed();
            addr.sun_family = libc::AF_UNIX as _;
            if bytes.len() >= addr.sun_path.len() {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("socket path {} is too long", self.path.display()),
                ));
            }
            for (dst, &src) in addr.sun_path.iter_mut().zip(bytes) {
                *dst = src as libc::c_char;
            }

            let fd = libc::socket(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            );
            if fd < 0 {
                return Err(Error::last_os_error());
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
            let result = libc::connect(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                len as libc::socklen_t,
            );
            if result < 0 {
                return Err(Error::last_os_error());
            }

            UnixStream::from_std(std::os::unix::net::UnixStream::from(fd))
        }
    }
}
