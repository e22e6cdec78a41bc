//! Phone-home greeting built from the local hostname.

use std::io;

/// Message sent by `connect` when no other message is given.
pub const DEFAULT_MESSAGE: &str = "Hello Server";

/// This machine's hostname.
#[cfg(unix)]
pub fn local_hostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

#[cfg(not(unix))]
pub fn local_hostname() -> io::Result<String> {
    std::env::var("COMPUTERNAME").map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))
}

/// `"Hello from <hostname>"`.
pub fn greeting() -> io::Result<String> {
    Ok(format!("Hello from {}", local_hostname()?))
}
