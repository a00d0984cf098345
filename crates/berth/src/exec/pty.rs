//! PTY (pseudo-terminal) handling.

#![allow(unsafe_code)]

use std::os::fd::{AsFd, OwnedFd};
use std::process::Stdio;

use berth_common::{BerthError, BerthResult};
use rustix::fs::{Mode, OFlags};
use rustix::pty::{OpenptFlags, grantpt, openpt, ptsname, unlockpt};

fn pty_error(what: &str, err: impl std::fmt::Display) -> BerthError {
    BerthError::Internal {
        message: format!("{what}: {err}"),
    }
}

/// A pseudo-terminal master/slave pair.
#[derive(Debug)]
pub struct PtyPair {
    master: OwnedFd,
    slave: Option<OwnedFd>,
}

impl PtyPair {
    /// Allocate a new pair.
    ///
    /// # Errors
    ///
    /// Returns an error if no pseudo-terminal can be allocated.
    pub fn open() -> BerthResult<Self> {
        let master = openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY | OpenptFlags::CLOEXEC)
            .map_err(|e| pty_error("failed to open PTY master", e))?;
        grantpt(&master).map_err(|e| pty_error("grantpt failed", e))?;
        unlockpt(&master).map_err(|e| pty_error("unlockpt failed", e))?;

        let name = ptsname(&master, Vec::new()).map_err(|e| pty_error("ptsname failed", e))?;
        let slave = rustix::fs::open(
            name.as_c_str(),
            OFlags::RDWR | OFlags::NOCTTY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| pty_error("failed to open PTY slave", e))?;

        tracing::debug!(slave = ?name, "Allocated PTY");
        Ok(Self {
            master,
            slave: Some(slave),
        })
    }

    /// The slave side, once per child stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the slave was already closed or cannot be duplicated.
    pub fn slave_stdio(&self) -> BerthResult<Stdio> {
        let slave = self
            .slave
            .as_ref()
            .ok_or_else(|| pty_error("PTY slave", "already closed"))?;
        Ok(Stdio::from(slave.as_fd().try_clone_to_owned()?))
    }

    /// Drop the parent's slave fd so the master sees EOF when the child exits.
    pub fn close_slave(&mut self) {
        self.slave.take();
    }

    /// Split the master into a reader and a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the master cannot be duplicated.
    pub fn into_master(self) -> BerthResult<(tokio::fs::File, tokio::fs::File)> {
        let writer = std::fs::File::from(self.master.try_clone()?);
        let reader = std::fs::File::from(self.master);
        Ok((
            tokio::fs::File::from_std(reader),
            tokio::fs::File::from_std(writer),
        ))
    }
}

/// Make the slave on fd 0 the controlling terminal of a new session.
///
/// Runs in the forked child before exec.
pub(crate) fn set_controlling_terminal() -> std::io::Result<()> {
    // SAFETY: setsid and ioctl are async-signal-safe and only touch the child.
    unsafe {
        if libc::setsid() < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
