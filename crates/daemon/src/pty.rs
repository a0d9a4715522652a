//! Raw pseudo-terminal pairs.
//!
//! Tracked processes own a pty pair whose slave side is wired to their
//! stdout/stderr. They hand both halves to the broker, which reads the
//! master to show their output in a log session.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;

/// Both halves of a pseudo-terminal.
#[derive(Debug)]
pub struct PtyPair {
    master: OwnedFd,
    slave: OwnedFd,
}

impl PtyPair {
    /// Open a new pair sized `cols` x `rows`, in UTF-8 input mode.
    pub fn open(cols: u16, rows: u16) -> io::Result<Self> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pair = openpty(Some(&winsize), None::<&Termios>).map_err(io::Error::from)?;
        let pty = Self {
            master: pair.master,
            slave: pair.slave,
        };
        // Spawned sessions must not inherit other sessions' ptys.
        set_cloexec(&pty.master)?;
        set_cloexec(&pty.slave)?;
        pty.enable_utf8()?;
        Ok(pty)
    }

    /// Wrap descriptors received from another process.
    pub fn from_fds(master: OwnedFd, slave: OwnedFd) -> Self {
        Self { master, slave }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn enable_utf8(&self) -> io::Result<()> {
        use nix::sys::termios::{tcgetattr, tcsetattr, InputFlags, SetArg};

        let mut termios = tcgetattr(self.slave.as_fd()).map_err(io::Error::from)?;
        termios.input_flags.insert(InputFlags::IUTF8);
        tcsetattr(self.slave.as_fd(), SetArg::TCSANOW, &termios).map_err(io::Error::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn enable_utf8(&self) -> io::Result<()> {
        Ok(())
    }

    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn slave(&self) -> BorrowedFd<'_> {
        self.slave.as_fd()
    }

    /// Duplicate the master side.
    pub fn try_clone_master(&self) -> io::Result<OwnedFd> {
        self.master.try_clone()
    }

    /// Duplicate both halves.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            master: self.master.try_clone()?,
            slave: self.slave.try_clone()?,
        })
    }

    /// A writable handle on the slave side.
    pub fn slave_writer(&self) -> io::Result<File> {
        Ok(File::from(self.slave.try_clone()?))
    }

    /// The slave side as a child process stdio handle.
    pub fn slave_stdio(&self) -> io::Result<Stdio> {
        Ok(Stdio::from(self.slave.try_clone()?))
    }

    pub fn into_fds(self) -> (OwnedFd, OwnedFd) {
        (self.master, self.slave)
    }
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(drop)
        .map_err(io::Error::from)
}
