//! `sendmsg`/`recvmsg` with `SCM_RIGHTS` ancillary data.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

/// Most descriptors accepted with one read.
const MAX_FDS_PER_READ: usize = 8;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Send `data`, attaching `fds` to its first byte.
///
/// Returns how many bytes went out; the caller resends the rest without
/// descriptors.
pub(crate) fn send_with_fds(socket: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    sendmsg::<UnixAddr>(socket, &iov, cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
}

/// Read into `buf`, queueing any received descriptors on `fds`.
///
/// Returns 0 at end of stream.
pub(crate) fn recv_with_fds(
    socket: RawFd,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = cmsg_space!([RawFd; MAX_FDS_PER_READ]);
    let msg = recvmsg::<UnixAddr>(socket, &mut iov, Some(&mut cmsg_buf), recv_flags())
        .map_err(io::Error::from)?;

    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: the kernel just installed `raw` in our table and
                // nothing else refers to it.
                fds.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        tracing::warn!("control data truncated, descriptors were dropped");
    }
    Ok(msg.bytes)
}
