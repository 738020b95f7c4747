//! One-shot descriptor passing between a parent and a forked child.
//!
//! A plain pipe cannot carry a file descriptor across processes; the
//! namespace helper hands its descriptor back over a unix socketpair with
//! SCM_RIGHTS instead.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr,
};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed unix syscall: {0}")]
    Nix(#[from] nix::Error),
    #[error("channel connection broken")]
    BrokenChannel,
}

pub struct FdSender {
    socket: OwnedFd,
}

pub struct FdReceiver {
    socket: OwnedFd,
}

/// Creates a connected sender/receiver pair. After a fork each side keeps
/// only its own end; dropping the other closes it, which lets the receiver
/// observe a child that died before sending.
pub fn fd_channel() -> Result<(FdSender, FdReceiver), ChannelError> {
    let (first, second) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;

    Ok((FdSender { socket: first }, FdReceiver { socket: second }))
}

impl FdSender {
    pub fn send(&self, fd: RawFd) -> Result<(), ChannelError> {
        let iov = [IoSlice::new(b"fd")];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        socket::sendmsg::<UnixAddr>(
            self.socket.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )?;
        Ok(())
    }
}

impl FdReceiver {
    pub fn recv(&self) -> Result<OwnedFd, ChannelError> {
        let mut buf = [0u8; 2];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
        let msg = socket::recvmsg::<UnixAddr>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;

        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(fd) = fds.first() {
                    return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
                }
            }
        }

        Err(ChannelError::BrokenChannel)
    }
}
