//! Byte transfer with `SCM_RIGHTS` descriptors over Unix stream sockets.

use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use super::buffer::MAX_FDS_PER_MSG;

// Control buffer, 8-byte aligned as `cmsghdr` requires.
type CmsgBuf = [u64; 32];

fn cmsg_space(count: usize) -> usize {
    unsafe { libc::CMSG_SPACE((count * mem::size_of::<RawFd>()) as u32) as usize }
}

/// Receives bytes into `buf`, pushing at most `max_fds` passed descriptors
/// into `fds`. Returns the byte count; zero means end-of-stream.
pub fn recv_with_fds(
    fd: RawFd,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
    max_fds: usize,
) -> Result<usize> {
    let max_fds = max_fds.min(MAX_FDS_PER_MSG);
    let mut cmsg: CmsgBuf = [0; 32];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if max_fds > 0 {
        msg.msg_control = cmsg.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space(max_fds).min(mem::size_of::<CmsgBuf>()) as _;
    }

    let size = loop {
        let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    };

    // Take ownership of everything the kernel installed before looking at
    // the flags, so that nothing leaks on the error path.
    let before = fds.len();
    unsafe {
        let mut hdr = libc::CMSG_FIRSTHDR(&msg);
        while !hdr.is_null() {
            if (*hdr).cmsg_level == libc::SOL_SOCKET && (*hdr).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*hdr).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(hdr) as *const RawFd;
                for i in 0..payload / mem::size_of::<RawFd>() {
                    fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                }
            }
            hdr = libc::CMSG_NXTHDR(&msg, hdr);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 || fds.len() - before > max_fds {
        fds.truncate(before);
        return Err(Error::new(
            ErrorKind::InvalidData,
            "passed file descriptors were truncated",
        ));
    }

    Ok(size)
}

// The descriptors travel with the first byte of `buf`.
pub fn send_with_fds(fd: RawFd, buf: &[u8], fds: &[OwnedFd]) -> Result<usize> {
    if fds.len() > MAX_FDS_PER_MSG {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("cannot pass {} descriptors in one message", fds.len()),
        ));
    }

    let mut cmsg: CmsgBuf = [0; 32];
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if !fds.is_empty() {
        let len = fds.len() * mem::size_of::<RawFd>();
        msg.msg_control = cmsg.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space(fds.len()) as _;
        unsafe {
            let hdr = libc::CMSG_FIRSTHDR(&msg);
            (*hdr).cmsg_level = libc::SOL_SOCKET;
            (*hdr).cmsg_type = libc::SCM_RIGHTS;
            (*hdr).cmsg_len = libc::CMSG_LEN(len as u32) as _;
            let data = libc::CMSG_DATA(hdr) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(data.add(i), fd.as_raw_fd());
            }
        }
    }

    loop {
        let ret = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn send(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let ret = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
