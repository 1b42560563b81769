//! 套接字选项（发送/接收缓冲区、可读字节数）

#[cfg(unix)]
mod imp {
    use nix::sys::socket::{setsockopt, sockopt};
    use std::os::fd::{AsRawFd, BorrowedFd};

    pub(crate) fn set_buffer_sizes<S: AsRawFd>(socket: &S, send: usize, receive: usize) {
        // SAFETY: `socket` 在本函数调用期间保持打开
        let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
        if send > 0
            && let Err(e) = setsockopt(&fd, sockopt::SndBuf, &send)
        {
            tracing::warn!("Failed to set SO_SNDBUF={}: {}", send, e);
        }
        if receive > 0
            && let Err(e) = setsockopt(&fd, sockopt::RcvBuf, &receive)
        {
            tracing::warn!("Failed to set SO_RCVBUF={}: {}", receive, e);
        }
    }

    pub(crate) fn bytes_available<S: AsRawFd>(socket: &S) -> usize {
        let mut count: libc::c_int = 0;
        // SAFETY: FIONREAD 只写入一个 c_int
        let ret = unsafe {
            libc::ioctl(
                socket.as_raw_fd(),
                libc::FIONREAD,
                &mut count as *mut libc::c_int,
            )
        };
        if ret < 0 { 0 } else { count.max(0) as usize }
    }
}

#[cfg(not(unix))]
mod imp {
    pub(crate) fn set_buffer_sizes<S>(_socket: &S, send: usize, receive: usize) {
        if send > 0 || receive > 0 {
            tracing::debug!("Socket buffer sizes are not configurable on this platform");
        }
    }

    pub(crate) fn bytes_available<S>(_socket: &S) -> usize {
        0
    }
}

pub(crate) use imp::{bytes_available, set_buffer_sizes};
