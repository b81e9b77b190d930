//! Thin RAII wrapper around POSIX message queues.
//!
//! All queues run in non-blocking mode; sends use a zero timeout so nothing
//! in the pipeline ever blocks on a slow client.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use bytemuck::{Pod, Zeroable};

use super::ShmError;

/// Queue access mode: world read/write, matching the monitor protocol.
const QUEUE_MODE: libc::mode_t = 0o666;

/// A POSIX message queue opened (and created if missing) by name.
pub struct MessageQueue {
    mqd: libc::mqd_t,
    name: CString,
    unlink_on_drop: bool,
}

// mqd_t is just a descriptor; the queue is fully thread safe on the OS side.
unsafe impl Send for MessageQueue {}

impl MessageQueue {
    /// Opens (creating if missing) the queue `name` for `maxmsg` messages of
    /// `msgsize` bytes, non-blocking.
    pub fn open(name: &str, maxmsg: i64, msgsize: usize) -> Result<MessageQueue, ShmError> {
        let cname = CString::new(name).map_err(|_| ShmError::BadName(name.to_string()))?;
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_flags = libc::O_NONBLOCK as _;
        attr.mq_maxmsg = maxmsg as _;
        attr.mq_msgsize = msgsize as _;
        let mqd = unsafe {
            libc::mq_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_NONBLOCK,
                QUEUE_MODE as libc::c_int,
                &attr as *const libc::mq_attr,
            )
        };
        if mqd == -1 as libc::mqd_t {
            return Err(ShmError::QueueOpen {
                name: name.to_string(),
                errno: std::io::Error::last_os_error(),
            });
        }
        Ok(MessageQueue {
            mqd,
            name: cname,
            unlink_on_drop: false,
        })
    }

    /// Makes this handle unlink the queue name when dropped.
    pub fn unlink_on_drop(mut self) -> MessageQueue {
        self.unlink_on_drop = true;
        self
    }

    /// The raw descriptor, pollable on Linux.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.mqd as RawFd
    }

    /// Number of messages currently queued.
    pub fn pending(&self) -> Result<i64, ShmError> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::mq_getattr(self.mqd, &mut attr) };
        if rc != 0 {
            return Err(ShmError::QueueIo(std::io::Error::last_os_error()));
        }
        Ok(attr.mq_curmsgs as i64)
    }

    /// Sends one message with a zero timeout. A full queue reports
    /// [`ShmError::QueueFull`].
    pub fn send<T: Pod>(&self, message: &T) -> Result<(), ShmError> {
        let bytes = bytemuck::bytes_of(message);
        let tmo = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe {
            libc::mq_timedsend(
                self.mqd,
                bytes.as_ptr().cast(),
                bytes.len(),
                0,
                &tmo,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ETIMEDOUT) => Err(ShmError::QueueFull),
                _ => Err(ShmError::QueueIo(err)),
            };
        }
        Ok(())
    }

    /// Receives one message if one is pending.
    pub fn receive<T: Pod>(&self) -> Result<Option<T>, ShmError> {
        let mut message = T::zeroed();
        let buf = bytemuck::bytes_of_mut(&mut message);
        let mut priority: libc::c_uint = 0;
        let rc = unsafe {
            libc::mq_receive(
                self.mqd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut priority,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => Ok(None),
                _ => Err(ShmError::QueueIo(err)),
            };
        }
        Ok(Some(message))
    }

    /// Drains every pending message.
    pub fn flush<T: Pod>(&self) -> Result<(), ShmError> {
        while self.receive::<T>()?.is_some() {}
        Ok(())
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
            if self.unlink_on_drop {
                libc::mq_unlink(self.name.as_ptr());
            }
        }
    }
}

/// Moves every pending message from `from` to `to`, reclaiming indices that
/// were never picked up.
pub fn move_queue<T: Pod>(from: &MessageQueue, to: &MessageQueue) -> Result<(), ShmError> {
    while let Some(message) = from.receive::<T>()? {
        if let Err(err) = to.send(&message) {
            log::warn!("failed to reclaim buffer: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::Msg;

    fn unique_name(stem: &str) -> String {
        format!("/{stem}_{}", std::process::id())
    }

    #[test]
    fn send_receive_roundtrip() {
        let name = unique_name("cass_test_q");
        let queue = MessageQueue::open(&name, 4, std::mem::size_of::<Msg>())
            .unwrap()
            .unlink_on_drop();
        queue.flush::<Msg>().unwrap();

        assert_eq!(queue.pending().unwrap(), 0);
        queue
            .send(&Msg {
                index: 3,
                n_buffers: 4,
                buf_size: 128,
            })
            .unwrap();
        assert_eq!(queue.pending().unwrap(), 1);

        let got: Msg = queue.receive().unwrap().unwrap();
        assert_eq!(got.index, 3);
        assert_eq!(got.buf_size, 128);
        assert!(queue.receive::<Msg>().unwrap().is_none());
    }

    #[test]
    fn full_queue_reports_queue_full() {
        let name = unique_name("cass_test_full");
        let queue = MessageQueue::open(&name, 1, std::mem::size_of::<Msg>())
            .unwrap()
            .unlink_on_drop();
        queue.flush::<Msg>().unwrap();

        let msg = Msg {
            index: 0,
            n_buffers: 1,
            buf_size: 1,
        };
        queue.send(&msg).unwrap();
        assert!(matches!(queue.send(&msg), Err(ShmError::QueueFull)));
    }
}
