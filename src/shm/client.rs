//! Monitor client side of the shared-memory protocol.
//!
//! A client opens the queue set and the shared memory region of a partition,
//! announces its index on the discovery queue, and then waits on its
//! transition queue and the common event queue. Every event index it
//! receives must be returned on the event return queue once read.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use memmap2::Mmap;

use super::queue::MessageQueue;
use super::{
    discovery_queue, from_monitor_ev_queue, shm_name, to_monitor_ev_queue, to_monitor_tr_queue,
    Msg, ShmError, NBR_OF_TR_BUFFERS,
};

/// A live-monitor client attached to one partition.
pub struct MonitorClient {
    map: Mmap,
    buf_size: usize,
    output_tr: MessageQueue,
    output_ev: MessageQueue,
    input_ev: MessageQueue,
}

impl MonitorClient {
    /// Opens the partition's resources and announces `client_index` on the
    /// discovery queue.
    pub fn attach(
        partition: &str,
        nbr_ev_buffers: usize,
        buf_size: usize,
        client_index: usize,
    ) -> Result<MonitorClient, ShmError> {
        let msg_size = std::mem::size_of::<Msg>();
        let maxmsg = nbr_ev_buffers as i64;

        let output_tr =
            MessageQueue::open(&to_monitor_tr_queue(partition, client_index), maxmsg, msg_size)?;
        // drop transitions sent before we existed; the server replays the
        // cached set once we announce ourselves
        output_tr.flush::<Msg>()?;
        let output_ev = MessageQueue::open(&to_monitor_ev_queue(partition), maxmsg, msg_size)?;
        let input_ev = MessageQueue::open(&from_monitor_ev_queue(partition), maxmsg, msg_size)?;
        let discovery = MessageQueue::open(&discovery_queue(partition), maxmsg, msg_size)?;

        let name = shm_name(partition);
        let cname = CString::new(name.clone()).map_err(|_| ShmError::BadName(name.clone()))?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0o666 as libc::c_uint) };
        if fd < 0 {
            return Err(ShmError::ShmOpen {
                name,
                errno: std::io::Error::last_os_error(),
            });
        }
        let file = unsafe { File::from_raw_fd(fd) };
        let map = unsafe { Mmap::map(&file) }.map_err(|errno| ShmError::ShmOpen { name, errno })?;

        let expected = (nbr_ev_buffers + NBR_OF_TR_BUFFERS) * buf_size;
        if map.len() < expected {
            return Err(ShmError::ShmOpen {
                name: shm_name(partition),
                errno: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("region holds {} bytes, expected at least {expected}", map.len()),
                ),
            });
        }

        discovery.send(&Msg {
            index: client_index as i32,
            n_buffers: (nbr_ev_buffers + NBR_OF_TR_BUFFERS) as i32,
            buf_size: buf_size as u32,
        })?;

        Ok(MonitorClient {
            map,
            buf_size,
            output_tr,
            output_ev,
            input_ev,
        })
    }

    /// The next pending transition announcement, if any.
    pub fn next_transition(&self) -> Result<Option<Msg>, ShmError> {
        self.output_tr.receive()
    }

    /// The next pending event announcement, if any.
    pub fn next_event(&self) -> Result<Option<Msg>, ShmError> {
        self.output_ev.receive()
    }

    /// Returns an event index to the server's free list.
    pub fn return_event(&self, msg: &Msg) -> Result<(), ShmError> {
        self.input_ev.send(msg)
    }

    /// The bytes of shared buffer `index`.
    #[must_use]
    pub fn buffer(&self, index: i32) -> &[u8] {
        let begin = index as usize * self.buf_size;
        &self.map[begin..begin + self.buf_size]
    }
}
