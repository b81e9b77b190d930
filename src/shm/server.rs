//! The monitor server.
//!
//! Startup maps `/PdsMonitorSharedMemory_<p>` sized to the event buffers
//! plus eight transition buffers, rounded up to the page size, and opens the
//! queue set of the partition. The free list is prestuffed with the event
//! buffer indices; the transition indices live in a process-local pool.
//!
//! In steady state the input thread calls [`MonitorServer::events`] for each
//! decoded datagram, and a dedicated thread drains the discovery and shuffle
//! queues through [`MonitorServer::routine`].

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};

use log::{error, info, warn};
use memmap2::MmapMut;

use crate::ring::{RingBuffer, Sequence};
use crate::xtc::TransitionId;

use super::queue::{move_queue, MessageQueue};
use super::{
    discovery_queue, from_monitor_ev_queue, shm_name, shuffle_queue, to_monitor_ev_queue,
    to_monitor_tr_queue, Msg, ShmError, ShuffleMsg, NBR_OF_TR_BUFFERS,
};

/// RAII handle on a named shared memory region, unlinked on drop.
struct SharedRegion {
    map: MmapMut,
    name: std::ffi::CString,
}

impl SharedRegion {
    fn create(name: &str, size: usize) -> Result<SharedRegion, ShmError> {
        let cname =
            std::ffi::CString::new(name).map_err(|_| ShmError::BadName(name.to_string()))?;
        let fd: RawFd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o666 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(ShmError::ShmOpen {
                name: name.to_string(),
                errno: std::io::Error::last_os_error(),
            });
        }
        // the File owns the descriptor from here on
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64).map_err(|errno| ShmError::ShmOpen {
            name: name.to_string(),
            errno,
        })?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|errno| ShmError::ShmOpen {
            name: name.to_string(),
            errno,
        })?;
        Ok(SharedRegion { map, name: cname })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::shm_unlink(self.name.as_ptr());
        }
    }
}

/// The live-monitor server of one partition.
pub struct MonitorServer {
    region: SharedRegion,
    buf_size: usize,
    nbr_ev_buffers: usize,
    nbr_clients: usize,

    output_ev: MessageQueue,
    input_ev: MessageQueue,
    discovery: MessageQueue,
    output_tr: Vec<MessageQueue>,
    shuffle: MessageQueue,

    free_tr: VecDeque<i32>,
    cached_tr: Vec<i32>,

    ring: std::sync::Arc<RingBuffer>,
}

impl MonitorServer {
    /// Opens the shared memory region and the queue set of `partition`.
    pub fn new(
        partition: &str,
        nbr_ev_buffers: usize,
        buf_size: usize,
        nbr_clients: usize,
        ring: std::sync::Arc<RingBuffer>,
    ) -> Result<MonitorServer, ShmError> {
        // let world members open these devices
        unsafe {
            libc::umask(0o001);
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mut size = (nbr_ev_buffers + NBR_OF_TR_BUFFERS) * buf_size;
        let remainder = size % page;
        if remainder != 0 {
            size += page - remainder;
        }
        let region = SharedRegion::create(&shm_name(partition), size)?;

        let msg_size = std::mem::size_of::<Msg>();
        let maxmsg = nbr_ev_buffers as i64;

        let output_ev = MessageQueue::open(&to_monitor_ev_queue(partition), maxmsg, msg_size)?
            .unlink_on_drop();
        output_ev.flush::<Msg>()?;
        let input_ev = MessageQueue::open(&from_monitor_ev_queue(partition), maxmsg, msg_size)?
            .unlink_on_drop();
        input_ev.flush::<Msg>()?;
        let discovery =
            MessageQueue::open(&discovery_queue(partition), maxmsg, msg_size)?.unlink_on_drop();
        discovery.flush::<Msg>()?;

        let mut output_tr = Vec::with_capacity(nbr_clients);
        for client in 0..nbr_clients {
            let queue =
                MessageQueue::open(&to_monitor_tr_queue(partition, client), maxmsg, msg_size)?
                    .unlink_on_drop();
            queue.flush::<Msg>()?;
            output_tr.push(queue);
        }

        let shuffle = MessageQueue::open(
            &shuffle_queue(partition),
            maxmsg,
            std::mem::size_of::<ShuffleMsg>(),
        )?
        .unlink_on_drop();
        shuffle.flush::<ShuffleMsg>()?;

        // prestuff the return queue, it doubles as the free list
        for index in 0..nbr_ev_buffers {
            input_ev.send(&Msg {
                index: index as i32,
                n_buffers: (nbr_ev_buffers + NBR_OF_TR_BUFFERS) as i32,
                buf_size: buf_size as u32,
            })?;
        }
        let free_tr = (0..NBR_OF_TR_BUFFERS)
            .map(|i| (nbr_ev_buffers + i) as i32)
            .collect();

        info!(
            "monitor server up on partition '{partition}': {nbr_ev_buffers}+{NBR_OF_TR_BUFFERS} \
             buffers of {buf_size} bytes, {nbr_clients} clients"
        );

        Ok(MonitorServer {
            region,
            buf_size,
            nbr_ev_buffers,
            nbr_clients,
            output_ev,
            input_ev,
            discovery,
            output_tr,
            shuffle,
            free_tr,
            cached_tr: Vec::new(),
            ring,
        })
    }

    fn message(&self, index: i32) -> Msg {
        Msg {
            index,
            n_buffers: (self.nbr_ev_buffers + NBR_OF_TR_BUFFERS) as i32,
            buf_size: self.buf_size as u32,
        }
    }

    fn copy_datagram(&mut self, datagram: &[u8], index: i32) -> Result<(), ShmError> {
        if datagram.len() > self.buf_size {
            return Err(ShmError::DatagramTooLarge {
                size: datagram.len(),
                buf_size: self.buf_size,
            });
        }
        let begin = index as usize * self.buf_size;
        self.region.map[begin..begin + datagram.len()].copy_from_slice(datagram);
        Ok(())
    }

    /// Offers one decoded datagram to the monitor lanes.
    ///
    /// Transitions are copied synchronously into a transition buffer and
    /// announced to every client. An L1-accept is only taken when the free
    /// list is non-empty; it is then handed to the shuffle lane, with the
    /// ring reference `seq` passed along so the copy can happen later.
    /// Returns true when an L1-accept was taken (the caller's retain is now
    /// owned by the server).
    pub fn events(
        &mut self,
        datagram: &[u8],
        service: TransitionId,
        seq: Option<Sequence>,
    ) -> Result<bool, ShmError> {
        if service == TransitionId::L1Accept {
            let seq = match seq {
                Some(seq) => seq,
                None => return Ok(false),
            };
            // probe, never block: back-pressure by dropping
            if self.input_ev.pending()? == 0 {
                return Ok(false);
            }
            let msg: Msg = match self.input_ev.receive()? {
                Some(msg) => msg,
                None => return Ok(false),
            };
            let shuffle_msg = ShuffleMsg {
                index: msg.index,
                reserved: 0,
                seq,
            };
            if self.shuffle.send(&shuffle_msg).is_err() {
                // the index is forfeit until a client returns it
                warn!("ShuffleQ timed out");
                return Ok(false);
            }
            return Ok(true);
        }

        // transition path
        let index = match self.free_tr.pop_front() {
            Some(index) => index,
            None => {
                error!("no buffers available for transition {service:?}");
                return Ok(false);
            }
        };
        self.copy_datagram(datagram, index)?;

        if service.is_closing() {
            // a closing transition retires the transition it closes
            if let Some(opened) = self.cached_tr.pop() {
                self.free_tr.push_back(opened);
            }
            self.free_tr.push_back(index);
        } else {
            self.cached_tr.push(index);
        }

        let msg = self.message(index);
        for queue in &self.output_tr {
            // best effort only
            let _ = queue.send(&msg);
        }

        // reclaim event indices clients never picked up
        move_queue::<Msg>(&self.output_ev, &self.input_ev)?;
        Ok(false)
    }

    /// Raw descriptors of the discovery and shuffle queues, for polling.
    #[must_use]
    pub fn poll_fds(&self) -> [RawFd; 2] {
        [self.discovery.fd(), self.shuffle.fd()]
    }

    /// Drains the discovery and shuffle queues once.
    pub fn routine(&mut self) -> Result<(), ShmError> {
        while let Some(msg) = self.discovery.receive::<Msg>()? {
            self.initialize_client(msg.index);
        }
        while let Some(msg) = self.shuffle.receive::<ShuffleMsg>()? {
            self.output_event(msg);
        }
        Ok(())
    }

    fn initialize_client(&mut self, client: i32) {
        info!("initialize client {client}");
        let client = client as usize;
        if client >= self.nbr_clients {
            warn!("client index {client} out of range");
            return;
        }
        // replay the cached transitions oldest first, preserving their order
        for &index in &self.cached_tr {
            let msg = self.message(index);
            // best effort only
            let _ = self.output_tr[client].send(&msg);
        }
    }

    fn output_event(&mut self, msg: ShuffleMsg) {
        let copied = match self.ring.event_handle(msg.seq) {
            Some(event) => {
                let guard = event.read().expect("event lock poisoned");
                self.copy_datagram(guard.datagram(), msg.index)
            }
            None => {
                warn!("event {} aged out before the shared-memory copy", msg.seq);
                Ok(())
            }
        };
        if let Err(err) = copied {
            error!("shared memory copy failed: {err}");
        } else if self.output_ev.send(&self.message(msg.index)).is_err() {
            warn!("outputEv timed out");
        }
        self.ring.release(msg.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::client::MonitorClient;
    use crate::RING_BUFFER_SIZE;
    use std::sync::Arc;

    fn partition(stem: &str) -> String {
        format!("{stem}_{}", std::process::id())
    }

    #[test]
    fn transition_caching_and_late_join_replay() {
        let ring = Arc::new(RingBuffer::new(RING_BUFFER_SIZE, 256));
        let p = partition("cass_srv_a");
        let mut server = MonitorServer::new(&p, 4, 128, 1, Arc::clone(&ring)).unwrap();

        let config = vec![1u8; 32];
        server.events(&config, TransitionId::Configure, None).unwrap();
        let enable = vec![2u8; 32];
        server.events(&enable, TransitionId::Enable, None).unwrap();
        assert_eq!(server.cached_tr.len(), 2);

        // a closing transition retires the transition it closes
        let disable = vec![3u8; 32];
        server.events(&disable, TransitionId::Disable, None).unwrap();
        assert_eq!(server.cached_tr.len(), 1);

        // late joiner sees the remaining cached transition
        let client = MonitorClient::attach(&p, 4, 128, 0).unwrap();
        server.routine().unwrap();
        let replayed = client.next_transition().unwrap().unwrap();
        assert_eq!(replayed.buf_size, 128);
        assert!(client.next_transition().unwrap().is_none());
    }

    #[test]
    fn l1_takes_a_free_index_and_copies_on_drain() {
        let ring = Arc::new(RingBuffer::new(RING_BUFFER_SIZE, 256));
        let p = partition("cass_srv_b");
        let mut server = MonitorServer::new(&p, 2, 128, 1, Arc::clone(&ring)).unwrap();

        // publish one event carrying a recognizable datagram
        let handle = ring.next_to_fill().unwrap();
        {
            let mut event = handle.event.write().unwrap();
            event.datagram_mut()[..4].copy_from_slice(&[0xca, 0x55, 0x00, 0x01]);
            event.set_datagram_len(4);
        }
        let seq = ring.done_filling(handle, true).unwrap();

        assert!(ring.retain(seq));
        let taken = server.events(&[], TransitionId::L1Accept, Some(seq)).unwrap();
        assert!(taken);

        let client = MonitorClient::attach(&p, 2, 128, 0).unwrap();
        server.routine().unwrap();

        let msg = client.next_event().unwrap().unwrap();
        assert_eq!(&client.buffer(msg.index)[..4], &[0xca, 0x55, 0x00, 0x01]);
        client.return_event(&msg).unwrap();
    }
}
