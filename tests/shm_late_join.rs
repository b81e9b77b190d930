//! Late-joining monitor clients replay the cached transitions, and lent
//! event indices return to the free list.

use std::sync::Arc;

use cass::ring::RingBuffer;
use cass::shm::client::MonitorClient;
use cass::shm::server::MonitorServer;
use cass::xtc::TransitionId;

const NBR_EV_BUFFERS: usize = 4;
const BUF_SIZE: usize = 256;

fn partition(stem: &str) -> String {
    format!("{stem}_{}", std::process::id())
}

/// Publishes one recognizable event and offers it to the monitor; drains
/// the server afterwards so the copy happens.
fn push_shot(ring: &Arc<RingBuffer>, server: &mut MonitorServer, tag: u8) -> bool {
    let handle = ring.next_to_fill().unwrap();
    {
        let mut event = handle.event.write().unwrap();
        event.reset();
        event.datagram_mut()[..2].copy_from_slice(&[0xa1, tag]);
        event.set_datagram_len(2);
    }
    let seq = ring.done_filling(handle, true).unwrap();

    ring.retain(seq);
    let taken = server
        .events(&[], TransitionId::L1Accept, Some(seq))
        .unwrap();
    if !taken {
        ring.release(seq);
    }

    // a worker claims and finishes the event
    let claimed = ring.next_to_process().unwrap();
    ring.done_processing(claimed);

    server.routine().unwrap();
    taken
}

#[test]
fn late_joiner_sees_cached_transitions_before_any_event() {
    let ring = Arc::new(RingBuffer::new(8, BUF_SIZE));
    let p = partition("cass_latejoin");
    let mut server =
        MonitorServer::new(&p, NBR_EV_BUFFERS, BUF_SIZE, 1, Arc::clone(&ring)).unwrap();

    // two configure-like transitions with distinct payloads
    server
        .events(&[0xc0, 0x01], TransitionId::Configure, None)
        .unwrap();
    server
        .events(&[0xc0, 0x02], TransitionId::Enable, None)
        .unwrap();

    // ten shots; only as many as there are free buffers are taken
    let mut taken = 0;
    for tag in 0..10u8 {
        if push_shot(&ring, &mut server, tag) {
            taken += 1;
        }
    }
    assert_eq!(taken, NBR_EV_BUFFERS, "back pressure drops the rest");

    // the client attaches only now
    let client = MonitorClient::attach(&p, NBR_EV_BUFFERS, BUF_SIZE, 0).unwrap();
    server.routine().unwrap();

    // both transitions arrive on the transition lane, oldest first
    let tr1 = client.next_transition().unwrap().expect("first transition");
    assert_eq!(&client.buffer(tr1.index)[..2], &[0xc0, 0x01]);
    let tr2 = client.next_transition().unwrap().expect("second transition");
    assert_eq!(&client.buffer(tr2.index)[..2], &[0xc0, 0x02]);
    assert!(client.next_transition().unwrap().is_none());

    // the events wait on their own lane; returning them refills the free
    // list so the server can lend the indices again
    let mut events = 0;
    while let Some(msg) = client.next_event().unwrap() {
        assert_eq!(client.buffer(msg.index)[0], 0xa1);
        client.return_event(&msg).unwrap();
        events += 1;
    }
    assert_eq!(events, NBR_EV_BUFFERS);

    assert!(
        push_shot(&ring, &mut server, 42),
        "returned indices are available for reuse"
    );
}
