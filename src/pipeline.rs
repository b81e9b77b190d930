//! Thread wiring from the input source to shutdown.
//!
//! One input loop decodes datagrams into ring slots and offers them to the
//! live monitor, a pool of symmetric workers runs the processor graph, one
//! thread drains the monitor queues and one serves the control surface.
//! Everything is owned by a context built here and passed down; nothing is
//! process-global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam_channel::unbounded;
use log::{error, info, warn};
use thiserror::Error;

use crate::control::{Command, ControlServer, Counters, GraphHandle};
use crate::conversion::{register_all, CassIdMap, ConverterRegistry};
use crate::conversion::store::ConfigStore;
use crate::event::CassEvent;
use crate::input::{InputError, InputSource, InputState};
use crate::processing::{GraphContext, ProcessorError, ProcessorGraph};
use crate::ring::RingBuffer;
use crate::settings::Settings;
use crate::shm::server::MonitorServer;
use crate::shm::ShmError;
use crate::xtc::{walker, Datagram, TransitionId};
use crate::{MAX_DATAGRAM_SIZE, NBR_OF_WORKERS, RING_BUFFER_SIZE};

/// Fatal pipeline errors; they abort startup or the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The processor graph failed to load.
    #[error("processor graph: {0}")]
    Processor(#[from] ProcessorError),

    /// The shared-memory server failed to start.
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),

    /// The control surface failed to start.
    #[error("control surface: {0}")]
    Control(std::io::Error),

    /// The input source failed fatally.
    #[error("input: {0}")]
    Input(#[from] InputError),
}

/// Run-time options of one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Partition tag of the live monitor; `None` disables the monitor.
    pub partition: Option<String>,
    /// Number of shared event buffers.
    pub nbr_shm_buffers: usize,
    /// Size of one shared buffer in bytes.
    pub shm_buffer_size: usize,
    /// Number of monitor clients served.
    pub nbr_clients: usize,
    /// Number of analysis workers.
    pub workers: usize,
    /// Bind address of the control surface; `None` disables it.
    pub control_addr: Option<String>,
}

impl PipelineOptions {
    /// Options from the `SharedMemory` settings group with defaults.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> PipelineOptions {
        let shm = settings.group("SharedMemory");
        let partition = if shm.value_bool("Enabled", false) {
            Some(shm.value_str("PartitionTag", "0_1_cass"))
        } else {
            None
        };
        PipelineOptions {
            partition,
            nbr_shm_buffers: shm.value_usize("NbrOfBuffers", 4),
            shm_buffer_size: shm.value_usize("SizeOfBuffer", MAX_DATAGRAM_SIZE),
            nbr_clients: shm.value_usize("NbrOfClients", 2),
            workers: NBR_OF_WORKERS,
            control_addr: None,
        }
    }
}

/// Runs the pipeline to completion: until the source is exhausted, a quit
/// processor fires, or a quit command arrives.
pub fn run(
    settings: Settings,
    mut source: Box<dyn InputSource>,
    options: &PipelineOptions,
) -> Result<(), PipelineError> {
    let ctx = GraphContext::new();
    let store = Arc::new(ConfigStore::new());
    let ids = Arc::new(CassIdMap::from_settings(&settings.group("Converter")));
    let registry: Arc<ConverterRegistry> =
        Arc::new(register_all(&settings, &store, &ids));

    let graph = ProcessorGraph::load(&settings, &ctx, options.workers)?;
    let graph_handle: GraphHandle = Arc::new(RwLock::new(Arc::new(graph)));

    let ring = Arc::new(RingBuffer::new(RING_BUFFER_SIZE, MAX_DATAGRAM_SIZE));
    let counters = Arc::new(Counters::new());
    let hard_stop = Arc::new(AtomicBool::new(false));

    let (command_tx, command_rx) = unbounded::<Command>();
    let control = match &options.control_addr {
        Some(addr) => Some(
            ControlServer::spawn(
                addr,
                Arc::clone(&graph_handle),
                command_tx.clone(),
                Arc::clone(&counters),
            )
            .map_err(PipelineError::Control)?,
        ),
        None => None,
    };

    // live monitor server and its drain thread
    let monitor = match &options.partition {
        Some(partition) => Some(Arc::new(Mutex::new(MonitorServer::new(
            partition,
            options.nbr_shm_buffers,
            options.shm_buffer_size,
            options.nbr_clients,
            Arc::clone(&ring),
        )?))),
        None => None,
    };
    let monitor_stop = Arc::new(AtomicBool::new(false));
    let monitor_thread = monitor.as_ref().map(|server| {
        let server = Arc::clone(server);
        let stop = Arc::clone(&monitor_stop);
        std::thread::Builder::new()
            .name("shm-server".to_string())
            .spawn(move || {
                let fds = server.lock().expect("monitor poisoned").poll_fds();
                while !stop.load(Ordering::Relaxed) {
                    let mut pfds = [
                        libc::pollfd {
                            fd: fds[0],
                            events: libc::POLLIN,
                            revents: 0,
                        },
                        libc::pollfd {
                            fd: fds[1],
                            events: libc::POLLIN,
                            revents: 0,
                        },
                    ];
                    let ready = unsafe { libc::poll(pfds.as_mut_ptr(), 2, 10) };
                    if ready > 0 {
                        let mut server = server.lock().expect("monitor poisoned");
                        if let Err(err) = server.routine() {
                            warn!("monitor drain failed: {err}");
                        }
                    }
                }
            })
            .expect("cannot spawn the monitor thread")
    });

    // symmetric analysis workers
    let workers: Vec<_> = (0..options.workers)
        .map(|index| {
            let ring = Arc::clone(&ring);
            let graph_handle = Arc::clone(&graph_handle);
            let hard_stop = Arc::clone(&hard_stop);
            let counters = Arc::clone(&counters);
            std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    while let Some(handle) = ring.next_to_process() {
                        let graph =
                            Arc::clone(&graph_handle.read().expect("graph lock poisoned"));
                        let id = {
                            let event = handle.event.read().expect("event lock poisoned");
                            let errors = graph.process_event(&event, &hard_stop);
                            counters
                                .processor_errors
                                .fetch_add(errors as u64, Ordering::Relaxed);
                            event.id()
                        };
                        graph.release_event(id);
                        ring.done_processing(handle);
                    }
                })
                .expect("cannot spawn a worker thread")
        })
        .collect();

    // input loop on this thread
    let result = input_loop(
        &settings,
        source.as_mut(),
        &registry,
        &ring,
        monitor.as_deref(),
        &ctx,
        &counters,
        &command_rx,
        &graph_handle,
        options,
    );

    // drain and tear down
    ring.shutdown();
    for worker in workers {
        let _ = worker.join();
    }
    graph_handle
        .read()
        .expect("graph lock poisoned")
        .about_to_quit();

    monitor_stop.store(true, Ordering::Relaxed);
    if let Some(thread) = monitor_thread {
        let _ = thread.join();
    }
    if let Some(control) = control {
        control.stop();
    }
    info!(
        "pipeline finished: {} events accepted, {} dropped",
        counters.events_accepted.load(Ordering::Relaxed),
        counters.events_dropped.load(Ordering::Relaxed)
    );
    result
}

#[allow(clippy::too_many_arguments)]
fn input_loop(
    settings: &Settings,
    source: &mut dyn InputSource,
    registry: &ConverterRegistry,
    ring: &RingBuffer,
    monitor: Option<&Mutex<MonitorServer>>,
    ctx: &GraphContext,
    counters: &Counters,
    commands: &crossbeam_channel::Receiver<Command>,
    graph_handle: &GraphHandle,
    options: &PipelineOptions,
) -> Result<(), PipelineError> {
    let mut paused = false;
    loop {
        // control commands between events
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Pause => paused = true,
                Command::Resume => paused = false,
                Command::Quit => return Ok(()),
                Command::Clear(name) | Command::Retrain(name) => {
                    let graph = graph_handle.read().expect("graph lock poisoned");
                    if !graph.clear(&name) {
                        warn!("clear: unknown processor '{name}'");
                    }
                }
                Command::ReloadSettings => {
                    match ProcessorGraph::load(settings, ctx, options.workers) {
                        Ok(graph) => {
                            *graph_handle.write().expect("graph lock poisoned") =
                                Arc::new(graph);
                            info!("processor graph reloaded");
                        }
                        Err(err) => error!("reload failed, keeping the old graph: {err}"),
                    }
                }
            }
        }
        if ctx.quit.load(Ordering::SeqCst) {
            info!("quit processor fired, stopping the input");
            return Ok(());
        }
        if paused {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }

        let handle = match ring.next_to_fill() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let event_arc = Arc::clone(&handle.event);

        // fill and decode under the slot's write lock
        let decoded = {
            let mut event = event_arc.write().expect("event lock poisoned");
            event.reset();
            match source.next(event.datagram_mut()) {
                Ok(InputState::Datagram(len)) => {
                    event.set_datagram_len(len);
                    event.set_filename(source.filename().map(String::from));
                    decode_event(&mut event, registry, counters)
                }
                Ok(InputState::Outdated) => {
                    info!("requested shot aged out, continuing with the next");
                    Decoded::Rejected
                }
                Ok(InputState::EndOfStream) => Decoded::EndOfStream,
                Err(err @ InputError::DatagramTooLarge { .. }) => {
                    error!("{err}");
                    counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                    Decoded::Rejected
                }
                Err(err) => Decoded::Fatal(err),
            }
        };

        match decoded {
            Decoded::Fatal(err) => {
                ring.done_filling(handle, false);
                return Err(err.into());
            }
            Decoded::EndOfStream => {
                ring.done_filling(handle, false);
                return Ok(());
            }
            Decoded::Rejected => {
                ring.done_filling(handle, false);
            }
            Decoded::Transition(service) => {
                if let Some(server) = monitor {
                    let event = event_arc.read().expect("event lock poisoned");
                    let mut server = server.lock().expect("monitor poisoned");
                    if let Err(err) = server.events(event.datagram(), service, None) {
                        warn!("monitor transition hand-off failed: {err}");
                    }
                }
                ring.done_filling(handle, false);
            }
            Decoded::Accepted => {
                let seq = ring
                    .done_filling(handle, true)
                    .expect("accepted events are published");
                counters.events_accepted.fetch_add(1, Ordering::Relaxed);
                if let Some(server) = monitor {
                    ring.retain(seq);
                    let taken = {
                        let mut server = server.lock().expect("monitor poisoned");
                        server.events(&[], TransitionId::L1Accept, Some(seq))
                    };
                    match taken {
                        Ok(true) => {}
                        Ok(false) => {
                            counters.monitor_dropped.fetch_add(1, Ordering::Relaxed);
                            ring.release(seq);
                        }
                        Err(err) => {
                            warn!("monitor event hand-off failed: {err}");
                            ring.release(seq);
                        }
                    }
                }
            }
        }
    }
}

enum Decoded {
    Accepted,
    Transition(TransitionId),
    Rejected,
    EndOfStream,
    Fatal(InputError),
}

fn decode_event(
    event: &mut CassEvent,
    registry: &ConverterRegistry,
    counters: &Counters,
) -> Decoded {
    let datagram_bytes = event.datagram().to_vec();
    let datagram = match Datagram::parse(&datagram_bytes) {
        Ok(datagram) => datagram,
        Err(err) => {
            error!("bad datagram: {err}");
            counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            return Decoded::Rejected;
        }
    };
    event.set_id(datagram.event_id());

    if walker::walk(&datagram.root, registry, event) == walker::WalkResult::Stop {
        counters.events_dropped.fetch_add(1, Ordering::Relaxed);
        return Decoded::Rejected;
    }
    if datagram.is_l1_accept() {
        Decoded::Accepted
    } else {
        Decoded::Transition(datagram.service)
    }
}
