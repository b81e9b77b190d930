//! Line-oriented control surface.
//!
//! A small TCP listener accepts one command per line and answers with one
//! line (or a JSON document for `get`). Commands are idempotent; unknown
//! input yields an error line and keeps the connection open.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{info, warn};

use crate::processing::ProcessorGraph;

/// Commands understood by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop pulling events from the source.
    Pause,
    /// Resume pulling events.
    Resume,
    /// Re-read the settings and rebuild the processor graph.
    ReloadSettings,
    /// Zero the named node's cached results and start accumulating afresh.
    Retrain(
        /// Node name.
        String,
    ),
    /// Zero the named node's cached results.
    Clear(
        /// Node name.
        String,
    ),
    /// Terminate the input loop and drain.
    Quit,
}

/// Per-component error and progress counters, exposed on the control
/// surface.
#[derive(Debug, Default)]
pub struct Counters {
    /// Events decoded and queued.
    pub events_accepted: AtomicU64,
    /// Events dropped by decode damage.
    pub events_dropped: AtomicU64,
    /// Events the live server could not take (back pressure).
    pub monitor_dropped: AtomicU64,
    /// Per-event processor errors.
    pub processor_errors: AtomicU64,
}

impl Counters {
    /// A zeroed counter set.
    #[must_use]
    pub fn new() -> Counters {
        Counters::default()
    }
}

/// Shared, swappable handle on the loaded graph.
pub type GraphHandle = Arc<RwLock<Arc<ProcessorGraph>>>;

/// The running control listener.
pub struct ControlServer {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    local_addr: std::net::SocketAddr,
}

impl ControlServer {
    /// Binds `addr` and serves until stopped.
    pub fn spawn(
        addr: &str,
        graph: GraphHandle,
        commands: Sender<Command>,
        counters: Arc<Counters>,
    ) -> std::io::Result<ControlServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("control surface listening on {local_addr}");

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            info!("control client {peer} connected");
                            if let Err(err) =
                                serve_client(stream, &graph, &commands, &counters, &stop_flag)
                            {
                                warn!("control client {peer}: {err}");
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(err) => {
                            warn!("control accept failed: {err}");
                            std::thread::sleep(Duration::from_millis(250));
                        }
                    }
                }
            })?;

        Ok(ControlServer {
            handle: Some(handle),
            stop,
            local_addr,
        })
    }

    /// The bound address, useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stops the listener thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_client(
    stream: TcpStream,
    graph: &GraphHandle,
    commands: &Sender<Command>,
    counters: &Counters,
    stop: &AtomicBool,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(250)))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                let reply = handle_line(line.trim(), graph, commands, counters);
                writer.write_all(reply.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

fn handle_line(
    line: &str,
    graph: &GraphHandle,
    commands: &Sender<Command>,
    counters: &Counters,
) -> String {
    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let argument = parts.next().unwrap_or("").trim();

    let send = |command: Command| -> String {
        match commands.send(command) {
            Ok(()) => "ok".to_string(),
            Err(_) => "error: pipeline is gone".to_string(),
        }
    };

    match verb {
        "pause" => send(Command::Pause),
        "resume" => send(Command::Resume),
        "reload-settings" => send(Command::ReloadSettings),
        "quit" => send(Command::Quit),
        "retrain" if !argument.is_empty() => send(Command::Retrain(argument.to_string())),
        "clear" if !argument.is_empty() => send(Command::Clear(argument.to_string())),
        "list" => {
            let graph = graph.read().expect("graph lock poisoned");
            graph.names().join(" ")
        }
        "counters" => format!(
            "accepted={} dropped={} monitor_dropped={} processor_errors={}",
            counters.events_accepted.load(Ordering::Relaxed),
            counters.events_dropped.load(Ordering::Relaxed),
            counters.monitor_dropped.load(Ordering::Relaxed),
            counters.processor_errors.load(Ordering::Relaxed),
        ),
        "get" if !argument.is_empty() => {
            let graph = graph.read().expect("graph lock poisoned");
            match graph.find(argument) {
                Some(node) => {
                    let result = node.latest();
                    let result = result.read().expect("result lock poisoned");
                    serde_json::to_string(&*result)
                        .unwrap_or_else(|err| format!("error: {err}"))
                }
                None => format!("error: unknown processor '{argument}'"),
            }
        }
        _ => format!("error: unknown command '{line}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::GraphContext;
    use crate::settings::Settings;
    use crossbeam_channel::unbounded;

    fn test_graph() -> GraphHandle {
        let settings = Settings::from_str(
            r#"
[PostProcessor.answer]
Kind = "constant"
Value = 42.0
Hide = false
"#,
        )
        .unwrap();
        let graph = ProcessorGraph::load(&settings, &GraphContext::new(), 1).unwrap();
        Arc::new(RwLock::new(Arc::new(graph)))
    }

    #[test]
    fn commands_are_forwarded() {
        let (tx, rx) = unbounded();
        let reply = handle_line("pause", &test_graph(), &tx, &Counters::new());
        assert_eq!(reply, "ok");
        assert_eq!(rx.recv().unwrap(), Command::Pause);

        let reply = handle_line("clear answer", &test_graph(), &tx, &Counters::new());
        assert_eq!(reply, "ok");
        assert_eq!(rx.recv().unwrap(), Command::Clear("answer".to_string()));
    }

    #[test]
    fn get_returns_json_of_the_latest_result() {
        let (tx, _rx) = unbounded();
        let graph = test_graph();
        // run one event through so the constant has a value
        {
            let g = graph.read().unwrap();
            let mut event = crate::event::CassEvent::allocate(16);
            event.set_id(1);
            g.process_event(&event, &AtomicBool::new(false));
        }
        let reply = handle_line("get answer", &graph, &tx, &Counters::new());
        assert!(reply.contains("42"), "reply was {reply}");
    }

    #[test]
    fn unknown_input_is_reported() {
        let (tx, _rx) = unbounded();
        let reply = handle_line("frobnicate", &test_graph(), &tx, &Counters::new());
        assert!(reply.starts_with("error:"));
    }

    #[test]
    fn roundtrip_over_the_socket() {
        let (tx, rx) = unbounded();
        let server = ControlServer::spawn(
            "127.0.0.1:0",
            test_graph(),
            tx,
            Arc::new(Counters::new()),
        )
        .unwrap();
        let addr = server.local_addr();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"quit\n").unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), "ok");
        assert_eq!(rx.recv().unwrap(), Command::Quit);

        drop(stream);
        server.stop();
    }
}
