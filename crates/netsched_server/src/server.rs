//! TCP accept loop, connection threads, and the background maintenance
//! threads (execution watcher, purge, service counters).

use crate::directory::QueueDirectory;
use crate::handler::{Action, ConnectionHandler, ServerIdentity};
use crate::notifier;
use anyhow::{Context, Result};
use chrono::Utc;
use netsched_protocol::ServerParams;
use netsched_queue::{Datagram, Journal, NullJournal, QueueContext};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A running server: bound listener, directory, and background threads.
pub struct Server {
    addr: SocketAddr,
    directory: Arc<QueueDirectory>,
    identity: Arc<ServerIdentity>,
    listener: TcpListener,
    params: ServerParams,
    notify_rx: Option<Receiver<Datagram>>,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listener and build the directory. `journal` may be a
    /// `NullJournal` when durability is disabled.
    pub fn bind(params: ServerParams, journal: Arc<dyn Journal>) -> Result<Self> {
        let listener = TcpListener::bind(&params.bind_addr)
            .with_context(|| format!("Failed to bind {}", params.bind_addr))?;
        let addr = listener.local_addr().context("Failed to read bound address")?;
        listener
            .set_nonblocking(true)
            .context("Failed to set listener non-blocking")?;

        let node_id = if params.node_id.is_empty() {
            format!("netsched-{}", addr.port())
        } else {
            params.node_id.clone()
        };
        let ctx = QueueContext {
            node_id: node_id.clone(),
            host: addr.ip().to_string(),
            port: addr.port(),
        };

        let (notify_tx, notify_rx) = mpsc::channel();
        let directory = Arc::new(QueueDirectory::from_config(
            &params, ctx, notify_tx, journal,
        ));
        let identity = Arc::new(ServerIdentity {
            node_id,
            session_id: Uuid::new_v4().simple().to_string(),
            started: Utc::now(),
        });

        info!(addr = %addr, node = %identity.node_id, "NetSched server bound");
        Ok(Self {
            addr,
            directory,
            identity,
            listener,
            params,
            notify_rx: Some(notify_rx),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind with durability disabled.
    pub fn bind_detached(params: ServerParams) -> Result<Self> {
        Self::bind(params, Arc::new(NullJournal))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn directory(&self) -> Arc<QueueDirectory> {
        Arc::clone(&self.directory)
    }

    /// Handle that flips the stop flag from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run until the stop flag is set. Spawns the notifier, watcher, purge,
    /// and service threads, then accepts connections.
    pub fn run(mut self) -> Result<()> {
        let notify_rx = self
            .notify_rx
            .take()
            .expect("run may only be called once");
        let notifier_handle =
            notifier::spawn_notifier(notify_rx).context("Failed to spawn notifier")?;

        let background = self.spawn_background_threads();
        let live_connections = Arc::new(AtomicUsize::new(0));

        info!("NetSched server accepting connections");
        while !self.stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if live_connections.load(Ordering::Relaxed) >= self.params.max_connections {
                        warn!(peer = %peer, "Connection limit reached; rejecting");
                        drop(stream);
                        continue;
                    }
                    live_connections.fetch_add(1, Ordering::Relaxed);
                    let directory = Arc::clone(&self.directory);
                    let identity = Arc::clone(&self.identity);
                    let counter = Arc::clone(&live_connections);
                    let builder = thread::Builder::new().name(format!("ns-conn-{}", peer));
                    let spawned = builder.spawn(move || {
                        if let Err(e) = serve_connection(stream, peer, directory, identity) {
                            debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                        counter.fetch_sub(1, Ordering::Relaxed);
                    });
                    if let Err(e) = spawned {
                        error!(error = %e, "Failed to spawn connection thread");
                        live_connections.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("NetSched server stopping");
        for handle in background {
            let _ = handle.join();
        }
        // The notifier exits once the directory (and its senders) drop.
        drop(self.directory);
        let _ = notifier_handle.join();
        info!("NetSched server stopped");
        Ok(())
    }

    fn spawn_background_threads(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Execution watcher: pops the timeline on every queue.
        {
            let directory = Arc::clone(&self.directory);
            let stop = Arc::clone(&self.stop);
            let interval = Duration::from_millis(self.params.watch_interval_ms.max(10));
            handles.push(
                thread::Builder::new()
                    .name("ns-watcher".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            let now = Utc::now();
                            for queue in directory.all_queues() {
                                let applied = queue.check_timeline(now);
                                if applied > 0 {
                                    debug!(queue = queue.name(), applied, "Watcher tick");
                                }
                            }
                            thread::sleep(interval);
                        }
                    })
                    .expect("spawn watcher thread"),
            );
        }

        // Purge: expired terminal jobs, registry GC, directory maintenance.
        {
            let directory = Arc::clone(&self.directory);
            let stop = Arc::clone(&self.stop);
            let interval = Duration::from_millis(self.params.purge_interval_ms.max(100));
            handles.push(
                thread::Builder::new()
                    .name("ns-purge".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            let now = Utc::now();
                            for queue in directory.all_queues() {
                                let stats =
                                    queue.purge(now, netsched_protocol::defaults::DEFAULT_PURGE_BATCH);
                                if stats.removed > 0 || stats.marked_deleted > 0 {
                                    debug!(
                                        queue = queue.name(),
                                        marked = stats.marked_deleted,
                                        removed = stats.removed,
                                        "Purge pass"
                                    );
                                }
                            }
                            directory.maintain(now);
                            thread::sleep(interval);
                        }
                    })
                    .expect("spawn purge thread"),
            );
        }

        // Service: periodic counter snapshots.
        {
            let directory = Arc::clone(&self.directory);
            let stop = Arc::clone(&self.stop);
            let interval = Duration::from_millis(self.params.service_interval_ms.max(1000));
            handles.push(
                thread::Builder::new()
                    .name("ns-service".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            for queue in directory.all_queues() {
                                let counters = queue.counter_snapshot();
                                info!(
                                    queue = queue.name(),
                                    submitted = counters.submitted,
                                    dispatched = counters.dispatched,
                                    completed = counters.completed,
                                    failed = counters.failed,
                                    timed_out = counters.timed_out,
                                    canceled = counters.canceled,
                                    reads = counters.reads_dispatched,
                                    confirmed = counters.reads_confirmed,
                                    notifications = counters.notifications,
                                    "Queue counters"
                                );
                            }
                            thread::sleep(interval);
                        }
                    })
                    .expect("spawn service thread"),
            );
        }

        handles
    }
}

/// Serve one connection: handshake, then serialized request/response.
fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    directory: Arc<QueueDirectory>,
    identity: Arc<ServerIdentity>,
) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode on some
    // platforms; connection threads use blocking reads with a timeout.
    stream
        .set_nonblocking(false)
        .context("set blocking mode")?;
    stream
        .set_read_timeout(Some(Duration::from_secs(3600)))
        .context("set read timeout")?;
    let mut reader = BufReader::new(stream.try_clone().context("clone stream")?);
    let mut writer = stream;

    let auth_line = read_trimmed_line(&mut reader)?;
    let queue_line = read_trimmed_line(&mut reader)?;

    let mut handler = match ConnectionHandler::handshake(
        directory,
        identity,
        &peer.ip().to_string(),
        &auth_line,
        &queue_line,
    ) {
        Ok(handler) => handler,
        Err(err_line) => {
            write_line(&mut writer, &err_line)?;
            return Ok(());
        }
    };

    loop {
        let line = match read_trimmed_line(&mut reader) {
            Ok(line) => line,
            Err(_) => break, // peer closed or timed out
        };
        if line.is_empty() {
            continue;
        }
        match handler.handle_line(&line) {
            Action::Respond(response) => write_line(&mut writer, &response)?,
            Action::Continue => {}
            Action::RespondAndClose(response) => {
                write_line(&mut writer, &response)?;
                break;
            }
            Action::Close => break,
        }
    }

    debug!(peer = %peer, queue = handler.queue_name(), "Connection closed");
    Ok(())
}

fn read_trimmed_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    let read = reader.read_line(&mut line).context("read line")?;
    if read == 0 {
        anyhow::bail!("connection closed");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn write_line(writer: &mut TcpStream, line: &str) -> Result<()> {
    writer
        .write_all(line.as_bytes())
        .and_then(|_| writer.write_all(b"\n"))
        .context("write response")
}
