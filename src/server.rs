//! TCP connection model for the line-oriented wire protocol.
//!
//! One dedicated acceptor thread polls a non-blocking [`TcpListener`] and
//! hands each accepted connection to a bounded pool of long-lived
//! connection-handler threads over an [`mpsc`] channel, so a slow client
//! cannot starve acceptance.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::manager::SetManager;
use crate::protocol;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running server: the acceptor thread plus its fixed pool of connection
/// handlers. Dropping or calling [`ServerHandle::join`] after
/// [`SetManager::stop`] waits for every thread to finish its current
/// connection and exit.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
    handlers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The address actually bound (useful when `tcp_port` was `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the acceptor and every handler thread to exit. Call only
    /// after [`SetManager::stop`], otherwise this blocks forever.
    pub fn join(mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        for handler in self.handlers.drain(..) {
            let _ = handler.join();
        }
    }
}

/// Binds `bind_address:tcp_port` and spawns the acceptor plus `workers`
/// connection-handler threads. Returns once the listener is bound;
/// connections are served on the spawned threads.
pub fn run(manager: Arc<SetManager>, bind_address: &str, tcp_port: u16, workers: usize) -> io::Result<ServerHandle> {
    let addr = format!("{bind_address}:{tcp_port}");
    let listener = TcpListener::bind(&addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    info!("listening on {local_addr} with {workers} worker thread(s)");

    let (tx, rx) = mpsc::sync_channel::<TcpStream>(workers.max(1) * 4);
    let rx = Arc::new(std::sync::Mutex::new(rx));
    let next_client_id = Arc::new(AtomicU64::new(1));

    let mut handlers = Vec::with_capacity(workers);
    for idx in 0..workers.max(1) {
        let manager = manager.clone();
        let rx = rx.clone();
        let next_client_id = next_client_id.clone();
        let handle = thread::Builder::new()
            .name(format!("hlld-worker-{idx}"))
            .spawn(move || worker_loop(manager, rx, next_client_id))
            .expect("failed to spawn connection worker thread");
        handlers.push(handle);
    }

    let acceptor_manager = manager.clone();
    let acceptor = thread::Builder::new()
        .name("hlld-acceptor".to_string())
        .spawn(move || accept_loop(acceptor_manager, listener, tx))
        .expect("failed to spawn acceptor thread");

    Ok(ServerHandle {
        local_addr,
        acceptor: Some(acceptor),
        handlers,
    })
}

fn accept_loop(manager: Arc<SetManager>, listener: TcpListener, tx: mpsc::SyncSender<TcpStream>) {
    while manager.should_run() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {peer}");
                if tx.send(stream).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                warn!("accept failed: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    // Dropping `tx` here closes the channel, which lets idle workers exit
    // their `recv` loop once they've drained anything already queued.
}

fn worker_loop(
    manager: Arc<SetManager>,
    rx: Arc<std::sync::Mutex<mpsc::Receiver<TcpStream>>>,
    next_client_id: Arc<AtomicU64>,
) {
    loop {
        let stream = {
            let rx = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rx.recv()
        };
        let Ok(stream) = stream else {
            break;
        };
        let client_id = next_client_id.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = handle_connection(&manager, stream, client_id) {
            debug!("connection {client_id} closed: {err}");
        }
        manager.leave(client_id);
    }
}

fn handle_connection(manager: &SetManager, stream: TcpStream, client_id: u64) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        manager.checkpoint(client_id);
        let reply = protocol::handle_line(manager, &line);
        if let Err(err) = writer.write_all(reply.as_bytes()) {
            error!("failed to write reply to {peer:?}: {err}");
            return Err(err);
        }
    }
    Ok(())
}
