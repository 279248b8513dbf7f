// listener.rs — TCP accept loop
//
// One listener per configured endpoint. A dedicated accept thread parks in
// accept() and pushes sockets onto a shared queue; the tick thread drains
// the queue with slice() and runs the admission hook there, so game code
// never executes off the main thread. Bind failures are reported once and
// swallowed — a shard with one bad endpoint still boots the others.

use std::io;
use std::net::{SocketAddr, TcpListener as StdListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use parking_lot::Mutex;

const BACKLOG_NOTE: &str = "listener";

pub struct Listener {
    address: SocketAddr,
    accepted: Arc<Mutex<Vec<TcpStream>>>,
    _thread: JoinHandle<()>,
}

impl Listener {
    /// Bind and start accepting. Returns None (after one log line) when the
    /// endpoint cannot be bound.
    pub fn bind(address: SocketAddr) -> Option<Listener> {
        let listener = match StdListener::bind(address) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                error!("Listener failed: {} (In Use)", address);
                return None;
            }
            Err(e) if e.kind() == io::ErrorKind::AddrNotAvailable => {
                error!("Listener failed: {} (Unavailable)", address);
                return None;
            }
            Err(e) => {
                error!("Listener failed: {} ({})", address, e);
                return None;
            }
        };

        let address = listener.local_addr().unwrap_or(address);
        info!("Listening: {}", address);

        let accepted: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::clone(&accepted);

        let thread = thread::Builder::new()
            .name(BACKLOG_NOTE.into())
            .spawn(move || {
                loop {
                    match listener.accept() {
                        Ok((socket, _peer)) => {
                            // SO_LINGER stays at the OS default (off), so a
                            // dispose-time close never stalls the sweep.
                            queue.lock().push(socket);
                        }
                        Err(e) => {
                            warn!("listener {}: accept failed: {}", address, e);
                            if e.kind() != io::ErrorKind::ConnectionAborted
                                && e.kind() != io::ErrorKind::Interrupted
                            {
                                break;
                            }
                        }
                    }
                }
            })
            .expect("spawn listener thread");

        Some(Listener {
            address,
            accepted,
            _thread: thread,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Drain every socket accepted since the last slice.
    pub fn slice(&self) -> Vec<TcpStream> {
        std::mem::take(&mut *self.accepted.lock())
    }
}
