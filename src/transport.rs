//! UDP transport: one receive socket, per-peer and broadcast dispatch.
//!
//! The transport ships bytes only; it never inspects protocol headers. Every
//! inbound datagram is handed to all broadcast handlers in registration
//! order, then to the per-peer handler matching the source IP, if any.

use crate::proto::HOST_PORT;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Inbound datagram handler.
///
/// Invoked on the receive thread; implementations must not block.
pub type Handler = Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync>;

/// Largest datagram the receive loop accepts.
const RECV_BUFFER_LEN: usize = 65536;
/// How often the receive loop checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct HandlerTable {
    peers: HashMap<Ipv4Addr, Handler>,
    broadcast: Vec<Handler>,
}

/// Process-wide UDP receive socket with subscriber dispatch.
pub struct UdpTransport {
    socket: UdpSocket,
    handlers: Arc<Mutex<HandlerTable>>,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Binds the well-known local port on all interfaces.
    pub fn new() -> io::Result<Arc<Self>> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, HOST_PORT)))
    }

    /// Binds an arbitrary local address and starts the receive thread.
    pub fn bind(addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(SHUTDOWN_POLL))?;

        let handlers = Arc::new(Mutex::new(HandlerTable::default()));
        let running = Arc::new(AtomicBool::new(true));

        let receiver = {
            let socket = socket.try_clone()?;
            let handlers = Arc::clone(&handlers);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("wifi-sdcf-recv".into())
                .spawn(move || receive_loop(&socket, &handlers, &running))?
        };

        Ok(Arc::new(UdpTransport {
            socket,
            handlers,
            running,
            receiver: Mutex::new(Some(receiver)),
        }))
    }

    /// The address the receive socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Installs the handler for datagrams from `ip`, replacing any previous one.
    pub fn subscribe(&self, ip: Ipv4Addr, handler: Handler) {
        self.handlers.lock().unwrap().peers.insert(ip, handler);
    }

    /// Appends a handler that sees every inbound datagram.
    pub fn subscribe_all(&self, handler: Handler) {
        self.handlers.lock().unwrap().broadcast.push(handler);
    }

    pub fn unsubscribe(&self, ip: Ipv4Addr) {
        self.handlers.lock().unwrap().peers.remove(&ip);
    }

    /// Stops the receive thread and clears all handler tables.
    pub fn destroy(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(receiver) = self.receiver.lock().unwrap().take() {
            let _ = receiver.join();
        }
        let mut table = self.handlers.lock().unwrap();
        table.peers.clear();
        table.broadcast.clear();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn receive_loop(socket: &UdpSocket, handlers: &Mutex<HandlerTable>, running: &AtomicBool) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => dispatch(handlers, &buf[..len], from),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                log::error!("transport: receive failed: {err}");
                break;
            }
        }
    }
}

fn dispatch(handlers: &Mutex<HandlerTable>, bytes: &[u8], from: SocketAddr) {
    log::trace!("transport: {} byte datagram from {from}", bytes.len());

    // Handlers run outside the table lock so they may subscribe in turn.
    let (broadcast, peer) = {
        let table = handlers.lock().unwrap();
        let peer = match from.ip() {
            IpAddr::V4(ip) => table.peers.get(&ip).cloned(),
            IpAddr::V6(_) => None,
        };
        (table.broadcast.clone(), peer)
    };

    for handler in &broadcast {
        handler(bytes, from);
    }
    if let Some(handler) = peer {
        handler(bytes, from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn loopback_transport() -> Arc<UdpTransport> {
        UdpTransport::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap()
    }

    #[test]
    fn dispatches_to_broadcast_then_peer() {
        let transport = loopback_transport();
        let (tx, rx) = mpsc::channel();

        let broadcast_tx = tx.clone();
        transport.subscribe_all(Arc::new(move |bytes, _| {
            broadcast_tx.send(("broadcast", bytes.to_vec())).unwrap();
        }));
        transport.subscribe(
            Ipv4Addr::LOCALHOST,
            Arc::new(move |bytes, _| {
                tx.send(("peer", bytes.to_vec())).unwrap();
            }),
        );

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender
            .send_to(b"hello", transport.local_addr().unwrap())
            .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(("broadcast", b"hello".to_vec()), first);
        assert_eq!(("peer", b"hello".to_vec()), second);
    }

    #[test]
    fn replaces_peer_handler_on_resubscribe() {
        let transport = loopback_transport();
        let (tx, rx) = mpsc::channel();

        let first_tx = tx.clone();
        transport.subscribe(
            Ipv4Addr::LOCALHOST,
            Arc::new(move |_, _| first_tx.send("first").unwrap()),
        );
        transport.subscribe(
            Ipv4Addr::LOCALHOST,
            Arc::new(move |_, _| tx.send("second").unwrap()),
        );

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender
            .send_to(b"x", transport.local_addr().unwrap())
            .unwrap();

        assert_eq!("second", rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn unsubscribed_peer_sees_nothing() {
        let transport = loopback_transport();
        let (tx, rx) = mpsc::channel();

        transport.subscribe(
            Ipv4Addr::LOCALHOST,
            Arc::new(move |_, _| tx.send(()).unwrap()),
        );
        transport.unsubscribe(Ipv4Addr::LOCALHOST);

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender
            .send_to(b"x", transport.local_addr().unwrap())
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
