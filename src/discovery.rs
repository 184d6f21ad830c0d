//! Card discovery over UDP broadcast.

use crate::card::Card;
use crate::proto::{
    CardInfoFrame, CardType, PacketError, CARD_PORT, DEFAULT_BROADCAST, PROBE_INTERVAL,
    PROBE_PAYLOAD,
};
use crate::transport::UdpTransport;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Hardware address of a card, displayed as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Identity of a discovered card, immutable after parsing.
#[derive(Debug, Clone)]
pub struct CardInfo {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub card_type: CardType,
    /// Firmware version `X.Y.Z`, or `"Unknown"`.
    pub version: String,
    /// Capacity in 512-byte blocks, as reported. The field is 32 bits wide on
    /// the wire and wraps for cards of 2 TiB and larger; treat as advisory.
    pub capacity_blocks: u32,
    pub ap_mode: bool,
    pub subver: String,
}

impl From<CardInfoFrame> for CardInfo {
    fn from(frame: CardInfoFrame) -> Self {
        CardInfo {
            ip: frame.ip,
            mac: MacAddr(frame.mac),
            card_type: frame.card_type,
            version: frame.version,
            capacity_blocks: frame.capacity_blocks,
            ap_mode: frame.ap_mode,
            subver: frame.subver,
        }
    }
}

type CardCallback = Box<dyn Fn(Arc<Card>) + Send + Sync>;

struct Inner {
    transport: Arc<UdpTransport>,
    probe_target: SocketAddr,
    callback: Mutex<Option<CardCallback>>,
    seen: Mutex<HashSet<(Ipv4Addr, MacAddr)>>,
    cards: Mutex<Vec<Arc<Card>>>,
}

struct ProbeTask {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Finds cards by broadcasting probes and collecting their announcements.
///
/// Each `(ip, mac)` pair is emitted at most once per instance.
pub struct Discovery {
    inner: Arc<Inner>,
    probe: Mutex<Option<ProbeTask>>,
}

impl Discovery {
    /// Discovery on the default broadcast address `192.168.0.255`.
    pub fn new(transport: Arc<UdpTransport>) -> Discovery {
        Self::with_broadcast(transport, DEFAULT_BROADCAST)
    }

    /// Discovery probing `broadcast` on the well-known card port.
    pub fn with_broadcast(transport: Arc<UdpTransport>, broadcast: Ipv4Addr) -> Discovery {
        Self::with_probe_target(transport, SocketAddr::from((broadcast, CARD_PORT)))
    }

    /// Discovery probing an arbitrary endpoint. Useful against simulated cards.
    pub fn with_probe_target(transport: Arc<UdpTransport>, probe_target: SocketAddr) -> Discovery {
        let inner = Arc::new(Inner {
            transport: Arc::clone(&transport),
            probe_target,
            callback: Mutex::new(None),
            seen: Mutex::new(HashSet::new()),
            cards: Mutex::new(Vec::new()),
        });

        // The transport keeps broadcast handlers for its whole lifetime, so
        // the subscription must not keep this instance alive in turn.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        transport.subscribe_all(Arc::new(move |bytes, from| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_datagram(bytes, from);
            }
        }));

        Discovery {
            inner,
            probe: Mutex::new(None),
        }
    }

    /// Installs the callback invoked once per newly discovered card.
    ///
    /// Runs on the receive thread; it must not block.
    pub fn on_card(&self, callback: impl Fn(Arc<Card>) + Send + Sync + 'static) {
        *self.inner.callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Starts probing at the default 10 s interval.
    pub fn start(&self) {
        self.start_every(PROBE_INTERVAL);
    }

    /// Starts sending a probe every `interval`.
    pub fn start_every(&self, interval: Duration) {
        let mut probe = self.probe.lock().unwrap();
        if probe.is_some() {
            return;
        }

        let target = self.inner.probe_target;
        let (stop, stopped) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("wifi-sdcf-probe".into())
            .spawn(move || loop {
                if let Err(err) = send_probe(target) {
                    log::warn!("discovery: probe to {target} failed: {err}");
                }
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            })
            .expect("failed to spawn probe thread");

        *probe = Some(ProbeTask { stop, thread });
    }

    /// Cancels the periodic probe.
    pub fn stop(&self) {
        if let Some(task) = self.probe.lock().unwrap().take() {
            let _ = task.stop.send(());
            let _ = task.thread.join();
        }
    }

    /// Cards discovered so far.
    pub fn cards(&self) -> Vec<Arc<Card>> {
        self.inner.cards.lock().unwrap().clone()
    }

    /// Stops probing, destroys every discovered card, clears the callback.
    pub fn destroy(&self) {
        self.stop();
        for card in self.inner.cards.lock().unwrap().drain(..) {
            card.destroy();
        }
        *self.inner.callback.lock().unwrap() = None;
        self.inner.seen.lock().unwrap().clear();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Inner {
    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let frame = match CardInfoFrame::parse(bytes) {
            Ok(frame) => frame,
            // other traffic on the shared socket, not ours to judge
            Err(PacketError::UnexpectedFrame { .. }) => return,
            Err(err) => {
                log::debug!("discovery: dropping datagram from {from}: {err}");
                return;
            }
        };

        let info = CardInfo::from(frame);
        if !self
            .seen
            .lock()
            .unwrap()
            .insert((info.ip, info.mac))
        {
            log::trace!("discovery: {} at {} already known", info.mac, info.ip);
            return;
        }

        log::info!(
            "discovery: {} card {} at {} (version {}, {} blocks)",
            info.card_type,
            info.mac,
            info.ip,
            info.version,
            info.capacity_blocks
        );

        let card = Arc::new(Card::discovered(Arc::clone(&self.transport), info));
        self.cards.lock().unwrap().push(Arc::clone(&card));
        if let Some(callback) = &*self.callback.lock().unwrap() {
            callback(card);
        }
    }
}

/// One probe from a throwaway broadcast-capable socket.
fn send_probe(target: SocketAddr) -> io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;
    socket.send_to(PROBE_PAYLOAD, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_addr_display() {
        let mac = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!("aa:bb:cc:dd:ee:ff", mac.to_string());
    }
}
