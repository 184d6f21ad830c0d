//! Connected card handle and the block-read protocol.

use crate::discovery::CardInfo;
use crate::error::{Error, Result};
use crate::fat32::Fat32Volume;
use crate::mbr;
use crate::proto::{
    PacketError, ReadRequest, ReadResponse, CARD_PORT, DEFAULT_PASSWORD, DEFAULT_USERNAME,
    INITIAL_TRANSFER_ID, MAX_TRANSFER_BLOCKS, READ_TIMEOUT,
};
use crate::transport::UdpTransport;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Random access to 512-byte blocks.
///
/// [`Card`] is the live implementation; tests and tools may serve blocks out
/// of an in-memory image instead.
pub trait BlockRead {
    /// Reads `count` blocks starting at `lba`, concatenated.
    fn read_blocks(&self, lba: u32, count: u16) -> Result<Vec<u8>>;
}

impl<T: BlockRead + ?Sized> BlockRead for &T {
    fn read_blocks(&self, lba: u32, count: u16) -> Result<Vec<u8>> {
        (**self).read_blocks(lba, count)
    }
}

impl<T: BlockRead + ?Sized> BlockRead for Arc<T> {
    fn read_blocks(&self, lba: u32, count: u16) -> Result<Vec<u8>> {
        (**self).read_blocks(lba, count)
    }
}

/// One-shot completion slots keyed by transfer ID.
type PendingMap = HashMap<u32, SyncSender<Vec<u8>>>;

/// A connected handle to one card.
///
/// Issues command-4 block reads and correlates the responses arriving on the
/// shared [`UdpTransport`] by transfer ID. Responses may arrive in any order;
/// the number of outstanding reads is not bounded here, callers serialize.
pub struct Card {
    transport: Arc<UdpTransport>,
    /// Control endpoint the card listens on.
    addr: SocketAddr,
    info: Option<CardInfo>,
    username: String,
    password: String,
    read_timeout: Duration,
    transfer_id: AtomicU32,
    pending: Arc<Mutex<PendingMap>>,
    destroyed: AtomicBool,
}

impl Card {
    /// Connects to a card at `ip` on the well-known card port.
    pub fn connect(transport: Arc<UdpTransport>, ip: Ipv4Addr) -> Card {
        Self::connect_addr(transport, SocketAddr::from((ip, CARD_PORT)))
    }

    /// Connects to an arbitrary endpoint. Useful against simulated cards.
    pub fn connect_addr(transport: Arc<UdpTransport>, addr: SocketAddr) -> Card {
        let pending: Arc<Mutex<PendingMap>> = Arc::default();

        let dispatch = Arc::clone(&pending);
        if let IpAddr::V4(ip) = addr.ip() {
            transport.subscribe(
                ip,
                Arc::new(move |bytes, from| dispatch_response(&dispatch, bytes, from)),
            );
        }

        Card {
            transport,
            addr,
            info: None,
            username: DEFAULT_USERNAME.into(),
            password: DEFAULT_PASSWORD.into(),
            read_timeout: READ_TIMEOUT,
            transfer_id: AtomicU32::new(INITIAL_TRANSFER_ID),
            pending,
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn discovered(transport: Arc<UdpTransport>, info: CardInfo) -> Card {
        let mut card = Self::connect(transport, info.ip);
        card.info = Some(info);
        card
    }

    /// Replaces the default `admin`/`admin` credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Card {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Replaces the default 5 s response deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Card {
        self.read_timeout = timeout;
        self
    }

    /// Identity reported during discovery, when this handle came from there.
    pub fn info(&self) -> Option<&CardInfo> {
        self.info.as_ref()
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Reads `count` blocks starting at `lba_start`.
    ///
    /// Exactly one completion happens per request: either the response with a
    /// matching transfer ID resolves it, or the deadline fails it with
    /// [`Error::Timeout`] carrying the request frame. A response arriving
    /// after the deadline is dropped.
    pub fn read_binary_data(&self, lba_start: u32, count: u16) -> Result<Vec<u8>> {
        if !(1..=MAX_TRANSFER_BLOCKS).contains(&count) {
            log::warn!(
                "card {}: transfer count {count} outside 1..={MAX_TRANSFER_BLOCKS}, attempting anyway",
                self.addr
            );
        }

        let transfer_id = self.transfer_id.fetch_add(1, Ordering::Relaxed);
        let request = ReadRequest {
            lba: lba_start,
            count,
            transfer_id,
            username: &self.username,
            password: &self.password,
        }
        .encode();

        let (slot, completion) = mpsc::sync_channel(1);
        self.pending.lock().unwrap().insert(transfer_id, slot);

        log::trace!(
            "card {}: read lba {lba_start} count {count} transfer {transfer_id}",
            self.addr
        );
        if let Err(err) = send_transient(&request, self.addr) {
            self.pending.lock().unwrap().remove(&transfer_id);
            return Err(err.into());
        }

        match completion.recv_timeout(self.read_timeout) {
            Ok(data) => {
                self.pending.lock().unwrap().remove(&transfer_id);
                Ok(data)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                // evict first: once the slot is gone a late response cannot
                // complete it, so a final drain decides the race
                self.pending.lock().unwrap().remove(&transfer_id);
                if let Ok(data) = completion.try_recv() {
                    return Ok(data);
                }
                log::warn!(
                    "card {}: transfer {transfer_id} timed out after {:?}",
                    self.addr,
                    self.read_timeout
                );
                Err(Error::Timeout {
                    transfer_id,
                    request: request.to_vec(),
                })
            }
        }
    }

    /// Opens partition `partition` of this card as a FAT32 volume.
    ///
    /// The returned volume takes sole ownership of the handle.
    pub fn file_system_adapter(self, partition: usize) -> Result<Fat32Volume<Card>> {
        let partitions = mbr::read_partitions(&self)?;
        if partition >= partitions.len() {
            return Err(Error::PartitionOutOfRange {
                index: partition,
                count: partitions.len(),
            });
        }
        let target = partitions[partition].clone();
        Fat32Volume::open(self, &target)
    }

    /// Drops the transport subscription. Further reads will time out.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            if let IpAddr::V4(ip) = self.addr.ip() {
                self.transport.unsubscribe(ip);
            }
        }
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl BlockRead for Card {
    fn read_blocks(&self, lba: u32, count: u16) -> Result<Vec<u8>> {
        self.read_binary_data(lba, count)
    }
}

/// Sends one datagram from a throwaway socket, closed right after.
fn send_transient(payload: &[u8], to: SocketAddr) -> io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.send_to(payload, to)?;
    Ok(())
}

fn dispatch_response(pending: &Mutex<PendingMap>, bytes: &[u8], from: SocketAddr) {
    let response = match ReadResponse::parse(bytes) {
        Ok(response) => response,
        Err(PacketError::UnexpectedFrame { .. }) => return, // not a read response
        Err(err) => {
            log::debug!("card {from}: dropping malformed datagram: {err}");
            return;
        }
    };

    match pending.lock().unwrap().get(&response.transfer_id) {
        Some(slot) => match slot.try_send(response.data.to_vec()) {
            Ok(()) => log::trace!(
                "card {from}: transfer {} completed with {} bytes",
                response.transfer_id,
                response.data.len()
            ),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => log::debug!(
                "card {from}: duplicate response for transfer {}",
                response.transfer_id
            ),
        },
        None => log::debug!(
            "card {from}: response for unknown transfer {}, dropped",
            response.transfer_id
        ),
    }
}
