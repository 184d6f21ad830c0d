//! Shared test doubles: an in-memory block device, a fake card answering the
//! wire protocol over loopback UDP, and disk-image assembly helpers.

#![allow(dead_code)] // each test binary uses its own subset

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use wifi_sdcf::proto::{BLOCK_SIZE, READ_REQUEST_LEN, READ_RESPONSE_HEADER_LEN};
use wifi_sdcf::{BlockRead, Result};

/// Serves 512-byte blocks out of a byte image, zero-filled past its end.
pub struct MemoryDevice {
    image: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(image: Vec<u8>) -> MemoryDevice {
        MemoryDevice { image }
    }
}

impl BlockRead for MemoryDevice {
    fn read_blocks(&self, lba: u32, count: u16) -> Result<Vec<u8>> {
        Ok(blocks_of(&self.image, lba, count))
    }
}

fn blocks_of(image: &[u8], lba: u32, count: u16) -> Vec<u8> {
    let start = lba as usize * BLOCK_SIZE;
    let mut data = vec![0u8; count as usize * BLOCK_SIZE];
    if start < image.len() {
        let end = (start + data.len()).min(image.len());
        data[..end - start].copy_from_slice(&image[start..end]);
    }
    data
}

/// A card on loopback: answers command-4 read requests out of its image,
/// addressing every response to `reply_to`.
pub struct FakeCard {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeCard {
    pub fn serve(image: Vec<u8>, reply_to: SocketAddr) -> FakeCard {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                let mut buf = [0u8; 128];
                while running.load(Ordering::SeqCst) {
                    let len = match socket.recv_from(&mut buf) {
                        Ok((len, _)) => len,
                        Err(_) => continue,
                    };
                    if let Some(response) = answer(&image, &buf[..len]) {
                        socket.send_to(&response, reply_to).unwrap();
                    }
                }
            })
        };

        FakeCard {
            addr,
            running,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FakeCard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn answer(image: &[u8], request: &[u8]) -> Option<Vec<u8>> {
    if request.len() != READ_REQUEST_LEN || &request[..6] != b"FC1307" || request[7] != 4 {
        return None;
    }
    let lba = u32::from_be_bytes(request[8..12].try_into().unwrap());
    let count = u16::from_be_bytes(request[12..14].try_into().unwrap());
    let transfer_id = &request[48..52];

    let data = blocks_of(image, lba, count);
    let mut response = vec![0u8; READ_RESPONSE_HEADER_LEN + data.len()];
    response[..6].copy_from_slice(b"FC1307");
    response[6] = 2;
    response[7] = 4;
    response[8..12].copy_from_slice(&request[8..12]);
    // lba offset 12..14 left zero
    response[14..16].copy_from_slice(&0x18u16.to_be_bytes());
    response[16..18].copy_from_slice(&(data.len() as u16).to_be_bytes());
    response[18..22].copy_from_slice(transfer_id);
    response[READ_RESPONSE_HEADER_LEN..].copy_from_slice(&data);
    Some(response)
}

/* disk image assembly */

/// FAT32 boot sector with 512-byte sectors.
pub fn boot_sector(
    sectors_per_cluster: u8,
    reserved: u16,
    num_fats: u8,
    fat_size: u32,
    root_cluster: u32,
) -> Vec<u8> {
    let mut sector = vec![0u8; BLOCK_SIZE];
    sector[11..13].copy_from_slice(&512u16.to_le_bytes());
    sector[13] = sectors_per_cluster;
    sector[14..16].copy_from_slice(&reserved.to_le_bytes());
    sector[16] = num_fats;
    sector[32..36].copy_from_slice(&0x10000u32.to_le_bytes());
    sector[36..40].copy_from_slice(&fat_size.to_le_bytes());
    sector[44..48].copy_from_slice(&root_cluster.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// MBR sector with the given `(type_code, start_lba, length)` entries.
pub fn mbr_sector(entries: &[(u8, u32, u32)]) -> Vec<u8> {
    let mut sector = vec![0u8; BLOCK_SIZE];
    for (index, &(type_code, start, length)) in entries.iter().enumerate() {
        let offset = 446 + index * 16;
        sector[offset + 4] = type_code;
        sector[offset + 8..offset + 12].copy_from_slice(&start.to_le_bytes());
        sector[offset + 12..offset + 16].copy_from_slice(&length.to_le_bytes());
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

pub fn put_sector(image: &mut [u8], lba: usize, data: &[u8]) {
    image[lba * BLOCK_SIZE..lba * BLOCK_SIZE + data.len()].copy_from_slice(data);
}

/// Writes one 32-bit FAT entry into the FAT that starts at `fat_lba`.
pub fn put_fat_entry(image: &mut [u8], fat_lba: usize, cluster: u32, value: u32) {
    let offset = fat_lba * BLOCK_SIZE + cluster as usize * 4;
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// A short (8.3) directory slot.
pub fn short_slot(name83: &[u8; 11], attr: u8, first_cluster: u32, size: u32) -> [u8; 32] {
    let mut raw = [0u8; 32];
    raw[..11].copy_from_slice(name83);
    raw[11] = attr;
    raw[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
    raw[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
    raw[28..32].copy_from_slice(&size.to_le_bytes());
    raw
}

/// A long-name directory slot carrying up to 13 characters.
pub fn lfn_slot(order: u8, chars: &str) -> [u8; 32] {
    const OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
    let mut raw = [0u8; 32];
    raw[0] = order;
    raw[11] = 0x0F;
    for (offset, c) in OFFSETS.iter().zip(
        chars
            .encode_utf16()
            .chain(std::iter::repeat(0))
            .take(OFFSETS.len()),
    ) {
        raw[*offset..offset + 2].copy_from_slice(&c.to_le_bytes());
    }
    raw
}
