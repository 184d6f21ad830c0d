//! Client for WiFi SD/CF storage cards that expose their raw block device
//! over a proprietary UDP protocol.
//!
//! A host on the same broadcast domain discovers cards, reads blocks off
//! them, and interprets the bytes as an MBR-partitioned FAT32 volume to list
//! directories and download files.
//!
//! # Layers
//! * [transport] - one UDP receive socket, per-peer and broadcast dispatch
//! * [discovery] - periodic broadcast probes, card-info parsing, dedup
//! * [card] - transfer-ID correlated block reads with timeouts
//! * [mbr] - partition table of sector 0
//! * [fat32] - BPB, cluster chains, directory entries, long file names
//! * [fs] - lazy [Directory]/[File] tree over a [FileSystemAdapter]
//! * [watch] - polling watcher reporting new/modified/removed files
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use wifi_sdcf::{Card, Directory, LocalFileSink, UdpTransport};
//!
//! let transport = UdpTransport::new().unwrap();
//! let card = Card::connect(Arc::clone(&transport), "192.168.0.123".parse().unwrap());
//! let volume = Arc::new(card.file_system_adapter(0).unwrap());
//!
//! let root = Directory::root(volume);
//! let photo = root.get_directory("DCIM").unwrap().get_file("IMG_0001.JPG").unwrap();
//! photo.download(&LocalFileSink, "IMG_0001.JPG").unwrap();
//! ```
//!
//! [Directory]: crate::fs::Directory
//! [File]: crate::fs::File
//! [FileSystemAdapter]: crate::fs::FileSystemAdapter

pub mod card;
pub mod discovery;
pub mod error;
pub mod fat32;
pub mod fs;
pub mod mbr;
pub mod proto;
pub mod transport;
pub mod watch;

pub use crate::card::{BlockRead, Card};
pub use crate::discovery::{CardInfo, Discovery, MacAddr};
pub use crate::error::{Error, Result};
pub use crate::fat32::{DirEntry, Fat32Volume, Timestamp};
pub use crate::fs::{Directory, File, FileSink, FileSystemAdapter, LocalFileSink, Node};
pub use crate::mbr::{FileSystemKind, PartitionInfo};
pub use crate::proto::CardType;
pub use crate::transport::UdpTransport;
pub use crate::watch::{DirectoryWatcher, WatchEvent, WatcherHandle};
