//! The UDP Tracker Manager (spec.md §4.C): connection-id caching,
//! transaction multiplexing and BEP-15 retransmission over a single
//! socket.

pub mod udp;
pub mod wire;

pub use udp::{AnnounceInfo, Manager, ScrapeInfo, Stats};
pub use wire::{AnnounceEvent, AnnounceParams};
