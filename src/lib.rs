//! A register-level driver for the WIZnet W5100S/W5500/W6100
//! SPI-to-Ethernet family.
//!
//! Unlike [`cotton-w5500`](https://docs.rs/cotton-w5500), which drives a
//! W5500 in MACRAW mode and hands raw frames to
//! [smoltcp](https://crates.io/crates/smoltcp), this crate terminates
//! TCP/UDP in the chip's own silicon and exposes the chip's hardware
//! sockets directly. It owns:
//!
//! - [`chip`]/[`spi`]/[`init`]: variant autodetection and the SPI
//!   register-read/write framing each variant requires;
//! - [`alloc`]/[`socket`]: a pool of hardware sockets and the
//!   open/connect/listen/accept/send/recv/close state machine built on top
//!   of them;
//! - [`dhcp`]: a non-blocking DHCPv4 client FSM with T1/T2 renewal;
//! - [`dns`]: a minimal DNS A-record resolver;
//! - [`iface`]: [`iface::NetInterface`], the facade composing all of the
//!   above;
//! - [`bsd`]: [`bsd::BsdSocket`], a Berkeley-sockets-shaped wrapper around
//!   [`iface::NetInterface`]'s socket operations.
//!
//! None of this crate spawns threads or requires an allocator: every
//! suspension point is an explicit poll-with-timeout, driven by a caller's
//! event loop (see the concurrency notes on [`iface::NetInterface`]).
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod alloc;
pub mod bsd;
pub mod chip;
pub mod clock;
pub mod debug;
pub mod dhcp;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod init;
pub mod iface;
pub mod socket;
pub mod spi;

pub use bsd::BsdSocket;
pub use chip::ChipVariant;
pub use endpoint::Endpoint;
pub use error::Error;
pub use iface::NetInterface;
