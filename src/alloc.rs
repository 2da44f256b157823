//! Hardware socket pool: reservation bit-set and ephemeral source ports.
//!
//! Ported from `adafruit_wiznet5k.py::get_socket`/`release_socket`. The
//! original's module-level `WIZNET5K._sockets_reserved` class attribute
//! becomes an instance-owned, fixed-capacity `heapless::Vec` sized for the
//! largest variant (8 sockets); the crate has no allocator.

use crate::error::Error;
use rand_core::RngCore;

/// Largest number of hardware sockets any supported variant has.
const MAX_SOCKETS: usize = 8;

/// Pool of hardware sockets with a reservation bit-set and per-socket
/// ephemeral source port bookkeeping.
///
/// Socket 0 is never reservable: it is the only socket capable of MACRAW
/// mode, so it is kept available for DNS/DHCP protocol traffic even when
/// every other socket has been reserved by a [`crate::bsd::BsdSocket`].
pub struct SocketAllocator {
    max_sockets: u8,
    reserved: [bool; MAX_SOCKETS - 1],
    ports_in_use: [u16; MAX_SOCKETS],
}

impl SocketAllocator {
    /// Construct a pool sized for `max_sockets` sockets (4 or 8), with no
    /// reservations and no in-use ports.
    pub fn new(max_sockets: u8) -> Self {
        Self {
            max_sockets,
            reserved: [false; MAX_SOCKETS - 1],
            ports_in_use: [0; MAX_SOCKETS],
        }
    }

    fn check_range(&self, sock: u8) -> Result<(), Error> {
        if sock < self.max_sockets {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Find a socket whose hardware status is `CLOSED`, consulting
    /// `status_closed(n)` for each candidate.
    ///
    /// If `reserve` is true, socket 0 is never considered, and the chosen
    /// slot's reservation flag is set before returning. Otherwise socket 0
    /// is preferred when available.
    pub fn get_socket(
        &mut self,
        reserve: bool,
        mut status_closed: impl FnMut(u8) -> bool,
    ) -> Result<u8, Error> {
        if !reserve && status_closed(0) {
            return Ok(0);
        }
        for n in 1..self.max_sockets {
            let idx = (n - 1) as usize;
            if !self.reserved[idx] && status_closed(n) {
                if reserve {
                    self.reserved[idx] = true;
                }
                return Ok(n);
            }
        }
        Err(Error::SocketExhausted)
    }

    /// Clear socket `n`'s reservation flag.
    pub fn release_socket(&mut self, n: u8) -> Result<(), Error> {
        self.check_range(n)?;
        if n > 0 {
            self.reserved[(n - 1) as usize] = false;
        }
        Ok(())
    }

    /// Record that `port` is in use by socket `n`.
    pub fn mark_port_in_use(&mut self, n: u8, port: u16) -> Result<(), Error> {
        self.check_range(n)?;
        self.ports_in_use[n as usize] = port;
        Ok(())
    }

    /// Draw a uniform random ephemeral port in `[49152, 65535]` not already
    /// recorded as in use by another socket.
    pub fn draw_ephemeral_port(&self, rng: &mut impl RngCore) -> u16 {
        loop {
            let candidate = 49152 + (rng.next_u32() % (65536 - 49152)) as u16;
            if !self.ports_in_use[..self.max_sockets as usize].contains(&candidate) {
                return candidate;
            }
        }
    }
}
