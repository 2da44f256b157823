//! The top-level network interface facade.
//!
//! Ported from `adafruit_wiznet5k.py`'s `WIZNET5K` class. The original holds
//! a module-level `_the_interface` singleton that every `socket` instance
//! reaches for; here that's replaced by an explicit `&NetInterface` taken by
//! [`crate::bsd::BsdSocket`] at construction (see the crate-level design
//! notes). All the interior state that singleton let Python mutate through a
//! shared reference lives behind a single [`core::cell::RefCell`], so every
//! method here takes `&self`.

use crate::alloc::SocketAllocator;
use crate::chip::ChipVariant;
use crate::clock::Clock;
use crate::debug;
use crate::dhcp::{DhcpClient, DhcpLease, DhcpState};
use crate::dns;
use crate::error::Error;
use crate::init;
use crate::socket::{self, Mode};
use crate::spi::{Bus, ChipIo};
use core::cell::RefCell;
use core::fmt::Write as _;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use heapless::String;
use rand_core::RngCore;

struct Inner<B: Bus, D: DelayNs, C: Clock, R: RngCore> {
    io: ChipIo<B>,
    delay: D,
    clock: C,
    rng: R,
    alloc: SocketAllocator,
    dhcp: Option<DhcpClient>,
    dns_server: [u8; 4],
}

/// Owns the chip, the socket pool, and (optionally) a DHCP lease.
///
/// One `NetInterface` is built once for the life of the program and shared,
/// by reference, with every [`crate::bsd::BsdSocket`] constructed against
/// it. There is no global mutable state anywhere in this crate: the sharing
/// is an ordinary Rust reference, handed out by whoever owns the
/// `NetInterface` value.
pub struct NetInterface<B: Bus, D: DelayNs, C: Clock, R: RngCore> {
    inner: RefCell<Inner<B, D, C, R>>,
}

impl<B: Bus, D: DelayNs, C: Clock, R: RngCore> NetInterface<B, D, C, R> {
    /// Reset the chip (if a reset pin is given), autodetect its variant,
    /// program the MAC address, wait up to 5 seconds for the PHY link to
    /// come up, and optionally block acquiring a DHCP lease.
    ///
    /// `reset` mirrors `WIZNET5K.__init__`'s hardware reset pulse: held low
    /// 100ms, then high, then a further settle delay before the chip is
    /// addressed.
    #[allow(clippy::too_many_arguments)]
    pub fn new<P: OutputPin>(
        spi: B,
        reset: Option<&mut P>,
        mut delay: D,
        mut clock: C,
        mut rng: R,
        mac: [u8; 6],
        hostname: Option<&str>,
        dhcp: bool,
    ) -> Result<Self, Error> {
        if let Some(pin) = reset {
            debug::println!("pulsing WIZnet reset pin");
            pin.set_low().map_err(|_| Error::Bus)?;
            delay.delay_ms(100);
            pin.set_high().map_err(|_| Error::Bus)?;
            delay.delay_ms(5_000);
        }

        let mut io = init::detect_and_init(spi, &mut delay)?;
        debug::println!("WIZnet chip detected: {}", io.variant().name());

        let shar = io.registers().shar;
        io.write_common(shar, &mac)?;

        let link_flag = io.registers().link_flag;
        let deadline = clock.now_millis() + 5_000;
        loop {
            let mut buf = [0u8];
            io.read_common(link_flag, &mut buf)?;
            if buf[0] & 0x01 != 0 {
                break;
            }
            if clock.now_millis() >= deadline {
                debug::println!("Ethernet link did not come up within 5s");
                break;
            }
            delay.delay_ms(500);
        }

        let mut alloc = SocketAllocator::new(io.variant().max_sockets());

        let mut dhcp_client = None;
        let mut dns_server = [0u8; 4];
        if dhcp {
            let mut client = DhcpClient::new(mac, hostname, &mut rng, &mut clock);
            let lease = client.request_lease(&mut io, &mut alloc, &mut delay, &mut clock, &mut rng)?;
            apply_lease(&mut io, &lease)?;
            dns_server = lease.dns_server;
            dhcp_client = Some(client);
        }

        Ok(Self {
            inner: RefCell::new(Inner {
                io,
                delay,
                clock,
                rng,
                alloc,
                dhcp: dhcp_client,
                dns_server,
            }),
        })
    }

    /// Assemble a `NetInterface` directly from already-constructed parts,
    /// bypassing [`Self::new`]'s reset/detect/DHCP sequence. Used by other
    /// modules' test suites, which need a `NetInterface` to build a
    /// [`crate::bsd::BsdSocket`] against without driving a full mock chip
    /// bring-up sequence.
    #[cfg(all(test, feature = "std"))]
    pub fn for_test(
        io: ChipIo<B>,
        delay: D,
        clock: C,
        rng: R,
        alloc: SocketAllocator,
        dhcp: Option<DhcpClient>,
        dns_server: [u8; 4],
    ) -> Self {
        Self {
            inner: RefCell::new(Inner {
                io,
                delay,
                clock,
                rng,
                alloc,
                dhcp,
                dns_server,
            }),
        }
    }

    /// The detected chip variant.
    pub fn chip(&self) -> ChipVariant {
        self.inner.borrow().io.variant()
    }

    /// Number of hardware sockets this chip exposes (4 or 8).
    pub fn max_sockets(&self) -> u8 {
        self.chip().max_sockets()
    }

    /// Current IPv4 address, subnet mask, gateway, and DNS server.
    ///
    /// The first three live in chip registers (`SIPR`/`SUBR`/`GAR`); the DNS
    /// server does not (the WIZnet silicon has no DNS register), so it's
    /// tracked as plain software state, set either by DHCP or by
    /// [`Self::set_ifconfig`].
    pub fn ifconfig(&self) -> Result<([u8; 4], [u8; 4], [u8; 4], [u8; 4]), Error> {
        let mut inner = self.inner.borrow_mut();
        let regs = *inner.io.registers();
        let mut ip = [0u8; 4];
        inner.io.read_common(regs.sipr, &mut ip)?;
        let mut mask = [0u8; 4];
        inner.io.read_common(regs.subr, &mut mask)?;
        let mut gw = [0u8; 4];
        inner.io.read_common(regs.gar, &mut gw)?;
        Ok((ip, mask, gw, inner.dns_server))
    }

    /// Set a static IPv4 configuration, overriding whatever DHCP (if any)
    /// last wrote.
    pub fn set_ifconfig(
        &self,
        ip: [u8; 4],
        mask: [u8; 4],
        gateway: [u8; 4],
        dns_server: [u8; 4],
    ) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let regs = *inner.io.registers();
        inner.io.write_common(regs.sipr, &ip)?;
        inner.io.write_common(regs.subr, &mask)?;
        inner.io.write_common(regs.gar, &gateway)?;
        inner.dns_server = dns_server;
        Ok(())
    }

    /// The chip's source MAC address (`SHAR`).
    pub fn mac_address(&self) -> Result<[u8; 6], Error> {
        let mut inner = self.inner.borrow_mut();
        let shar = inner.io.registers().shar;
        let mut buf = [0u8; 6];
        inner.io.read_common(shar, &mut buf)?;
        Ok(buf)
    }

    /// Reprogram the chip's source MAC address.
    pub fn set_mac_address(&self, mac: [u8; 6]) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let shar = inner.io.registers().shar;
        inner.io.write_common(shar, &mac)
    }

    /// Whether the PHY reports an active link.
    pub fn link_status(&self) -> Result<bool, Error> {
        let mut inner = self.inner.borrow_mut();
        let link_flag = inner.io.registers().link_flag;
        let mut buf = [0u8];
        inner.io.read_common(link_flag, &mut buf)?;
        Ok(buf[0] & 0x01 != 0)
    }

    /// Retry Count Register: number of retransmissions before a socket
    /// gives up (`RCR`).
    pub fn rcr(&self) -> Result<u8, Error> {
        let mut inner = self.inner.borrow_mut();
        let addr = inner.io.registers().rcr;
        let mut buf = [0u8];
        inner.io.read_common(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Set the Retry Count Register.
    pub fn set_rcr(&self, value: u8) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let addr = inner.io.registers().rcr;
        inner.io.write_common(addr, &[value])
    }

    /// Retry Time Register, in 100us units (`RTR`).
    pub fn rtr(&self) -> Result<u16, Error> {
        let mut inner = self.inner.borrow_mut();
        let addr = inner.io.registers().rtr;
        let mut buf = [0u8; 2];
        inner.io.read_common(addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Set the Retry Time Register.
    pub fn set_rtr(&self, value: u16) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let addr = inner.io.registers().rtr;
        inner.io.write_common(addr, &value.to_be_bytes())
    }

    /// Re-run the current variant's soft reset sequence, leaving the chip's
    /// variant and socket buffer sizing untouched.
    pub fn soft_reset(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let Inner { io, delay, .. } = &mut *inner;
        init::soft_reset(io, delay)
    }

    /// Milliseconds since the clock's epoch, for callers doing their own
    /// timeout bookkeeping (e.g. [`crate::bsd::BsdSocket`]'s `settimeout`).
    pub fn now_millis(&self) -> u64 {
        self.inner.borrow_mut().clock.now_millis()
    }

    /// Reserve a hardware socket. `reserve` mirrors
    /// `WIZNET5K.get_socket(reserve_socket=...)`: when true, socket 0 (the
    /// only MACRAW-capable socket) is never handed out, and the chosen
    /// socket stays reserved until [`Self::release_socket`].
    pub fn get_socket(&self, reserve: bool) -> Result<u8, Error> {
        let mut inner = self.inner.borrow_mut();
        let Inner { io, alloc, .. } = &mut *inner;
        alloc.get_socket(reserve, |n| {
            socket::status(io, n)
                .map(|s| s == socket::status::CLOSED)
                .unwrap_or(false)
        })
    }

    /// Release a previously reserved socket.
    pub fn release_socket(&self, n: u8) -> Result<(), Error> {
        self.inner.borrow_mut().alloc.release_socket(n)
    }

    /// Read socket `n`'s status register.
    pub fn socket_status(&self, n: u8) -> Result<u8, Error> {
        socket::status(&mut self.inner.borrow_mut().io, n)
    }

    /// Open socket `n` in `mode`. `src_port == 0` draws an ephemeral port
    /// from the allocator, mirroring `socket_open`'s behaviour when no
    /// explicit local port was bound.
    pub fn socket_open(&self, n: u8, mode: Mode, src_port: u16) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let port = if src_port == 0 {
            inner.alloc.draw_ephemeral_port(&mut inner.rng)
        } else {
            src_port
        };
        inner.alloc.mark_port_in_use(n, port)?;
        let Inner { io, delay, .. } = &mut *inner;
        socket::open(io, delay, n, mode, port)
    }

    /// Open socket `n` and connect it to `dest_ip:dest_port`.
    #[allow(clippy::too_many_arguments)]
    pub fn socket_connect(
        &self,
        n: u8,
        mode: Mode,
        src_port: u16,
        dest_ip: [u8; 4],
        dest_port: u16,
    ) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let port = if src_port == 0 {
            inner.alloc.draw_ephemeral_port(&mut inner.rng)
        } else {
            src_port
        };
        inner.alloc.mark_port_in_use(n, port)?;
        let Inner { io, delay, .. } = &mut *inner;
        socket::connect(io, delay, n, mode, port, dest_ip, dest_port)
    }

    /// Open socket `n` bound to `src_port` and put it into `LISTEN`.
    pub fn socket_listen(&self, n: u8, mode: Mode, src_port: u16) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.alloc.mark_port_in_use(n, src_port)?;
        let Inner { io, delay, .. } = &mut *inner;
        socket::listen(io, delay, n, mode, src_port)
    }

    /// Accept a connection on listening socket `n`: read the peer that has
    /// connected, allocate and start listening on a fresh socket so `n`
    /// keeps accepting further connections, and hand the caller back the
    /// peer address and the (still reserved) socket `n` used to hold the
    /// just-established connection.
    ///
    /// This is the Rust shape of `socket.accept`'s socket-number swap: the
    /// Python original reassigns `self._socknum` to a newly opened socket
    /// and returns a *new* `socket` object wrapping the old, now-connected
    /// one. Here the caller ([`crate::bsd::BsdSocket::accept`]) performs the
    /// analogous swap on its own `sock` field using the `(new_listener, ..)`
    /// this returns.
    pub fn accept(&self, n: u8, mode: Mode, listen_port: u16) -> Result<(u8, [u8; 4], u16), Error> {
        let mut inner = self.inner.borrow_mut();
        let peer = socket::accept_peer(&mut inner.io, n)?;
        let Inner { io, alloc, .. } = &mut *inner;
        let new_listener = alloc.get_socket(true, |k| {
            socket::status(io, k)
                .map(|s| s == socket::status::CLOSED)
                .unwrap_or(false)
        })?;
        drop(inner);
        self.socket_listen(new_listener, mode, listen_port)?;
        Ok((new_listener, peer.0, peer.1))
    }

    /// Issue `DISCON` without waiting for it to take effect.
    pub fn socket_disconnect(&self, n: u8) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let Inner { io, delay, .. } = &mut *inner;
        socket::disconnect(io, delay, n)
    }

    /// Issue `CLOSE` and wait for it to take effect.
    pub fn socket_close(&self, n: u8) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let Inner { io, delay, clock, .. } = &mut *inner;
        socket::close(io, delay, clock, n)
    }

    /// Read up to `buf.len()` bytes of a TCP socket's received data.
    pub fn socket_recv(&self, n: u8, buf: &mut [u8]) -> Result<usize, Error> {
        let mut inner = self.inner.borrow_mut();
        let Inner { io, delay, .. } = &mut *inner;
        socket::recv(io, delay, n, buf)
    }

    /// Read one UDP datagram from socket `n`.
    pub fn socket_recv_udp(&self, n: u8, buf: &mut [u8]) -> Result<(usize, [u8; 4], u16), Error> {
        let mut inner = self.inner.borrow_mut();
        let Inner { io, delay, .. } = &mut *inner;
        socket::recv_udp(io, delay, n, buf)
    }

    /// Write `data` to socket `n`, waiting up to `timeout_ms` for TX space.
    pub fn socket_write(&self, n: u8, data: &[u8], timeout_ms: u64, mode: Mode) -> Result<usize, Error> {
        let mut inner = self.inner.borrow_mut();
        let Inner { io, delay, clock, .. } = &mut *inner;
        socket::write(io, delay, clock, n, data, timeout_ms, mode)
    }

    /// The current DHCP FSM state, if a lease was requested at construction.
    pub fn dhcp_state(&self) -> Option<DhcpState> {
        self.inner.borrow().dhcp.as_ref().map(|d| d.state())
    }

    /// The currently bound DHCP lease, if any.
    pub fn dhcp_lease(&self) -> Option<DhcpLease> {
        self.inner.borrow().dhcp.as_ref().and_then(|d| d.lease())
    }

    /// Advance the DHCP FSM by one non-blocking tick, applying a newly
    /// (re)bound lease to the chip's address registers and the software
    /// DNS-server field. Returns the lease if this call bound or renewed
    /// one. A no-op if DHCP was never requested.
    ///
    /// Mirrors `maintain_dhcp_lease`, including its link-flap handling:
    /// while the PHY link is down, the lease is dropped and the address
    /// registers are zeroed so nothing is left advertising a stale address.
    pub fn maintain_dhcp_lease(&self) -> Result<Option<DhcpLease>, Error> {
        if self.inner.borrow().dhcp.is_none() {
            return Ok(None);
        }
        if !self.link_status()? {
            let mut inner = self.inner.borrow_mut();
            if let Some(dhcp) = inner.dhcp.as_mut() {
                dhcp.notify_link_down();
            }
            let regs = *inner.io.registers();
            inner.io.write_common(regs.sipr, &[0u8; 4])?;
            inner.io.write_common(regs.subr, &[0u8; 4])?;
            inner.io.write_common(regs.gar, &[0u8; 4])?;
            inner.dns_server = [0u8; 4];
            return Ok(None);
        }

        let mut inner = self.inner.borrow_mut();
        let Inner {
            io,
            alloc,
            delay,
            clock,
            rng,
            dhcp,
            dns_server,
        } = &mut *inner;
        let Some(client) = dhcp.as_mut() else {
            return Ok(None);
        };
        let lease = client.maintain(io, alloc, delay, clock, rng, false)?;
        if let Some(lease) = lease {
            apply_lease(io, &lease)?;
            *dns_server = lease.dns_server;
        }
        Ok(lease)
    }

    /// Resolve `hostname` to an IPv4 address over a freshly reserved
    /// socket and the interface's current DNS server.
    pub fn get_host_by_name(&self, hostname: &str) -> Result<[u8; 4], Error> {
        let sock = self.get_socket(false)?;
        let mut inner = self.inner.borrow_mut();
        let Inner {
            io,
            delay,
            clock,
            rng,
            dns_server,
            ..
        } = &mut *inner;
        dns::resolve(io, delay, clock, rng, sock, *dns_server, hostname)
    }
}

fn apply_lease<B: Bus>(io: &mut ChipIo<B>, lease: &DhcpLease) -> Result<(), Error> {
    let regs = *io.registers();
    io.write_common(regs.sipr, &lease.ip)?;
    io.write_common(regs.subr, &lease.subnet_mask)?;
    io.write_common(regs.gar, &lease.gateway)
}

/// Render a 4-byte IPv4 address as `"a.b.c.d"`.
///
/// Ported from `WIZNET5K.pretty_ip`.
pub fn pretty_ip(ip: [u8; 4]) -> String<15> {
    let mut s = String::new();
    let _ = write!(s, "{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
    s
}

/// Parse a dotted-decimal IPv4 address. Ported from `WIZNET5K.unpretty_ip`.
pub fn unpretty_ip(s: &str) -> Result<[u8; 4], Error> {
    let mut out = [0u8; 4];
    let mut parts = s.split('.');
    for slot in out.iter_mut() {
        let part = parts.next().ok_or(Error::InvalidArgument)?;
        *slot = part.parse::<u8>().map_err(|_| Error::InvalidArgument)?;
    }
    if parts.next().is_some() {
        return Err(Error::InvalidArgument);
    }
    Ok(out)
}

/// Render a 6-byte MAC address as `"aa:bb:cc:dd:ee:ff"`.
///
/// Ported from `WIZNET5K.pretty_mac`.
pub fn pretty_mac(mac: [u8; 6]) -> String<17> {
    let mut s = String::new();
    let _ = write!(
        s,
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
    s
}

/// Parse a colon-separated MAC address string.
pub fn unpretty_mac(s: &str) -> Result<[u8; 6], Error> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for slot in out.iter_mut() {
        let part = parts.next().ok_or(Error::InvalidArgument)?;
        *slot = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidArgument)?;
    }
    if parts.next().is_some() {
        return Err(Error::InvalidArgument);
    }
    Ok(out)
}
