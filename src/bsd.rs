//! A Berkeley-socket-shaped facade over one reserved hardware socket.
//!
//! Ported from `adafruit_wiznet5k_socket.py`'s `socket` class. The original
//! reaches a module-level `_the_interface` global to find its chip; here
//! each [`BsdSocket`] is handed a `&NetInterface` at construction instead
//! (see the crate-level design notes, and [`crate::iface::NetInterface`]'s
//! own doc comment). `_default_socket_timeout` likewise becomes a plain
//! field rather than a class attribute shared by every socket.

use crate::chip::SOCK_SIZE;
use crate::clock::Clock;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::iface::{self, NetInterface};
use crate::socket::{self, Mode};
use crate::spi::Bus;
use embedded_hal::delay::DelayNs;
use rand_core::RngCore;

/// The default socket-operation timeout, matching
/// `_default_socket_timeout = None` (block forever) in the original.
const DEFAULT_TIMEOUT_MS: Option<u64> = None;

/// One reserved hardware socket, accessed through Berkeley-socket-shaped
/// methods.
///
/// Construction reserves a hardware socket for the `BsdSocket`'s lifetime
/// (mirroring `socket.__init__`'s immediate `get_socket(reserve_socket=True)`
/// call); [`Drop`] releases it. `accept` is the one place a second
/// `BsdSocket` is produced: it takes over the already-established
/// connection while `self` keeps listening on a freshly allocated socket,
/// the same "swap" the Python original performs on `self._socknum`.
pub struct BsdSocket<'a, B: Bus, D: DelayNs, C: Clock, R: RngCore> {
    iface: &'a NetInterface<B, D, C, R>,
    sock: u8,
    mode: Mode,
    bound_port: Option<u16>,
    timeout_ms: Option<u64>,
    blocking: bool,
    closed: bool,
}

impl<'a, B: Bus, D: DelayNs, C: Clock, R: RngCore> BsdSocket<'a, B, D, C, R> {
    /// Reserve a hardware socket from `iface` for use in `mode`.
    pub fn new(iface: &'a NetInterface<B, D, C, R>, mode: Mode) -> Result<Self, Error> {
        let sock = iface.get_socket(true)?;
        Ok(Self {
            iface,
            sock,
            mode,
            bound_port: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            blocking: true,
            closed: false,
        })
    }

    fn check_open(&self) -> Result<(), Error> {
        // The original raises "connection already closed" here; this crate
        // has no dedicated variant for that, so it's folded into the
        // catch-all argument-validity error.
        if self.closed {
            Err(Error::InvalidArgument)
        } else {
            Ok(())
        }
    }

    fn resolve(&self, endpoint: &Endpoint) -> Result<([u8; 4], u16), Error> {
        match endpoint {
            Endpoint::Ip4(ip, port) => Ok((*ip, *port)),
            Endpoint::Host(name, port) => Ok((self.iface.get_host_by_name(name)?, *port)),
        }
    }

    /// Record the local port a subsequent `listen`/`connect` should use,
    /// without yet touching the chip. Mirrors `socket.bind`.
    ///
    /// Every hardware socket shares the single interface IP address, so
    /// `ip` must be either `None` or exactly the address currently assigned
    /// to [`NetInterface`] (as returned by its `ifconfig`); anything else is
    /// rejected rather than silently ignored.
    pub fn bind(&mut self, ip: Option<[u8; 4]>, port: u16) -> Result<(), Error> {
        self.check_open()?;
        if let Some(requested) = ip {
            let (interface_ip, ..) = self.iface.ifconfig()?;
            if requested != interface_ip {
                return Err(Error::InvalidArgument);
            }
        }
        self.bound_port = Some(port);
        Ok(())
    }

    /// Open the socket bound to the port set by [`Self::bind`] (or an
    /// ephemeral one if none was bound) and put it into `LISTEN`. `backlog`
    /// is accepted for API shape but unused: the chip has no backlog queue
    /// deeper than one pending connection per socket.
    pub fn listen(&mut self, _backlog: u32) -> Result<(), Error> {
        self.check_open()?;
        let port = self.bound_port.unwrap_or(0);
        self.iface.socket_listen(self.sock, self.mode, port)
    }

    /// Wait for a connection on a listening socket, then return a new
    /// `BsdSocket` for it alongside the peer's address.
    ///
    /// Busy-polls the socket's status register until it reports
    /// `ESTABLISHED`/`SYNRECV`, bounded by [`Self::settimeout`]'s deadline
    /// if one was set; reuses [`Error::OpenFailed`] to report a timed-out
    /// accept, there being no dedicated variant for it.
    pub fn accept(&mut self) -> Result<(Self, [u8; 4], u16), Error> {
        self.check_open()?;
        let deadline = self.timeout_ms.map(|t| self.iface.now_millis() + t);
        loop {
            let current = self.iface.socket_status(self.sock)?;
            if matches!(current, socket::status::ESTABLISHED | socket::status::SYNRECV) {
                break;
            }
            if let Some(dl) = deadline {
                if self.iface.now_millis() >= dl {
                    return Err(Error::OpenFailed);
                }
            }
        }

        let port = self.bound_port.unwrap_or(0);
        let (new_listener, peer_ip, peer_port) = self.iface.accept(self.sock, self.mode, port)?;
        let established = self.sock;
        self.sock = new_listener;

        Ok((
            Self {
                iface: self.iface,
                sock: established,
                mode: self.mode,
                bound_port: None,
                timeout_ms: self.timeout_ms,
                blocking: self.blocking,
                closed: false,
            },
            peer_ip,
            peer_port,
        ))
    }

    /// Resolve `endpoint` and connect to it. For TCP this blocks until
    /// `ESTABLISHED`; for UDP it just records the default destination
    /// address/port used by subsequent [`Self::send`] calls.
    pub fn connect(&mut self, endpoint: &Endpoint) -> Result<(), Error> {
        self.check_open()?;
        let (ip, port) = self.resolve(endpoint)?;
        let src = self.bound_port.take().unwrap_or(0);
        self.iface.socket_connect(self.sock, self.mode, src, ip, port)
    }

    /// Send on an already-connected socket.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.check_open()?;
        let timeout = self.timeout_ms.unwrap_or(5_000);
        self.iface.socket_write(self.sock, data, timeout, self.mode)
    }

    /// Connect to `endpoint` and send `data` to it in one call, as a UDP
    /// socket's `sendto`.
    pub fn sendto(&mut self, data: &[u8], endpoint: &Endpoint) -> Result<usize, Error> {
        self.connect(endpoint)?;
        self.send(data)
    }

    /// Read up to `buf.len()` bytes of a connected TCP socket's stream.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_open()?;
        self.iface.socket_recv(self.sock, buf)
    }

    /// Equivalent to [`Self::recv`]; kept as a distinct name for parity with
    /// the original's `recv`/`recv_into` pair (Rust's `&mut [u8]`-based
    /// `recv` already writes into caller-owned storage, so there is no
    /// separate allocating form to avoid here).
    pub fn recv_into(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.recv(buf)
    }

    /// Read one UDP datagram, returning its length and the sender's address.
    pub fn recvfrom(&mut self, buf: &mut [u8]) -> Result<(usize, [u8; 4], u16), Error> {
        self.check_open()?;
        self.iface.socket_recv_udp(self.sock, buf)
    }

    /// Equivalent to [`Self::recvfrom`]; see [`Self::recv_into`].
    pub fn recvfrom_into(&mut self, buf: &mut [u8]) -> Result<(usize, [u8; 4], u16), Error> {
        self.recvfrom(buf)
    }

    /// Issue `DISCON` without waiting for the socket to settle.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.check_open()?;
        self.iface.socket_disconnect(self.sock)
    }

    /// Close the socket and release its reservation. Idempotent: calling
    /// this more than once, or letting [`Drop`] call it, is harmless.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.iface.socket_close(self.sock);
        let _ = self.iface.release_socket(self.sock);
        result
    }

    /// Set the blocking timeout for `accept`/`recv`-shaped calls, in
    /// milliseconds. `None` blocks forever, matching `settimeout(None)`.
    pub fn settimeout(&mut self, timeout_ms: Option<u64>) {
        self.timeout_ms = timeout_ms;
        self.blocking = timeout_ms.is_none();
    }

    /// `setblocking(True)` clears the timeout; `setblocking(False)` is
    /// `settimeout(Some(0))`.
    pub fn setblocking(&mut self, blocking: bool) {
        self.blocking = blocking;
        self.timeout_ms = if blocking { None } else { Some(0) };
    }

    /// Whether this socket currently blocks indefinitely.
    pub fn getblocking(&self) -> bool {
        self.blocking
    }

    /// The hardware socket number currently backing this object. Exposed
    /// for diagnostics; not meaningful across an `accept` call, which
    /// reassigns it.
    pub fn socket_number(&self) -> u8 {
        self.sock
    }

    /// The largest single write this socket's TX ring buffer can hold.
    pub fn max_packet_size(&self) -> u16 {
        SOCK_SIZE
    }
}

impl<'a, B: Bus, D: DelayNs, C: Clock, R: RngCore> Drop for BsdSocket<'a, B, D, C, R> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.iface.socket_close(self.sock);
            let _ = self.iface.release_socket(self.sock);
        }
    }
}

/// Convert a `u16` from host to network byte order.
///
/// Ported from `adafruit_wiznet5k_socket.py::htons`. `to_be` is a no-op on
/// big-endian targets and a byte swap on little-endian ones, which is
/// exactly what "network order" (always big-endian) requires.
pub fn htons(value: u16) -> u16 {
    value.to_be()
}

/// Convert a `u16` from network to host byte order. Self-inverse with
/// [`htons`], same operation under a different name for call-site clarity.
pub fn ntohs(value: u16) -> u16 {
    u16::from_be(value)
}

/// Convert a `u32` from host to network byte order.
pub fn htonl(value: u32) -> u32 {
    value.to_be()
}

/// Convert a `u32` from network to host byte order.
pub fn ntohl(value: u32) -> u32 {
    u32::from_be(value)
}

/// Parse a dotted-decimal IPv4 address into its packed 4-byte form.
///
/// Ported from `adafruit_wiznet5k_socket.py::inet_aton`.
pub fn inet_aton(s: &str) -> Result<[u8; 4], Error> {
    iface::unpretty_ip(s)
}

/// Render a packed 4-byte IPv4 address in dotted-decimal form.
///
/// Ported from `adafruit_wiznet5k_socket.py::inet_ntoa`.
pub fn inet_ntoa(ip: [u8; 4]) -> heapless::String<15> {
    iface::pretty_ip(ip)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::alloc::SocketAllocator;
    use crate::chip::ChipVariant;
    use crate::spi::ChipIo;
    use mockall::mock;
    use rand_core::impls;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    mock! {
        pub Bus {}
        impl Bus for Bus {
            type Error = ();
            fn write_then_read(&mut self, header: &[u8], buf: &mut [u8]) -> Result<(), ()>;
            fn write_then_write(&mut self, header: &[u8], data: &[u8]) -> Result<(), ()>;
        }
    }

    struct NoDelay;
    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    struct FakeClock(Rc<StdRefCell<u64>>);
    impl Clock for FakeClock {
        fn now_millis(&mut self) -> u64 {
            *self.0.borrow()
        }
    }

    struct FixedRng(u32);
    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            self.0
        }
        fn next_u64(&mut self) -> u64 {
            impls::next_u64_via_u32(self)
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            impls::fill_bytes_via_next(self, dest)
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    fn harness(bus: MockBus) -> NetInterface<MockBus, NoDelay, FakeClock, FixedRng> {
        let io = ChipIo::new(bus, ChipVariant::W5500);
        crate::iface::NetInterface::for_test(
            io,
            NoDelay,
            FakeClock(Rc::new(StdRefCell::new(0))),
            FixedRng(1),
            SocketAllocator::new(8),
            None,
            [0; 4],
        )
    }

    #[test]
    fn htons_is_self_inverse() {
        assert_eq!(htons(htons(0xABCD)), 0xABCD);
        assert_eq!(htonl(htonl(0x0102_0304)), 0x0102_0304);
    }

    #[test]
    fn inet_aton_and_inet_ntoa_round_trip() {
        let ip = [203, 0, 113, 7];
        assert_eq!(inet_aton(inet_ntoa(ip).as_str()).unwrap(), ip);
    }

    #[test]
    fn new_socket_reserves_a_nonzero_hardware_socket() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, buf| {
            buf[0] = socket::status::CLOSED;
            Ok(())
        });
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        let iface = harness(bus);
        let sock = BsdSocket::new(&iface, Mode::Tcp).unwrap();
        assert_ne!(sock.socket_number(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, buf| {
            buf[0] = socket::status::CLOSED;
            Ok(())
        });
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        let iface = harness(bus);
        let mut sock = BsdSocket::new(&iface, Mode::Tcp).unwrap();
        sock.close().unwrap();
        sock.close().unwrap();
    }

    #[test]
    fn operating_on_a_closed_socket_is_rejected() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, buf| {
            buf[0] = socket::status::CLOSED;
            Ok(())
        });
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        let iface = harness(bus);
        let mut sock = BsdSocket::new(&iface, Mode::Tcp).unwrap();
        sock.close().unwrap();
        assert_eq!(sock.bind(None, 1234), Err(Error::InvalidArgument));
    }

    #[test]
    fn bind_accepts_none_or_the_interface_address() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, buf| {
            for b in buf.iter_mut() {
                *b = 0;
            }
            buf[0] = socket::status::CLOSED;
            Ok(())
        });
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        let iface = harness(bus);
        let mut sock = BsdSocket::new(&iface, Mode::Tcp).unwrap();
        assert_eq!(sock.bind(None, 1234), Ok(()));
        assert_eq!(sock.bind(Some([0, 0, 0, 0]), 1234), Ok(()));
    }

    #[test]
    fn bind_rejects_an_address_other_than_the_interface_ip() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, buf| {
            for b in buf.iter_mut() {
                *b = 0;
            }
            buf[0] = socket::status::CLOSED;
            Ok(())
        });
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        let iface = harness(bus);
        let mut sock = BsdSocket::new(&iface, Mode::Tcp).unwrap();
        assert_eq!(
            sock.bind(Some([10, 0, 0, 99]), 1234),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn settimeout_none_means_blocking() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, buf| {
            buf[0] = socket::status::CLOSED;
            Ok(())
        });
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        let iface = harness(bus);
        let mut sock = BsdSocket::new(&iface, Mode::Tcp).unwrap();
        sock.settimeout(Some(10));
        assert!(!sock.getblocking());
        sock.settimeout(None);
        assert!(sock.getblocking());
    }

    #[test]
    fn resolve_passes_through_an_ip4_endpoint_without_touching_the_chip() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, buf| {
            buf[0] = socket::status::CLOSED;
            Ok(())
        });
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        let iface = harness(bus);
        let sock = BsdSocket::new(&iface, Mode::Udp).unwrap();
        let ep = Endpoint::Ip4([1, 2, 3, 4], 80);
        assert_eq!(sock.resolve(&ep).unwrap(), ([1, 2, 3, 4], 80));
    }
}
