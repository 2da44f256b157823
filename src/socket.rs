//! Per-socket open/connect/listen/accept/recv/write/close and the TX/RX
//! ring-buffer pointer arithmetic that backs them.
//!
//! Ported from `adafruit_wiznet5k.py`'s `socket_open`/`socket_connect`/
//! `socket_listen`/`socket_available`/`socket_read`/`read_udp`/
//! `socket_write`/`socket_close`/`socket_disconnect`. Every function here
//! takes the socket number and a `&mut ChipIo<B>` rather than owning one,
//! since socket state lives entirely on the chip; `NetInterface` is what
//! actually owns a `ChipIo`.

use crate::chip::{ChipVariant, SOCK_MASK};
use crate::clock::Clock;
use crate::error::Error;
use crate::spi::{Bus, ChipIo};
use embedded_hal::delay::DelayNs;

/// Socket protocol mode, written to the socket's MR before `OPEN`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Full TCP, handled by the chip's onboard stack.
    Tcp,
    /// UDP.
    Udp,
    /// Raw Ethernet frames. Only socket 0 supports this mode.
    MacRaw,
}

impl Mode {
    const fn code(self) -> u8 {
        match self {
            Mode::Tcp => 0x21,
            Mode::Udp => 0x02,
            Mode::MacRaw => 0x04,
        }
    }
}

/// Socket status register values (`SNSR`).
pub mod status {
    /// Socket is idle and ready to be opened.
    pub const CLOSED: u8 = 0x00;
    pub const INIT: u8 = 0x13;
    pub const LISTEN: u8 = 0x14;
    pub const SYNSENT: u8 = 0x15;
    pub const SYNRECV: u8 = 0x16;
    pub const ESTABLISHED: u8 = 0x17;
    pub const FIN_WAIT: u8 = 0x18;
    pub const CLOSING: u8 = 0x1A;
    pub const TIME_WAIT: u8 = 0x1B;
    pub const CLOSE_WAIT: u8 = 0x1C;
    pub const LAST_ACK: u8 = 0x1D;
    pub const UDP: u8 = 0x22;
    pub const MACRAW: u8 = 0x42;
}

mod cmd {
    pub const OPEN: u8 = 0x01;
    pub const LISTEN: u8 = 0x02;
    pub const CONNECT: u8 = 0x04;
    pub const DISCON: u8 = 0x08;
    pub const CLOSE: u8 = 0x10;
    pub const SEND: u8 = 0x20;
    pub const RECV: u8 = 0x40;
}

mod irbit {
    pub const SEND_OK: u8 = 0x10;
    pub const TIMEOUT: u8 = 0x08;
}

/// Read socket `n`'s status register (`SNSR`).
pub fn status<B: Bus>(io: &mut ChipIo<B>, n: u8) -> Result<u8, Error> {
    check_range(io, n)?;
    io.read_socket_register(n, io.registers().snsr)
}

fn check_range<B: Bus>(io: &ChipIo<B>, n: u8) -> Result<(), Error> {
    if n < io.variant().max_sockets() {
        Ok(())
    } else {
        Err(Error::InvalidArgument)
    }
}

fn check_link<B: Bus>(io: &mut ChipIo<B>) -> Result<(), Error> {
    let link_flag = io.registers().link_flag;
    let mut buf = [0u8];
    io.read_common(link_flag, &mut buf)?;
    if buf[0] & 0x01 == 0 {
        Err(Error::LinkDown)
    } else {
        Ok(())
    }
}

/// Busy-wait until socket `n`'s command register self-clears, as every
/// command write is required to before the next command may be issued.
fn issue_command<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    n: u8,
    command: u8,
) -> Result<(), Error> {
    let sncr = io.registers().sncr;
    io.write_socket_register(n, sncr, command)?;
    loop {
        if io.read_socket_register(n, sncr)? == 0 {
            return Ok(());
        }
        delay.delay_us(1);
    }
}

/// Read a 16-bit socket register twice, retrying until two consecutive
/// reads agree. Guards against observing `RX_RSR`/`TX_FSR` mid-update.
fn read_stable16<B: Bus>(io: &mut ChipIo<B>, n: u8, offset: u16) -> Result<u16, Error> {
    let mut previous = io.read_socket_register16(n, offset)?;
    loop {
        let current = io.read_socket_register16(n, offset)?;
        if current == previous {
            return Ok(current);
        }
        previous = current;
    }
}

/// Open socket `n` in `mode`, assigning `src_port` (an ephemeral port drawn
/// by the caller's [`crate::alloc::SocketAllocator`] when `0`... callers are
/// expected to always pass a concrete, already-resolved port).
pub fn open<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    n: u8,
    mode: Mode,
    src_port: u16,
) -> Result<(), Error> {
    check_range(io, n)?;
    check_link(io)?;
    let current = status(io, n)?;
    let openable = matches!(
        current,
        status::CLOSED
            | status::TIME_WAIT
            | status::FIN_WAIT
            | status::CLOSE_WAIT
            | status::CLOSING
            | status::UDP
    );
    if !openable {
        return Err(Error::OpenFailed);
    }
    delay.delay_us(250);
    let regs = *io.registers();
    io.write_socket_register(n, regs.snmr, mode.code())?;
    io.write_socket_register(n, regs.snir, 0xFF)?;
    io.write_socket_register16(n, regs.snport, src_port)?;
    issue_command(io, delay, n, cmd::OPEN)?;
    let after = status(io, n)?;
    if matches!(after, status::INIT | status::UDP) {
        Ok(())
    } else {
        Err(Error::OpenFailed)
    }
}

/// Open socket `n` and connect it to `dest_ip:dest_port`. For TCP this
/// blocks (polling, no upper bound, mirroring the original driver) until
/// the socket reaches `ESTABLISHED`; for UDP, `open` alone already leaves
/// the socket usable and this just records the peer.
pub fn connect<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    n: u8,
    mode: Mode,
    src_port: u16,
    dest_ip: [u8; 4],
    dest_port: u16,
) -> Result<(), Error> {
    open(io, delay, n, mode, src_port)?;
    let regs = *io.registers();
    io.write_socket_register(n, regs.sndipr, dest_ip[0])?;
    io.write_socket_register(n, regs.sndipr + 1, dest_ip[1])?;
    io.write_socket_register(n, regs.sndipr + 2, dest_ip[2])?;
    io.write_socket_register(n, regs.sndipr + 3, dest_ip[3])?;
    io.write_socket_register16(n, regs.sndport, dest_port)?;
    issue_command(io, delay, n, cmd::CONNECT)?;
    if mode == Mode::Tcp {
        loop {
            let current = status(io, n)?;
            if current == status::ESTABLISHED {
                return Ok(());
            }
            if current == status::CLOSED {
                return Err(Error::ConnectFailed);
            }
            delay.delay_us(250);
        }
    }
    Ok(())
}

/// Open socket `n` bound to `src_port` and issue `LISTEN`, blocking
/// (polling, no upper bound) until the socket leaves `INIT`.
pub fn listen<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    n: u8,
    mode: Mode,
    src_port: u16,
) -> Result<(), Error> {
    open(io, delay, n, mode, src_port)?;
    issue_command(io, delay, n, cmd::LISTEN)?;
    loop {
        let current = status(io, n)?;
        if matches!(current, status::LISTEN | status::ESTABLISHED | status::UDP) {
            return Ok(());
        }
        if current == status::CLOSED {
            return Err(Error::OpenFailed);
        }
        delay.delay_us(250);
    }
}

/// Read the remote peer recorded against a listening socket that has
/// accepted a connection (status `SYNRECV`/`ESTABLISHED`).
pub fn accept_peer<B: Bus>(io: &mut ChipIo<B>, n: u8) -> Result<([u8; 4], u16), Error> {
    check_range(io, n)?;
    let regs = *io.registers();
    let mut ip = [0u8; 4];
    for (i, byte) in ip.iter_mut().enumerate() {
        *byte = io.read_socket_register(n, regs.sndipr + i as u16)?;
    }
    let port = io.read_socket_register16(n, regs.sndport)?;
    Ok((ip, port))
}

/// Issue `DISCON` without waiting for the socket to close.
pub fn disconnect<B: Bus>(io: &mut ChipIo<B>, delay: &mut impl DelayNs, n: u8) -> Result<(), Error> {
    check_range(io, n)?;
    issue_command(io, delay, n, cmd::DISCON)
}

/// Issue `CLOSE` and wait up to 5 seconds (measured via `clock`) for the
/// socket to report `CLOSED`.
pub fn close<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    clock: &mut impl Clock,
    n: u8,
) -> Result<(), Error> {
    check_range(io, n)?;
    issue_command(io, delay, n, cmd::CLOSE)?;
    let deadline = clock.now_millis() + 5_000;
    loop {
        if status(io, n)? == status::CLOSED {
            return Ok(());
        }
        if clock.now_millis() >= deadline {
            return Err(Error::CloseFailed);
        }
        delay.delay_us(250);
    }
}

/// Read up to `buf.len()` bytes of a TCP stream's received data.
///
/// Returns `Ok(0)` if nothing is currently available and the socket is
/// still open; fails with [`Error::PeerClosed`] if nothing is available
/// and the socket has moved to a half-closed or listening state.
pub fn recv<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    n: u8,
    buf: &mut [u8],
) -> Result<usize, Error> {
    check_range(io, n)?;
    let regs = *io.registers();
    let available = read_stable16(io, n, regs.snrx_rsr)?;
    let count = (available as usize).min(buf.len());
    if count == 0 {
        let current = status(io, n)?;
        return if matches!(current, status::LISTEN | status::CLOSED | status::CLOSE_WAIT) {
            Err(Error::PeerClosed)
        } else {
            Ok(0)
        };
    }
    let pointer = io.read_socket_register16(n, regs.snrx_rd)?;
    io.read_rx_buffer(n, pointer, &mut buf[..count])?;
    io.write_socket_register16(n, regs.snrx_rd, pointer.wrapping_add(count as u16))?;
    issue_command(io, delay, n, cmd::RECV)?;
    Ok(count)
}

/// Read one UDP datagram: an 8-byte chip header (peer IP, peer port,
/// payload length) followed by up to `buf.len()` bytes of payload. Any
/// payload bytes beyond `buf.len()` are drained and discarded so the ring
/// buffer does not desynchronize.
pub fn recv_udp<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    n: u8,
    buf: &mut [u8],
) -> Result<(usize, [u8; 4], u16), Error> {
    check_range(io, n)?;
    let regs = *io.registers();
    let available = read_stable16(io, n, regs.snrx_rsr)?;
    if available < 8 {
        return Ok((0, [0; 4], 0));
    }
    let mut pointer = io.read_socket_register16(n, regs.snrx_rd)?;
    let mut header = [0u8; 8];
    io.read_rx_buffer(n, pointer, &mut header)?;
    pointer = pointer.wrapping_add(8);
    // W6100's UDP receive header shuffles the field layout relative to
    // W5100S/W5500: the length is an 11-bit field at the front, and the
    // peer address/port overlap at header[6].
    let (peer_ip, peer_port, payload_len) = if io.variant() == ChipVariant::W6100 {
        let ip = [header[3], header[4], header[5], header[6]];
        let port = u16::from_be_bytes([header[6], header[7]]);
        let len = (u16::from_be_bytes([header[0], header[1]]) & 0x07FF) as usize;
        (ip, port, len)
    } else {
        let ip = [header[0], header[1], header[2], header[3]];
        let port = u16::from_be_bytes([header[4], header[5]]);
        let len = u16::from_be_bytes([header[6], header[7]]) as usize;
        (ip, port, len)
    };

    let take = payload_len.min(buf.len());
    io.read_rx_buffer(n, pointer, &mut buf[..take])?;
    pointer = pointer.wrapping_add(take as u16);

    let mut remainder = payload_len - take;
    let mut scratch = [0u8; 32];
    while remainder > 0 {
        let chunk = remainder.min(scratch.len());
        io.read_rx_buffer(n, pointer, &mut scratch[..chunk])?;
        pointer = pointer.wrapping_add(chunk as u16);
        remainder -= chunk;
    }

    io.write_socket_register16(n, regs.snrx_rd, pointer)?;
    issue_command(io, delay, n, cmd::RECV)?;
    Ok((take, peer_ip, peer_port))
}

/// Write `data` (clamped to 2 KiB, the ring buffer size) to socket `n`,
/// waiting up to `timeout_ms` (measured via `clock`) for TX buffer space.
pub fn write<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    clock: &mut impl Clock,
    n: u8,
    data: &[u8],
    timeout_ms: u64,
    mode: Mode,
) -> Result<usize, Error> {
    check_range(io, n)?;
    let len = data.len().min(crate::chip::SOCK_SIZE as usize);
    let data = &data[..len];
    let regs = *io.registers();

    let deadline = clock.now_millis() + timeout_ms;
    loop {
        let free = read_stable16(io, n, regs.sntx_fsr)?;
        if free as usize >= len {
            break;
        }
        let current = status(io, n)?;
        if !matches!(current, status::ESTABLISHED | status::CLOSE_WAIT | status::UDP) {
            return Err(Error::WriteClosed);
        }
        if clock.now_millis() >= deadline {
            return Err(Error::WriteTimeout);
        }
        delay.delay_us(250);
    }

    let pointer = io.read_socket_register16(n, regs.sntx_wr)?;
    io.write_tx_buffer(n, pointer & SOCK_MASK, data)?;
    io.write_socket_register16(n, regs.sntx_wr, pointer.wrapping_add(len as u16))?;
    issue_command(io, delay, n, cmd::SEND)?;

    let deadline = clock.now_millis() + timeout_ms;
    loop {
        let ir = io.read_socket_register(n, regs.snir)?;
        if ir & irbit::SEND_OK != 0 {
            io.write_socket_register(n, regs.snir, irbit::SEND_OK)?;
            return Ok(len);
        }
        if ir & irbit::TIMEOUT != 0 {
            io.write_socket_register(n, regs.snir, irbit::TIMEOUT)?;
            return if mode == Mode::Udp {
                Ok(0)
            } else {
                Err(Error::WriteTimeout)
            };
        }
        if clock.now_millis() >= deadline {
            return Err(Error::WriteTimeout);
        }
        delay.delay_us(250);
    }
}
