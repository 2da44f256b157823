//! Error kinds returned by every fallible operation in this crate.

/// Every failure this crate can report.
///
/// Data-less by design: this crate has no allocator, so no variant carries a
/// heap-allocated message. The bus error type of the caller's
/// `embedded_hal::spi::SpiDevice` is collapsed into [`Error::Bus`] since SPI
/// transfers are synchronous and the only thing worth reporting is that the
/// transfer failed.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The SPI transaction itself failed.
    Bus,
    /// No W5100S/W5500/W6100 was found on the bus during autodetection.
    ChipNotFound,
    /// The PHY reports no link; retry once the cable is plugged in.
    LinkDown,
    /// No hardware socket is free.
    SocketExhausted,
    /// `open()` did not reach `INIT`/`UDP` status.
    OpenFailed,
    /// `connect()` saw the socket return to `CLOSED` before `ESTABLISHED`.
    ConnectFailed,
    /// `close()` did not reach `CLOSED` within its deadline.
    CloseFailed,
    /// `write()` did not find enough free TX buffer before its deadline.
    WriteTimeout,
    /// `write()` found the socket had left `ESTABLISHED`/`CLOSE_WAIT`.
    WriteClosed,
    /// `recv()` found the peer gone while the socket was half-closed.
    PeerClosed,
    /// DHCP could not obtain or renew a lease before its deadline.
    DhcpTimeout,
    /// A DHCP response failed to parse.
    DhcpMalformed,
    /// No DNS response arrived within the retry budget.
    DnsTimeout,
    /// A DNS response failed to parse.
    DnsMalformed,
    /// A DNS response parsed but contained no usable A record.
    DnsNoAnswer,
    /// An out-of-range socket number, wrong-length address, or invalid port.
    InvalidArgument,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::Bus => "SPI bus transfer failed",
            Error::ChipNotFound => "no WIZnet chip detected",
            Error::LinkDown => "Ethernet link is down",
            Error::SocketExhausted => "no hardware socket available",
            Error::OpenFailed => "failed to open hardware socket",
            Error::ConnectFailed => "failed to establish connection",
            Error::CloseFailed => "failed to close hardware socket",
            Error::WriteTimeout => "timed out waiting for TX buffer space",
            Error::WriteClosed => "socket closed during write",
            Error::PeerClosed => "connection closed by peer",
            Error::DhcpTimeout => "DHCP lease acquisition timed out",
            Error::DhcpMalformed => "malformed DHCP response",
            Error::DnsTimeout => "DNS lookup timed out",
            Error::DnsMalformed => "malformed DNS response",
            Error::DnsNoAnswer => "DNS response contained no A record",
            Error::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
