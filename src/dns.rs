//! DNS A-record resolution (RFC 1035 subset) over a UDP hardware socket.
//!
//! Ported from `adafruit_wiznet5k_dns.py`'s `_build_dns_query`,
//! `_parse_dns_response`, and `DNS.gethostbyname`.

use crate::clock::Clock;
use crate::error::Error;
use crate::socket::{self, Mode};
use crate::spi::{Bus, ChipIo};
use embedded_hal::delay::DelayNs;
use rand_core::RngCore;

const DNS_PORT: u16 = 53;

/// Encode a standard-query A-record lookup for `hostname` into `buf`,
/// returning the number of bytes written.
pub fn build_query(query_id: u16, hostname: &str, buf: &mut [u8]) -> Result<usize, Error> {
    if buf.len() < 12 {
        return Err(Error::InvalidArgument);
    }
    buf[0] = (query_id >> 8) as u8;
    buf[1] = query_id as u8;
    buf[2] = 0x01; // flags: recursion desired.
    buf[3] = 0x00;
    buf[4] = 0x00;
    buf[5] = 0x01; // QDCOUNT = 1.
    for b in &mut buf[6..12] {
        *b = 0x00; // ANCOUNT, NSCOUNT, ARCOUNT = 0.
    }

    let mut p = 12usize;
    for label in hostname.split('.') {
        let len = label.len();
        if len == 0 || len > 63 {
            return Err(Error::InvalidArgument);
        }
        let end = p.checked_add(1 + len).ok_or(Error::InvalidArgument)?;
        if end > buf.len() {
            return Err(Error::InvalidArgument);
        }
        buf[p] = len as u8;
        buf[p + 1..end].copy_from_slice(label.as_bytes());
        p = end;
    }
    if p + 5 > buf.len() {
        return Err(Error::InvalidArgument);
    }
    buf[p] = 0x00; // root label.
    buf[p + 1] = 0x00;
    buf[p + 2] = 0x01; // QTYPE = A.
    buf[p + 3] = 0x00;
    buf[p + 4] = 0x01; // QCLASS = IN.
    Ok(p + 5)
}

fn skip_name(response: &[u8], mut pointer: usize) -> Result<usize, Error> {
    loop {
        let byte = *response.get(pointer).ok_or(Error::DnsMalformed)?;
        if byte & 0xC0 == 0xC0 {
            return pointer.checked_add(2).ok_or(Error::DnsMalformed);
        }
        if byte == 0 {
            return Ok(pointer + 1);
        }
        pointer = pointer
            .checked_add(1 + byte as usize)
            .ok_or(Error::DnsMalformed)?;
    }
}

fn u16_at(response: &[u8], offset: usize) -> Result<u16, Error> {
    let hi = *response.get(offset).ok_or(Error::DnsMalformed)?;
    let lo = *response.get(offset + 1).ok_or(Error::DnsMalformed)?;
    Ok(u16::from_be_bytes([hi, lo]))
}

/// Parse a DNS response, returning the first type-A, class-IN answer's
/// 4-byte address.
pub fn parse_response(response: &[u8], query_id: u16, query_length: usize) -> Result<[u8; 4], Error> {
    if response.len() < 12 {
        return Err(Error::DnsMalformed);
    }
    if u16_at(response, 0)? != query_id {
        return Err(Error::DnsMalformed);
    }
    let flags = u16_at(response, 2)?;
    if flags & 0xF87F != 0x8000 {
        return Err(Error::DnsMalformed);
    }
    let qdcount = u16_at(response, 4)?;
    let ancount = u16_at(response, 6)?;
    if qdcount != 1 || ancount < 1 {
        return Err(Error::DnsMalformed);
    }

    let mut pointer = query_length;
    for _ in 0..ancount {
        pointer = skip_name(response, pointer)?;
        let rtype = u16_at(response, pointer)?;
        let rclass = u16_at(response, pointer + 2)?;
        let rdlength = u16_at(response, pointer + 8)? as usize;
        if rtype == 0x0001 && rclass == 0x0001 {
            if rdlength != 4 {
                return Err(Error::DnsMalformed);
            }
            let start = pointer + 10;
            let rdata = response
                .get(start..start + 4)
                .ok_or(Error::DnsMalformed)?;
            return Ok([rdata[0], rdata[1], rdata[2], rdata[3]]);
        }
        pointer = pointer
            .checked_add(10 + rdlength)
            .ok_or(Error::DnsMalformed)?;
    }
    Err(Error::DnsNoAnswer)
}

/// Resolve `hostname` to an IPv4 address by querying `dns_server` over
/// hardware socket `sock`. The socket must already be reserved (but not
/// yet opened) by the caller; `resolve` opens, uses, and closes it before
/// returning, matching `gethostbyname`'s `try`/`finally` shape.
#[allow(clippy::too_many_arguments)]
pub fn resolve<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    clock: &mut impl Clock,
    rng: &mut impl RngCore,
    sock: u8,
    dns_server: [u8; 4],
    hostname: &str,
) -> Result<[u8; 4], Error> {
    let query_id = (rng.next_u32() & 0xFFFF) as u16;
    let src_port = 49152 + (rng.next_u32() % (65536 - 49152)) as u16;
    let mut buf = [0u8; 512];
    let query_length = build_query(query_id, hostname, &mut buf)?;

    let result = resolve_inner(
        io,
        delay,
        clock,
        sock,
        src_port,
        dns_server,
        &mut buf,
        query_id,
        query_length,
    );
    let _ = socket::close(io, delay, clock, sock);
    result
}

#[allow(clippy::too_many_arguments)]
fn resolve_inner<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    clock: &mut impl Clock,
    sock: u8,
    src_port: u16,
    dns_server: [u8; 4],
    buf: &mut [u8; 512],
    query_id: u16,
    query_length: usize,
) -> Result<[u8; 4], Error> {
    socket::connect(
        io,
        delay,
        sock,
        Mode::Udp,
        src_port,
        dns_server,
        DNS_PORT,
    )?;
    socket::write(io, delay, clock, sock, &buf[..query_length], 5_000, Mode::Udp)?;

    let mut last_err = Error::DnsTimeout;
    for _attempt in 0..5 {
        let deadline = clock.now_millis() + 5_000;
        loop {
            let (count, peer_ip, peer_port) = socket::recv_udp(io, delay, sock, buf)?;
            if count > 0 && peer_ip == dns_server && peer_port == DNS_PORT {
                match parse_response(&buf[..count], query_id, query_length) {
                    Ok(addr) => return Ok(addr),
                    Err(e) => {
                        last_err = e;
                        break;
                    }
                }
            }
            if clock.now_millis() >= deadline {
                break;
            }
            delay.delay_ms(1);
        }
    }
    Err(last_err)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn query_encodes_labels_and_trailer() {
        let mut buf = [0u8; 64];
        let len = build_query(0x1234, "a.b", &mut buf).unwrap();
        assert_eq!(&buf[0..2], &[0x12, 0x34]);
        assert_eq!(&buf[2..4], &[0x01, 0x00]);
        assert_eq!(&buf[4..6], &[0x00, 0x01]);
        // "a" label, "b" label, root, QTYPE, QCLASS.
        assert_eq!(&buf[12..14], &[1, b'a']);
        assert_eq!(&buf[14..16], &[1, b'b']);
        assert_eq!(buf[16], 0x00);
        assert_eq!(&buf[17..19], &[0x00, 0x01]);
        assert_eq!(&buf[19..21], &[0x00, 0x01]);
        assert_eq!(len, 21);
    }

    #[test]
    fn parses_a_record_answer() {
        let mut buf = [0u8; 64];
        let query_length = build_query(0xBEEF, "a.b", &mut buf).unwrap();
        let mut response = [0u8; 64];
        response[..query_length].copy_from_slice(&buf[..query_length]);
        response[0] = 0xBE;
        response[1] = 0xEF;
        response[2] = 0x81; // QR=1, RD=1.
        response[3] = 0x80; // RA=1.
        response[4] = 0x00;
        response[5] = 0x01; // QDCOUNT=1.
        response[6] = 0x00;
        response[7] = 0x01; // ANCOUNT=1.

        let mut p = query_length;
        response[p] = 0xC0; // name compression pointer back to the question.
        response[p + 1] = 0x0C;
        p += 2;
        response[p] = 0x00;
        response[p + 1] = 0x01; // TYPE=A.
        response[p + 2] = 0x00;
        response[p + 3] = 0x01; // CLASS=IN.
        response[p + 4..p + 8].copy_from_slice(&[0, 0, 1, 0]); // TTL.
        response[p + 8] = 0x00;
        response[p + 9] = 0x04; // RDLENGTH=4.
        response[p + 10..p + 14].copy_from_slice(&[93, 184, 216, 34]);

        let addr = parse_response(&response, 0xBEEF, query_length).unwrap();
        assert_eq!(addr, [93, 184, 216, 34]);
    }

    #[test]
    fn wrong_query_id_is_malformed() {
        let mut buf = [0u8; 64];
        let len = build_query(1, "a", &mut buf).unwrap();
        assert_eq!(parse_response(&buf[..len], 2, len), Err(Error::DnsMalformed));
    }

    #[test]
    fn truncated_response_is_malformed_not_a_panic() {
        let short = [0u8; 4];
        assert_eq!(parse_response(&short, 0, 0), Err(Error::DnsMalformed));
    }
}
