//! Non-blocking DHCPv4 client finite state machine.
//!
//! Ported from `adafruit_wiznet5k_dhcp.py`'s `DHCP` class: the
//! `_STATE_INIT`/`_STATE_SELECTING`/`_STATE_REQUESTING`/`_STATE_BOUND`/
//! `_STATE_RENEWING`/`_STATE_REBINDING` variant (the sibling numeric
//! `STATE_DHCP_*` file in the same package is not ported — see the design
//! notes in this crate's top-level documentation for why).

use crate::alloc::SocketAllocator;
use crate::clock::Clock;
use crate::error::Error;
use crate::socket::{self, Mode};
use crate::spi::{Bus, ChipIo};
use embedded_hal::delay::DelayNs;
use heapless::String;
use rand_core::RngCore;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const BROADCAST: [u8; 4] = [255, 255, 255, 255];
const UNASSIGNED: [u8; 4] = [0, 0, 0, 0];
const OP_BOOT_REQUEST: u8 = 0x01;
const OP_BOOT_REPLY: u8 = 0x02;
const HTYPE_10MB: u8 = 0x01;
const HLEN_ETHERNET: u8 = 0x06;
const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;

mod msgtype {
    pub const DISCOVER: u8 = 1;
    pub const OFFER: u8 = 2;
    pub const REQUEST: u8 = 3;
    pub const ACK: u8 = 5;
    pub const NAK: u8 = 6;
}

mod option {
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTERS_ON_SUBNET: u8 = 3;
    pub const DNS_SERVERS: u8 = 6;
    pub const HOSTNAME: u8 = 12;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MSG_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAM_REQUEST_LIST: u8 = 55;
    pub const CLIENT_ID: u8 = 61;
    pub const END: u8 = 255;
}

/// DHCP client state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum DhcpState {
    /// No lease; about to (re)start acquisition.
    Init,
    /// DISCOVER sent, waiting for an OFFER.
    Selecting,
    /// REQUEST sent, waiting for an ACK/NAK.
    Requesting,
    /// Holding a valid lease.
    Bound,
    /// T1 elapsed; requesting lease extension from the same server.
    Renewing,
    /// T2 elapsed; requesting lease extension from any server.
    Rebinding,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Renew {
    None,
    Renew,
    Rebind,
}

/// A bound or offered IPv4 configuration.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct DhcpLease {
    /// Address assigned to this host (`yiaddr`).
    pub ip: [u8; 4],
    /// Subnet mask (option 1).
    pub subnet_mask: [u8; 4],
    /// Default gateway (option 3, first router only).
    pub gateway: [u8; 4],
    /// DNS server (option 6, first server only).
    pub dns_server: [u8; 4],
}

/// Drives the DHCPv4 FSM. Owns no hardware resources of its own: every
/// method is handed a `ChipIo`/`SocketAllocator` by the caller (normally
/// [`crate::iface::NetInterface`]), and allocates a socket for the
/// duration of each exchange.
pub struct DhcpClient {
    state: DhcpState,
    xid: u32,
    start_time: u64,
    dhcp_server_ip: [u8; 4],
    t1: u64,
    t2: u64,
    lease: u64,
    hostname: String<42>,
    renew: Renew,
    mac: [u8; 6],
    lease_info: Option<DhcpLease>,
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn write_option(buf: &mut [u8], mut p: usize, code: u8, data: &[u8]) -> Result<usize, Error> {
    if p + 2 + data.len() > buf.len() {
        return Err(Error::InvalidArgument);
    }
    buf[p] = code;
    p += 1;
    buf[p] = data.len() as u8;
    p += 1;
    buf[p..p + data.len()].copy_from_slice(data);
    Ok(p + data.len())
}

impl DhcpClient {
    /// Build a client for `mac`, deriving a hostname (`"WIZnet{mac}"` if
    /// none is supplied, truncated to the part before the first `.` and
    /// to 42 UTF-8 bytes) and drawing an initial 31-bit transaction id.
    pub fn new(mac: [u8; 6], hostname: Option<&str>, rng: &mut impl RngCore, clock: &mut impl Clock) -> Self {
        let xid = 1 + (rng.next_u32() % 0x7FFF_FFFE);
        let mut name = String::<42>::new();
        if let Some(h) = hostname {
            let short = h.split('.').next().unwrap_or(h);
            let _ = name.push_str(truncate_utf8(short, 42));
        } else {
            let mut generated: String<42> = String::new();
            let _ = generated.push_str("WIZnet-");
            for byte in &mac {
                let _ = write_hex_byte(&mut generated, *byte);
            }
            let _ = name.push_str(truncate_utf8(&generated, 42));
        }
        Self {
            state: DhcpState::Init,
            xid,
            start_time: clock.now_millis(),
            dhcp_server_ip: BROADCAST,
            t1: 0,
            t2: 0,
            lease: 0,
            hostname: name,
            renew: Renew::None,
            mac,
            lease_info: None,
        }
    }

    /// The FSM's current state.
    pub fn state(&self) -> DhcpState {
        self.state
    }

    /// The currently bound lease, if any.
    pub fn lease(&self) -> Option<DhcpLease> {
        self.lease_info
    }

    /// Block until a lease is acquired, retrying internally. Propagates
    /// [`Error::DhcpTimeout`] if the fourth DISCOVER/REQUEST attempt at
    /// any stage gets no response.
    pub fn request_lease<B: Bus>(
        &mut self,
        io: &mut ChipIo<B>,
        alloc: &mut SocketAllocator,
        delay: &mut impl DelayNs,
        clock: &mut impl Clock,
        rng: &mut impl RngCore,
    ) -> Result<DhcpLease, Error> {
        loop {
            self.step(io, alloc, delay, clock, rng, true)?;
            if self.state == DhcpState::Bound {
                return Ok(self.lease_info.unwrap_or_default());
            }
        }
    }

    /// Advance the FSM by one tick: check lease timers if `Bound`, or
    /// make one non-blocking (or blocking, if `blocking`) attempt to
    /// progress an in-flight exchange. Returns the lease if this call
    /// just (re)bound it.
    pub fn maintain<B: Bus>(
        &mut self,
        io: &mut ChipIo<B>,
        alloc: &mut SocketAllocator,
        delay: &mut impl DelayNs,
        clock: &mut impl Clock,
        rng: &mut impl RngCore,
        blocking: bool,
    ) -> Result<Option<DhcpLease>, Error> {
        let was_bound = self.state == DhcpState::Bound;
        self.step(io, alloc, delay, clock, rng, blocking)?;
        if self.state == DhcpState::Bound && !was_bound {
            Ok(self.lease_info)
        } else {
            Ok(None)
        }
    }

    /// The PHY link has dropped; abandon any in-flight exchange and
    /// return to `Init` with a zeroed lease. The next `maintain` call
    /// restarts acquisition once the link is back up.
    pub fn notify_link_down(&mut self) {
        self.state = DhcpState::Init;
        self.dhcp_server_ip = BROADCAST;
        self.lease_info = None;
        self.renew = Renew::None;
    }

    fn step<B: Bus>(
        &mut self,
        io: &mut ChipIo<B>,
        alloc: &mut SocketAllocator,
        delay: &mut impl DelayNs,
        clock: &mut impl Clock,
        rng: &mut impl RngCore,
        blocking: bool,
    ) -> Result<(), Error> {
        match self.state {
            DhcpState::Bound => {
                let now = clock.now_millis();
                if now >= self.lease {
                    self.state = DhcpState::Init;
                } else if now >= self.t2 {
                    self.state = DhcpState::Rebinding;
                } else if now >= self.t1 {
                    self.state = DhcpState::Renewing;
                }
            }
            DhcpState::Renewing => {
                self.renew = Renew::Renew;
                self.start_time = clock.now_millis();
                self.state = DhcpState::Requesting;
            }
            DhcpState::Rebinding => {
                self.renew = Renew::Rebind;
                self.dhcp_server_ip = BROADCAST;
                self.start_time = clock.now_millis();
                self.state = DhcpState::Requesting;
            }
            DhcpState::Init => {
                self.dhcp_server_ip = BROADCAST;
                self.lease_info = None;
                self.xid = self.xid.wrapping_add(1) & 0x7FFF_FFFF;
                self.start_time = clock.now_millis();
                self.state = DhcpState::Selecting;
            }
            DhcpState::Selecting | DhcpState::Requesting => {
                let msg_type = self.handle_dhcp_message(io, alloc, delay, clock, rng, blocking)?;
                if let Some(mt) = msg_type {
                    self.process_messaging_states(mt);
                }
                if self.renew != Renew::None && self.state != DhcpState::Bound {
                    self.state = DhcpState::Bound;
                    self.renew = Renew::None;
                }
            }
        }
        Ok(())
    }

    fn process_messaging_states(&mut self, message_type: u8) {
        match (self.state, message_type) {
            (DhcpState::Selecting, msgtype::OFFER) => self.state = DhcpState::Requesting,
            (DhcpState::Requesting, msgtype::NAK) => self.state = DhcpState::Init,
            (DhcpState::Requesting, msgtype::ACK) => {
                self.state = DhcpState::Bound;
                self.renew = Renew::None;
            }
            _ => {}
        }
    }

    fn handle_dhcp_message<B: Bus>(
        &mut self,
        io: &mut ChipIo<B>,
        alloc: &mut SocketAllocator,
        delay: &mut impl DelayNs,
        clock: &mut impl Clock,
        rng: &mut impl RngCore,
        blocking: bool,
    ) -> Result<Option<u8>, Error> {
        let message_type = if self.state == DhcpState::Selecting {
            msgtype::DISCOVER
        } else {
            msgtype::REQUEST
        };
        let unicast = self.renew == Renew::Renew;
        let dest_ip = if unicast { self.dhcp_server_ip } else { BROADCAST };

        let sock = alloc.get_socket(false, |n| {
            socket::status(io, n)
                .map(|s| s == socket::status::CLOSED)
                .unwrap_or(false)
        })?;

        let result =
            self.exchange(io, delay, clock, rng, sock, message_type, dest_ip, !unicast, blocking);
        let _ = alloc.release_socket(sock);
        let _ = socket::close(io, delay, clock, sock);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn exchange<B: Bus>(
        &mut self,
        io: &mut ChipIo<B>,
        delay: &mut impl DelayNs,
        clock: &mut impl Clock,
        rng: &mut impl RngCore,
        sock: u8,
        message_type: u8,
        dest_ip: [u8; 4],
        broadcast: bool,
        blocking: bool,
    ) -> Result<Option<u8>, Error> {
        socket::connect(io, delay, sock, Mode::Udp, CLIENT_PORT, dest_ip, SERVER_PORT)?;
        let mut buf = [0u8; 512];

        // A blocking acquire (the initial DISCOVER/REQUEST exchange driven by
        // `request_lease`) polls for the whole backoff window before
        // retransmitting. Anything else -- a non-blocking `maintain` tick, or
        // a renew/rebind attempt, which only ever gets one try per call --
        // must send at most once and return promptly, per the cooperative
        // scheduling model: it may not stall the caller's event loop waiting
        // out a multi-second backoff.
        let poll_until_backoff = blocking && self.renew == Renew::None;

        for attempt in 0..4u32 {
            let len = self.generate_message(message_type, broadcast, clock, &mut buf)?;
            socket::write(io, delay, clock, sock, &buf[..len], 1_000, Mode::Udp)?;

            if poll_until_backoff {
                let jitter = (rng.next_u32() % 3) as i64 - 1;
                let backoff_s = (1u64 << attempt) * 4;
                let next_resend =
                    clock.now_millis() + backoff_s * 1000 + (jitter * 1000).max(-999) as u64;

                loop {
                    let (count, _peer_ip, _peer_port) = socket::recv_udp(io, delay, sock, &mut buf)?;
                    if count > 236 {
                        if let Ok(mt) = self.parse_response(&buf[..count], clock) {
                            return Ok(Some(mt));
                        }
                    }
                    if clock.now_millis() >= next_resend {
                        break;
                    }
                    delay.delay_ms(1);
                }
            } else {
                let (count, _peer_ip, _peer_port) = socket::recv_udp(io, delay, sock, &mut buf)?;
                if count > 236 {
                    if let Ok(mt) = self.parse_response(&buf[..count], clock) {
                        return Ok(Some(mt));
                    }
                }
                return Ok(None);
            }
        }
        Err(Error::DhcpTimeout)
    }

    fn generate_message(
        &self,
        message_type: u8,
        broadcast: bool,
        clock: &mut impl Clock,
        buf: &mut [u8; 512],
    ) -> Result<usize, Error> {
        for b in buf.iter_mut() {
            *b = 0;
        }
        buf[0] = OP_BOOT_REQUEST;
        buf[1] = HTYPE_10MB;
        buf[2] = HLEN_ETHERNET;
        buf[3] = 0x00;
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        let secs = (clock.now_millis().saturating_sub(self.start_time) / 1000) as u16;
        buf[8..10].copy_from_slice(&secs.to_be_bytes());
        buf[10] = if broadcast { 0x80 } else { 0x00 };
        if self.renew == Renew::Renew {
            if let Some(lease) = self.lease_info {
                buf[12..16].copy_from_slice(&lease.ip);
            }
        }
        buf[28..34].copy_from_slice(&self.mac);
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);

        let mut p = 240usize;
        p = write_option(buf, p, option::MSG_TYPE, &[message_type])?;
        p = write_option(buf, p, option::HOSTNAME, self.hostname.as_bytes())?;
        let mut client_id = [0u8; 7];
        client_id[0] = 0x01;
        client_id[1..].copy_from_slice(&self.mac);
        p = write_option(buf, p, option::CLIENT_ID, &client_id)?;
        p = write_option(
            buf,
            p,
            option::PARAM_REQUEST_LIST,
            &[option::SUBNET_MASK, option::ROUTERS_ON_SUBNET, option::DNS_SERVERS],
        )?;
        // Request a 90-day lease; the server is free to offer less.
        p = write_option(buf, p, option::LEASE_TIME, &7_776_000u32.to_be_bytes())?;
        if message_type == msgtype::REQUEST {
            if let Some(lease) = self.lease_info {
                p = write_option(buf, p, option::REQUESTED_IP, &lease.ip)?;
            }
            if self.renew != Renew::Rebind {
                p = write_option(buf, p, option::SERVER_ID, &self.dhcp_server_ip)?;
            }
        }
        if p >= buf.len() {
            return Err(Error::InvalidArgument);
        }
        buf[p] = option::END;
        Ok(p + 1)
    }

    fn parse_response(&mut self, response: &[u8], clock: &mut impl Clock) -> Result<u8, Error> {
        if response.len() < 240 {
            return Err(Error::DhcpMalformed);
        }
        if response[0] != OP_BOOT_REPLY {
            return Err(Error::DhcpMalformed);
        }
        if response[4..8] != self.xid.to_be_bytes() {
            return Err(Error::DhcpMalformed);
        }
        if response[28..34] == [0u8; 6] {
            return Err(Error::DhcpMalformed);
        }
        if response[236..240] != MAGIC_COOKIE {
            return Err(Error::DhcpMalformed);
        }

        let mut lease = DhcpLease {
            ip: [response[16], response[17], response[18], response[19]],
            subnet_mask: UNASSIGNED,
            gateway: UNASSIGNED,
            dns_server: UNASSIGNED,
        };
        let mut msg_type = None;
        let mut lease_secs: u32 = 900;
        let mut t1_secs = None;
        let mut t2_secs = None;
        let mut server_id = self.dhcp_server_ip;

        let mut p = 240usize;
        loop {
            let code = *response.get(p).ok_or(Error::DhcpMalformed)?;
            if code == option::END {
                break;
            }
            p += 1;
            let len = *response.get(p).ok_or(Error::DhcpMalformed)? as usize;
            p += 1;
            let data = response.get(p..p + len).ok_or(Error::DhcpMalformed)?;
            match code {
                option::MSG_TYPE => msg_type = data.first().copied(),
                option::SUBNET_MASK if len == 4 => lease.subnet_mask.copy_from_slice(data),
                option::ROUTERS_ON_SUBNET if len >= 4 => lease.gateway.copy_from_slice(&data[..4]),
                option::DNS_SERVERS if len >= 4 => lease.dns_server.copy_from_slice(&data[..4]),
                option::SERVER_ID if len == 4 => server_id.copy_from_slice(data),
                option::LEASE_TIME if len == 4 => {
                    lease_secs = u32::from_be_bytes(data.try_into().unwrap());
                }
                58 if len == 4 => t1_secs = Some(u32::from_be_bytes(data.try_into().unwrap())),
                59 if len == 4 => t2_secs = Some(u32::from_be_bytes(data.try_into().unwrap())),
                _ => {}
            }
            p += len;
        }
        let msg_type = msg_type.ok_or(Error::DhcpMalformed)?;

        if msg_type == msgtype::ACK {
            let now = clock.now_millis();
            let lease_ms = lease_secs as u64 * 1000;
            let t1_ms = t1_secs.map(|v| v as u64 * 1000).unwrap_or(lease_ms / 2);
            let t2_ms = t2_secs
                .map(|v| v as u64 * 1000)
                .unwrap_or(lease_ms - lease_ms / 8);
            self.t1 = now + t1_ms;
            self.t2 = now + t2_ms;
            self.lease = now + lease_ms;
            self.dhcp_server_ip = server_id;
            self.lease_info = Some(lease);
        }
        Ok(msg_type)
    }
}

fn write_hex_byte(s: &mut String<42>, byte: u8) -> Result<(), ()> {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    s.push(DIGITS[(byte >> 4) as usize] as char).map_err(|_| ())?;
    s.push(DIGITS[(byte & 0xF) as usize] as char).map_err(|_| ())
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use rand_core::impls;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FakeClock(Rc<RefCell<u64>>);
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

    fn test_clock() -> (FakeClock, Rc<RefCell<u64>>) {
        let millis = Rc::new(RefCell::new(0u64));
        (FakeClock(millis.clone()), millis)
    }

    #[test]
    fn hostname_defaults_when_none_supplied() {
        let (mut clock, _) = test_clock();
        let mut rng = FixedRng(7);
        let client = DhcpClient::new([2, 0, 0, 0, 0, 1], None, &mut rng, &mut clock);
        assert!(client.hostname.starts_with("WIZnet-"));
    }

    #[test]
    fn hostname_truncates_to_first_label() {
        let (mut clock, _) = test_clock();
        let mut rng = FixedRng(7);
        let client = DhcpClient::new([0; 6], Some("myhost.lan"), &mut rng, &mut clock);
        assert_eq!(client.hostname.as_str(), "myhost");
    }

    #[test]
    fn message_has_bootp_header_and_magic_cookie() {
        let (mut clock, _) = test_clock();
        let mut rng = FixedRng(1);
        let client = DhcpClient::new([0xAA; 6], Some("h"), &mut rng, &mut clock);
        let mut buf = [0u8; 512];
        let len = client
            .generate_message(msgtype::DISCOVER, true, &mut clock, &mut buf)
            .unwrap();
        assert_eq!(buf[0], OP_BOOT_REQUEST);
        assert_eq!(buf[1], HTYPE_10MB);
        assert_eq!(buf[2], HLEN_ETHERNET);
        assert_eq!(&buf[4..8], &client.xid.to_be_bytes());
        assert_eq!(buf[10], 0x80);
        assert_eq!(&buf[28..34], &[0xAAu8; 6]);
        assert_eq!(&buf[236..240], &MAGIC_COOKIE);
        assert_eq!(buf[len - 1], option::END);
    }

    #[test]
    fn ack_without_t1_t2_derives_them_from_lease() {
        let (mut clock, millis) = test_clock();
        *millis.borrow_mut() = 1_000;
        let mut rng = FixedRng(1);
        let mut client = DhcpClient::new([0; 6], Some("h"), &mut rng, &mut clock);

        let mut response = [0u8; 300];
        response[0] = OP_BOOT_REPLY;
        response[4..8].copy_from_slice(&client.xid.to_be_bytes());
        response[28..34].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        response[16..20].copy_from_slice(&[192, 168, 1, 50]);
        response[236..240].copy_from_slice(&MAGIC_COOKIE);
        let mut p = 240;
        p = write_option(&mut response, p, option::MSG_TYPE, &[msgtype::ACK]).unwrap();
        p = write_option(&mut response, p, option::LEASE_TIME, &900u32.to_be_bytes()).unwrap();
        response[p] = option::END;

        let msg_type = client.parse_response(&response, &mut clock).unwrap();
        assert_eq!(msg_type, msgtype::ACK);
        assert_eq!(client.t1, 1_000 + 450_000);
        assert_eq!(client.t2, 1_000 + (900_000 - 112_500));
        assert_eq!(client.lease, 1_000 + 900_000);
        assert_eq!(client.lease_info.unwrap().ip, [192, 168, 1, 50]);
    }

    #[test]
    fn malformed_response_is_rejected_without_panicking() {
        let (mut clock, _) = test_clock();
        let mut rng = FixedRng(1);
        let mut client = DhcpClient::new([0; 6], Some("h"), &mut rng, &mut clock);
        let short = [0u8; 10];
        assert_eq!(
            client.parse_response(&short, &mut clock),
            Err(Error::DhcpMalformed)
        );
    }

    #[test]
    fn link_down_resets_to_init_with_broadcast_server() {
        let (mut clock, _) = test_clock();
        let mut rng = FixedRng(1);
        let mut client = DhcpClient::new([0; 6], Some("h"), &mut rng, &mut clock);
        client.state = DhcpState::Bound;
        client.dhcp_server_ip = [10, 0, 0, 1];
        client.notify_link_down();
        assert_eq!(client.state(), DhcpState::Init);
        assert_eq!(client.dhcp_server_ip, BROADCAST);
        assert!(client.lease().is_none());
    }
}
