//! Variant-aware SPI framing: register and socket-buffer read/write.
//!
//! Ported from `adafruit_wiznet5k.py`'s `_read`/`_write`/`_chip_read`/
//! `_chip_write`/`_chip_socket_read`/`_chip_socket_write`/
//! `_read_socket_register`/`_write_socket_register`.

use crate::chip::{ChipVariant, RegisterMap, SOCK_MASK, SOCK_SIZE};
use crate::error::Error;
use embedded_hal::spi::Operation;

/// Control-byte read bit for W5500/W6100 common-register access.
const COMMON_READ: u8 = 0x00;
/// Control-byte write bit for W5500/W6100 common-register access.
const COMMON_WRITE: u8 = 0x04;
/// W5100S opcode for a register read.
const W5100S_READ_OPCODE: u8 = 0x0F;
/// W5100S opcode for a register write.
const W5100S_WRITE_OPCODE: u8 = 0xF0;

/// A one-transaction SPI primitive: write a header, then either read or
/// write a data phase, with chip-select asserted for the whole exchange.
///
/// Exists (rather than driving `embedded_hal::spi::SpiDevice` directly
/// everywhere) so that tests can mock a plain, `mockall`-friendly trait
/// instead of `SpiDevice`'s lifetime-generic `Operation` type. Any
/// `embedded_hal::spi::SpiDevice` implements it for free via the blanket
/// impl below.
pub trait Bus {
    /// The underlying transfer failure type.
    type Error;

    /// Write `header`, then read into `buf`, as a single bus transaction.
    fn write_then_read(&mut self, header: &[u8], buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Write `header`, then write `data`, as a single bus transaction.
    fn write_then_write(&mut self, header: &[u8], data: &[u8]) -> Result<(), Self::Error>;
}

impl<T: embedded_hal::spi::SpiDevice> Bus for T {
    type Error = T::Error;

    fn write_then_read(&mut self, header: &[u8], buf: &mut [u8]) -> Result<(), Self::Error> {
        self.transaction(&mut [Operation::Write(header), Operation::Read(buf)])
    }

    fn write_then_write(&mut self, header: &[u8], data: &[u8]) -> Result<(), Self::Error> {
        self.transaction(&mut [Operation::Write(header), Operation::Write(data)])
    }
}

/// Variant-aware register and buffer access over a [`Bus`].
pub struct ChipIo<B> {
    bus: B,
    variant: ChipVariant,
    regs: RegisterMap,
    /// W5100S's per-channel base address, 0 before `_setup_sockets`
    /// equivalent runs, 0x0400 after (see `ChipInit`).
    ch_base_msb: u16,
}

impl<B: Bus> ChipIo<B> {
    /// Wrap a bus for the given (already-detected) chip variant.
    pub fn new(bus: B, variant: ChipVariant) -> Self {
        Self {
            bus,
            variant,
            regs: variant.registers(),
            ch_base_msb: 0,
        }
    }

    /// The chip variant this instance was constructed for.
    pub fn variant(&self) -> ChipVariant {
        self.variant
    }

    /// Unwrap the underlying bus, discarding the variant tag.
    ///
    /// Used during autodetection to re-tag the same bus handle as a
    /// different candidate variant between probes.
    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Register address table for the current variant.
    pub fn registers(&self) -> &RegisterMap {
        &self.regs
    }

    /// Set W5100S's linear channel base address (0x0400 once sockets are
    /// set up; left at 0 for W5500/W6100, which don't use this scheme).
    pub fn set_channel_base(&mut self, base: u16) {
        self.ch_base_msb = base;
    }

    fn header(&self, address: u16, control: u8, opcode: u8) -> [u8; 3] {
        if self.variant.is_linear_addressed() {
            [opcode, (address >> 8) as u8, address as u8]
        } else {
            [(address >> 8) as u8, address as u8, control]
        }
    }

    /// Read `buf.len()` bytes from a common register at `address`.
    pub fn read_common(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        let header = self.header(address, COMMON_READ, W5100S_READ_OPCODE);
        self.bus
            .write_then_read(&header, buf)
            .map_err(|_| Error::Bus)
    }

    /// Write `data` to a common register at `address`.
    pub fn write_common(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        let header = self.header(address, COMMON_WRITE, W5100S_WRITE_OPCODE);
        self.bus
            .write_then_write(&header, data)
            .map_err(|_| Error::Bus)
    }

    /// The per-socket SPI address for a register at `offset` within socket
    /// `sock`'s register block, and the control byte selecting that block
    /// (only meaningful for W5500/W6100).
    fn socket_register_address(&self, sock: u8, offset: u16) -> (u16, u8) {
        if self.variant.is_linear_addressed() {
            (self.ch_base_msb + sock as u16 * 0x0100 + offset, 0)
        } else {
            (offset, 0)
        }
    }

    /// Read one byte from socket `sock`'s register at `offset`.
    pub fn read_socket_register(&mut self, sock: u8, offset: u16) -> Result<u8, Error> {
        let (address, _) = self.socket_register_address(sock, offset);
        let control = ((sock as u16) << 5) as u8 | 0x08;
        let header = self.header(address, control, W5100S_READ_OPCODE);
        let mut buf = [0u8; 1];
        self.bus
            .write_then_read(&header, &mut buf)
            .map_err(|_| Error::Bus)?;
        Ok(buf[0])
    }

    /// Write one byte to socket `sock`'s register at `offset`.
    pub fn write_socket_register(&mut self, sock: u8, offset: u16, value: u8) -> Result<(), Error> {
        let (address, _) = self.socket_register_address(sock, offset);
        let control = ((sock as u16) << 5) as u8 | 0x0C;
        let header = self.header(address, control, W5100S_WRITE_OPCODE);
        self.bus
            .write_then_write(&header, &[value])
            .map_err(|_| Error::Bus)
    }

    /// Read a big-endian 16-bit socket register (two adjacent byte reads).
    pub fn read_socket_register16(&mut self, sock: u8, offset: u16) -> Result<u16, Error> {
        let hi = self.read_socket_register(sock, offset)?;
        let lo = self.read_socket_register(sock, offset + 1)?;
        Ok(((hi as u16) << 8) | lo as u16)
    }

    /// Write a big-endian 16-bit socket register (two adjacent byte writes).
    pub fn write_socket_register16(&mut self, sock: u8, offset: u16, value: u16) -> Result<(), Error> {
        self.write_socket_register(sock, offset, (value >> 8) as u8)?;
        self.write_socket_register(sock, offset + 1, value as u8)
    }

    /// Write `data` into socket `sock`'s TX buffer starting at ring offset
    /// `offset` (already reduced modulo the buffer size by the caller),
    /// splitting the write in two if it wraps (W5100S only; W5500/W6100
    /// buffers are accessed through a per-socket block-select address space
    /// that the chip wraps internally).
    pub fn write_tx_buffer(&mut self, sock: u8, offset: u16, data: &[u8]) -> Result<(), Error> {
        if self.variant.is_linear_addressed() {
            let base = sock as u16 * SOCK_SIZE + 0x4000;
            if offset as u32 + data.len() as u32 > SOCK_SIZE as u32 {
                let split = (SOCK_SIZE - offset) as usize;
                self.write_common(base + offset, &data[..split])?;
                self.write_common(base, &data[split..])
            } else {
                self.write_common(base + offset, data)
            }
        } else {
            let address = offset + sock as u16 * SOCK_SIZE + 0x8000;
            let control = ((sock as u16) << 5) as u8 | 0x14;
            let header = self.header(address, control, W5100S_WRITE_OPCODE);
            self.bus
                .write_then_write(&header, data)
                .map_err(|_| Error::Bus)
        }
    }

    /// Read `buf.len()` bytes from socket `sock`'s RX buffer starting at
    /// ring pointer `pointer` (the raw, un-masked RX_RD value), splitting
    /// the read in two if it wraps (W5100S only).
    pub fn read_rx_buffer(&mut self, sock: u8, pointer: u16, buf: &mut [u8]) -> Result<(), Error> {
        if self.variant.is_linear_addressed() {
            let offset = pointer & SOCK_MASK;
            let base = sock as u16 * SOCK_SIZE + 0x6000;
            if offset as u32 + buf.len() as u32 > SOCK_SIZE as u32 {
                let split = (SOCK_SIZE - offset) as usize;
                let (first, second) = buf.split_at_mut(split);
                self.read_common(base + offset, first)?;
                self.read_common(base, second)
            } else {
                self.read_common(base + offset, buf)
            }
        } else {
            let control = ((sock as u16) << 5) as u8 | 0x18;
            let header = self.header(pointer, control, W5100S_READ_OPCODE);
            self.bus
                .write_then_read(&header, buf)
                .map_err(|_| Error::Bus)
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Bus {}
        impl Bus for Bus {
            type Error = ();
            fn write_then_read(&mut self, header: &[u8], buf: &mut [u8]) -> Result<(), ()>;
            fn write_then_write(&mut self, header: &[u8], data: &[u8]) -> Result<(), ()>;
        }
    }

    #[test]
    fn w5500_common_read_frames_address_and_control() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read()
            .withf(|header, buf| header == [0x00, 0x39, 0x00] && buf.len() == 1)
            .returning(|_, buf| {
                buf[0] = 0x04;
                Ok(())
            });
        let mut io = ChipIo::new(bus, ChipVariant::W5500);
        let mut buf = [0u8];
        io.read_common(io.registers().versionr, &mut buf).unwrap();
        assert_eq!(buf[0], 0x04);
    }

    #[test]
    fn w5100s_common_read_uses_opcode_framing() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read()
            .withf(|header, _| header == [0x0F, 0x00, 0x80])
            .returning(|_, buf| {
                buf[0] = 0x51;
                Ok(())
            });
        let mut io = ChipIo::new(bus, ChipVariant::W5100S);
        let mut buf = [0u8];
        io.read_common(io.registers().versionr, &mut buf).unwrap();
        assert_eq!(buf[0], 0x51);
    }

    #[test]
    fn w5500_socket_register_control_byte_encodes_socket_number() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read()
            .withf(|header, _| header[2] == ((3u8 << 5) | 0x08))
            .returning(|_, buf| {
                buf[0] = 0x17;
                Ok(())
            });
        let mut io = ChipIo::new(bus, ChipVariant::W5500);
        let status = io.read_socket_register(3, io.registers().snsr).unwrap();
        assert_eq!(status, 0x17);
    }

    #[test]
    fn w5100s_socket_register_address_is_linear() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read()
            .withf(|header, _| header == [0x0F, 0x04, 0x03])
            .returning(|_, buf| {
                buf[0] = 0x00;
                Ok(())
            });
        let mut io = ChipIo::new(bus, ChipVariant::W5100S);
        io.set_channel_base(0x0400);
        io.read_socket_register(0, io.registers().snsr).unwrap();
    }

    #[test]
    fn w5100s_tx_buffer_write_splits_on_wrap() {
        let mut bus = MockBus::new();
        bus.expect_write_then_write()
            .withf(|header, data| header == [0xF0, 0x47, 0xFE] && data == [1, 2])
            .returning(|_, _| Ok(()));
        bus.expect_write_then_write()
            .withf(|header, data| header == [0xF0, 0x40, 0x00] && data == [3, 4])
            .returning(|_, _| Ok(()));
        let mut io = ChipIo::new(bus, ChipVariant::W5100S);
        io.write_tx_buffer(0, 0x07FE, &[1, 2, 3, 4]).unwrap();
    }

    #[test]
    fn bus_error_maps_to_error_bus() {
        let mut bus = MockBus::new();
        bus.expect_write_then_read().returning(|_, _| Err(()));
        let mut io = ChipIo::new(bus, ChipVariant::W5500);
        let mut buf = [0u8];
        assert_eq!(io.read_common(0, &mut buf), Err(Error::Bus));
    }
}
