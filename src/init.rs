//! Chip autodetection, soft reset, and per-socket buffer sizing.
//!
//! Ported from `adafruit_wiznet5k.py::_wiznet_chip_init` and its three
//! `_detect_and_reset_*` closures.

use crate::chip::ChipVariant;
use crate::error::Error;
use crate::spi::{Bus, ChipIo};
use embedded_hal::delay::DelayNs;

const MR_RESET: u8 = 0x80;

/// Try W5100S, then W5500, then W6100; return a [`ChipIo`] for whichever
/// variant answers the expected version byte, having performed its soft
/// reset and per-socket buffer sizing.
///
/// Detection is non-destructive to other devices on the bus: chip-select is
/// only asserted for the transactions this function itself issues.
pub fn detect_and_init<B: Bus>(bus: B, delay: &mut impl DelayNs) -> Result<ChipIo<B>, Error> {
    let mut io = ChipIo::new(bus, ChipVariant::W5100S);
    if try_w5100s(&mut io, delay)? {
        return Ok(io);
    }
    let mut io = retag(io, ChipVariant::W5500);
    if try_w5500(&mut io, delay)? {
        return Ok(io);
    }
    let mut io = retag(io, ChipVariant::W6100);
    if try_w6100(&mut io, delay)? {
        return Ok(io);
    }
    Err(Error::ChipNotFound)
}

/// Re-tag a [`ChipIo`] as a different variant, reusing the same bus.
///
/// Detection runs the three variant probes in sequence over one bus handle;
/// re-tagging avoids needing the bus type to be `Clone`.
fn retag<B: Bus>(io: ChipIo<B>, variant: ChipVariant) -> ChipIo<B> {
    ChipIo::new(io.into_bus(), variant)
}

fn read_mr<B: Bus>(io: &mut ChipIo<B>) -> Result<u8, Error> {
    let mut buf = [0u8];
    io.read_common(io.registers().mr, &mut buf)?;
    Ok(buf[0])
}

fn write_mr<B: Bus>(io: &mut ChipIo<B>, value: u8) -> Result<(), Error> {
    io.write_common(io.registers().mr, &[value])
}

/// Common W5100S/W5500 soft reset: set MR.RST, wait, confirm it self-clears.
fn soft_reset_5x00<B: Bus>(
    io: &mut ChipIo<B>,
    delay: &mut impl DelayNs,
    expect_after_reset: u8,
) -> Result<bool, Error> {
    write_mr(io, MR_RESET)?;
    delay.delay_ms(50);
    Ok(read_mr(io)? == expect_after_reset)
}

fn setup_sockets_8<B: Bus>(io: &mut ChipIo<B>) -> Result<(), Error> {
    for sock in 0..8u8 {
        io.write_socket_register(sock, 0x1E, 0x02)?; // TX_MSR
        io.write_socket_register(sock, 0x1F, 0x02)?; // RX_MSR
    }
    io.set_channel_base(0x0000);
    Ok(())
}

fn try_w5100s<B: Bus>(io: &mut ChipIo<B>, delay: &mut impl DelayNs) -> Result<bool, Error> {
    if !soft_reset_5x00(io, delay, 0x03)? {
        return Ok(false);
    }
    let mut version = [0u8];
    io.read_common(io.registers().versionr, &mut version)?;
    if version[0] != ChipVariant::W5100S.version_expected() {
        return Ok(false);
    }
    io.set_channel_base(0x0400);
    Ok(true)
}

fn try_w5500<B: Bus>(io: &mut ChipIo<B>, delay: &mut impl DelayNs) -> Result<bool, Error> {
    if !soft_reset_5x00(io, delay, 0x00)? {
        return Ok(false);
    }
    // Exercise MR as a scratch register to confirm the chip answers writes,
    // matching the original driver's belt-and-braces probe sequence.
    for probe in [0x08u8, 0x10, 0x00] {
        write_mr(io, probe)?;
        if read_mr(io)? != probe {
            return Ok(false);
        }
    }
    let mut version = [0u8];
    io.read_common(io.registers().versionr, &mut version)?;
    if version[0] != ChipVariant::W5500.version_expected() {
        return Ok(false);
    }
    setup_sockets_8(io)?;
    Ok(true)
}

/// Re-run the current variant's soft-reset sequence without re-probing the
/// version byte or re-sizing socket buffers.
///
/// Exposed as [`crate::iface::NetInterface::soft_reset`]; useful after a bus
/// glitch, without paying for full autodetection again.
pub fn soft_reset<B: Bus>(io: &mut ChipIo<B>, delay: &mut impl DelayNs) -> Result<(), Error> {
    match io.variant() {
        ChipVariant::W5100S | ChipVariant::W5500 => {
            io.write_common(io.registers().mr, &[MR_RESET])?;
            delay.delay_ms(50);
            Ok(())
        }
        ChipVariant::W6100 => {
            io.write_common(0x41F4, &[0xCE])?;
            delay.delay_ms(50);
            io.write_common(0x2004, &[0x00])?;
            delay.delay_ms(50);
            io.write_common(0x41F5, &[0x3A])
        }
    }
}

fn try_w6100<B: Bus>(io: &mut ChipIo<B>, delay: &mut impl DelayNs) -> Result<bool, Error> {
    io.write_common(0x41F4, &[0xCE])?; // Unlock chip settings.
    delay.delay_ms(50);
    io.write_common(0x2004, &[0x00])?; // Reset chip.
    delay.delay_ms(50);
    let mut version = [0u8];
    io.read_common(io.registers().versionr, &mut version)?;
    if version[0] != ChipVariant::W6100.version_expected() {
        return Ok(false);
    }
    io.write_common(0x41F5, &[0x3A])?; // Unlock network settings.
    setup_sockets_8(io)?;
    Ok(true)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use mockall::mock;
    use mockall::Sequence;

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

    #[test]
    fn detects_w5500_after_w5100s_probe_fails() {
        let mut bus = MockBus::new();
        let mut seq = Sequence::new();

        // W5100S soft reset: write MR.RST, read back MR; wrong value fails probe.
        bus.expect_write_then_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        bus.expect_write_then_read()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| {
                buf[0] = 0xFF; // neither 0x00 nor 0x03: both variants' probes fail here.
                Ok(())
            });

        // W5500 soft reset.
        bus.expect_write_then_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        bus.expect_write_then_read()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| {
                buf[0] = 0x00;
                Ok(())
            });
        // MR scratch probes 0x08, 0x10, 0x00.
        for expected in [0x08u8, 0x10, 0x00] {
            bus.expect_write_then_write()
                .times(1)
                .in_sequence(&mut seq)
                .withf(move |_, data| data[0] == expected)
                .returning(|_, _| Ok(()));
            bus.expect_write_then_read()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, buf| {
                    buf[0] = expected;
                    Ok(())
                });
        }
        // VERSIONR read.
        bus.expect_write_then_read()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| {
                buf[0] = 0x04;
                Ok(())
            });
        // 8 sockets x 2 buffer-size registers.
        bus.expect_write_then_write()
            .times(16)
            .returning(|_, _| Ok(()));

        let io = detect_and_init(bus, &mut NoDelay).unwrap();
        assert_eq!(io.variant(), ChipVariant::W5500);
    }

    #[test]
    fn no_chip_answering_is_chip_not_found() {
        let mut bus = MockBus::new();
        bus.expect_write_then_write().returning(|_, _| Ok(()));
        bus.expect_write_then_read().returning(|_, buf| {
            buf[0] = 0xAA; // matches nothing.
            Ok(())
        });
        let result = detect_and_init(bus, &mut NoDelay);
        assert_eq!(result.err(), Some(Error::ChipNotFound));
    }
}
