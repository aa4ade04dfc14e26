//! BCM2711 GPIO output, through the `/dev/gpiomem` register window.

use emleak::*;
use memmap2::{ MmapMut, MmapOptions };
use nix::libc;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;

/// Register offsets (in 32-bit words) into the GPIO block.
mod reg {
    /// GPFSEL0..GPFSEL5, 10 pins per register, 3 bits per pin.
    pub const GPFSEL0: usize = 0x00 / 4;
    /// GPSET0..GPSET1
    pub const GPSET0: usize = 0x1c / 4;
    /// GPCLR0..GPCLR1
    pub const GPCLR0: usize = 0x28 / 4;
}

/// Function select value for an output.
const FSEL_OUTPUT: u32 = 0b001;

/// Number of GPIO lines on the BCM2711.
pub const NUM_PINS: u32 = 58;

/// Returns the GPFSEL register index and bit shift for `pin`.
pub fn fsel_location(pin: u32) -> (usize, u32) {
    (reg::GPFSEL0 + (pin / 10) as usize, (pin % 10) * 3)
}

/// Returns the GPSET register index and bit mask for `pin`.
pub fn set_location(pin: u32) -> (usize, u32) {
    (reg::GPSET0 + (pin / 32) as usize, 1 << (pin % 32))
}

/// Returns the GPCLR register index and bit mask for `pin`.
pub fn clear_location(pin: u32) -> (usize, u32) {
    (reg::GPCLR0 + (pin / 32) as usize, 1 << (pin % 32))
}

/// The mapped GPIO register block.
pub struct Bcm2711Gpio {
    map: MmapMut,
}

impl Bcm2711Gpio {
    pub const DEVICE: &'static str = "/dev/gpiomem";
    /// Size of the register window.
    pub const MAP_LEN: usize = 4096;

    /// Open and map `/dev/gpiomem`.
    pub fn open() -> TargetResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(Self::DEVICE)
            .map_err(|source| TargetError::DeviceOpen { path: Self::DEVICE, source })?;
        let map = unsafe {
            MmapOptions::new().len(Self::MAP_LEN).map_mut(&file)
        }.map_err(TargetError::DeviceMap)?;
        Ok(Self::from_map(map))
    }

    /// Use an existing mapping as the register block.
    pub fn from_map(map: MmapMut) -> Self {
        assert!(map.len() >= Self::MAP_LEN);
        Self { map }
    }

    fn read(&self, idx: usize) -> u32 {
        let regs = self.map.as_ptr() as *const u32;
        unsafe { std::ptr::read_volatile(regs.add(idx)) }
    }

    fn write(&mut self, idx: usize, val: u32) {
        let regs = self.map.as_mut_ptr() as *mut u32;
        unsafe { std::ptr::write_volatile(regs.add(idx), val) }
    }

    /// Configure `pin` as an output.
    pub fn set_output(&mut self, pin: u32) -> TargetResult<()> {
        if pin >= NUM_PINS {
            return Err(TargetError::InvalidConfig {
                what: "trigger pin",
                value: pin as usize,
                reason: "the BCM2711 has 58 GPIO lines",
            });
        }
        let (idx, shift) = fsel_location(pin);
        let val = self.read(idx) & !(0b111 << shift);
        self.write(idx, val | (FSEL_OUTPUT << shift));
        Ok(())
    }

    /// Drive `pin` high.
    #[inline(always)]
    pub fn set(&mut self, pin: u32) {
        let (idx, mask) = set_location(pin);
        self.write(idx, mask);
    }

    /// Drive `pin` low.
    #[inline(always)]
    pub fn clear(&mut self, pin: u32) {
        let (idx, mask) = clear_location(pin);
        self.write(idx, mask);
    }
}

/// A [`Trigger`] on one GPIO output.
pub struct GpioTrigger {
    gpio: Bcm2711Gpio,
    pin: u32,
}

impl GpioTrigger {
    /// Configure `pin` as an output and drive it low.
    pub fn new(mut gpio: Bcm2711Gpio, pin: u32) -> TargetResult<Self> {
        gpio.set_output(pin)?;
        gpio.clear(pin);
        Ok(Self { gpio, pin })
    }

    pub fn pin(&self) -> u32 { self.pin }
}

impl Trigger for GpioTrigger {
    #[inline(always)]
    fn assert(&mut self) { self.gpio.set(self.pin) }
    #[inline(always)]
    fn deassert(&mut self) { self.gpio.clear(self.pin) }
}
