use crate::nds::addressable::Addressable;

/// Read access to the emulated address space, as seen from the sound
/// hardware. The PCM and ADPCM generators fetch their sample data through
/// this; the SPU itself never validates the addresses it's given, dealing
/// with unmapped ranges is the memory subsystem's job.
pub trait Memory {
    fn load<T: Addressable>(&mut self, addr: u32) -> T;
}

/// Flat RAM-backed [`Memory`] implementation, little-endian like the
/// console. Handy for tests and for frontends that keep all sample data in
/// a single allocation.
pub struct LinearMemory {
    data: Vec<u8>,
}

impl LinearMemory {
    pub fn new(size: usize) -> LinearMemory {
        LinearMemory {
            data: vec![0; size],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> LinearMemory {
        LinearMemory { data }
    }

    pub fn store<T: Addressable>(&mut self, addr: u32, val: T) {
        let v = val.as_u32();

        for i in 0..T::width() as usize {
            if let Some(b) = self.data.get_mut(addr as usize + i) {
                *b = (v >> (8 * i)) as u8;
            }
        }
    }
}

impl Memory for LinearMemory {
    fn load<T: Addressable>(&mut self, addr: u32) -> T {
        let mut v = 0;

        for i in 0..T::width() as usize {
            // Out-of-range reads return open-bus zeroes
            let b = self.data.get(addr as usize + i).copied().unwrap_or(0);

            v |= u32::from(b) << (8 * i);
        }

        T::from_u32(v)
    }
}
