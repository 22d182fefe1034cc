pub mod addressable;
pub mod memory;
pub mod spu;

/// A number of CPU clock cycles
pub type CycleCount = i32;

/// Clock of the CPU the sound hardware hangs off of
pub const CPU_FREQ_HZ: CycleCount = 33_554_432;
