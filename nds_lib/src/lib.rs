//! Emulation core for the handheld's sound processing unit.
//!
//! The crate implements the SPU itself: the 16 sample-generating channels,
//! the fixed-point sample clock, the saturating stereo mixer and the
//! memory-mapped register interface. The rest of the machine interacts with
//! it through three seams: CPU cycles are pushed in with [`Spu::run`],
//! sample data is fetched through the [`Memory`] trait and the audio
//! frontend drains finished samples through an [`AudioBuffer`] handle.

#[macro_use]
extern crate arrayref;
#[macro_use]
extern crate log;

mod error;
pub mod nds;

pub use error::{NdsError, NdsResult};
pub use nds::CycleCount;
pub use nds::memory::{LinearMemory, Memory};
pub use nds::spu::{AudioBuffer, Spu};
