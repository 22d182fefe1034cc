//! Sound Processing Unit
//!
//! Reproduces the audio chip sample for sample: the 16 channel state
//! machines and their fixed-point sample clocks, the saturating stereo
//! mixer and the memory-mapped register window. The owning emulator pushes
//! elapsed CPU cycles into [`Spu::run`]; finished stereo pairs land in the
//! shared output buffer until the audio sink drains them.

pub mod buffer;
pub mod channel;

use std::ops::Index;

use bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::error::{NdsError, NdsResult};
use crate::nds::addressable::{AccessWidth, Addressable};
use crate::nds::memory::Memory;
use crate::nds::{CPU_FREQ_HZ, CycleCount};
use channel::Channel;

pub use buffer::AudioBuffer;

#[derive(serde::Serialize, serde::Deserialize)]
pub struct Spu {
    /// The 16 sound channels
    channels: [Channel; 16],
    /// Master control register
    control: MasterControl,
    /// DC offset applied by the output stage. Exposed through the register
    /// interface, the mixer itself doesn't consume it.
    bias: u16,
    /// Leftover CPU cycles that didn't amount to a full output sample
    cycle_counter: CycleCount,
    /// Output sample buffer, shared with the audio sink
    output: AudioBuffer,
}

impl Spu {
    pub fn new() -> Spu {
        Spu {
            channels: [
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
            ],
            control: MasterControl(0),
            bias: 0,
            cycle_counter: 0,
            output: AudioBuffer::new(),
        }
    }

    /// Return the peripheral to power-on silence. Handles previously given
    /// out by [`Spu::output`] stay valid.
    pub fn reset(&mut self) {
        for channel in self.channels.iter_mut() {
            *channel = Channel::new();
        }

        self.control = MasterControl(0);
        self.bias = 0;
        self.cycle_counter = 0;
        self.output.lock().clear();
    }

    /// Cloneable handle to the output buffer for the audio sink to drain
    pub fn output(&self) -> AudioBuffer {
        self.output.clone()
    }

    /// Run the SPU for `cycles` CPU cycles, appending any completed stereo
    /// samples to the output buffer
    pub fn run<M: Memory>(&mut self, mem: &mut M, cycles: CycleCount) {
        self.cycle_counter += cycles;

        let output = self.output.clone();
        let mut samples = output.lock();

        while self.cycle_counter >= CYCLES_PER_SAMPLE {
            self.cycle_counter -= CYCLES_PER_SAMPLE;

            self.run_cycle(mem, &mut samples);
        }
    }

    /// Produce one stereo output sample
    fn run_cycle<M: Memory>(&mut self, mem: &mut M, samples: &mut buffer::SampleBuffer) {
        // Sum of the volume- and pan-adjusted channel outputs
        let mut left_mix = 0i32;
        let mut right_mix = 0i32;

        for channel in self.channels.iter_mut() {
            if !channel.ctrl.busy() {
                continue;
            }

            channel.run_sample_cycle(mem);

            let shift = VOLUME_SHIFT[usize::from(channel.ctrl.volume_div())];

            let mut volume = i32::from(channel.ctrl.volume());
            if volume == 0x7f {
                // The top code point reaches true unity gain
                volume += 1;
            }

            let sample = (i32::from(channel.current_sample) << shift) * volume;

            let pan = i64::from(channel.ctrl.panning());

            left_mix += ((i64::from(sample) * (128 - pan)) >> 10) as i32;
            right_mix += ((i64::from(sample) * pan) >> 10) as i32;
        }

        if !self.control.enabled() {
            // Channels keep running, their output just never reaches the
            // buffer
            return;
        }

        let master = i64::from(self.control.master_volume());

        // Master volume, then the output stage's bit-depth reduction. The
        // extra shift after the clamp loses one bit of precision but it's
        // what the chip does.
        let left = (((i64::from(left_mix) * master) >> 7) >> 8) as i32;
        let right = (((i64::from(right_mix) * master) >> 7) >> 8) as i32;

        let left = i32::from(saturate_to_i16(left)) >> 1;
        let right = i32::from(saturate_to_i16(right)) >> 1;

        // If the buffer is full the pair is dropped, the hardware doesn't
        // replay skipped samples
        samples.push(left as i16, right as i16);
    }

    pub fn store<T: Addressable>(&mut self, off: u32, val: T) {
        let lane = (off & 3) * 8;

        let mask = match T::width() {
            AccessWidth::Byte => 0xff,
            AccessWidth::HalfWord => 0xffff,
            AccessWidth::Word => 0xffff_ffff,
        } << lane;

        let word_off = off & !3;
        let cur = self.peek(word_off);

        self.poke(word_off, (cur & !mask) | ((val.as_u32() << lane) & mask));
    }

    pub fn load<T: Addressable>(&self, off: u32) -> T {
        let lane = (off & 3) * 8;

        T::from_u32(self.peek(off & !3) >> lane)
    }

    /// Read a full register word. Narrower loads extract their lane from
    /// this, narrower stores read-modify-write it.
    fn peek(&self, off: u32) -> u32 {
        if off < 0x100 {
            let channel = &self.channels[((off >> 4) & 0xf) as usize];

            match off & 0xf {
                regmap::channel::CONTROL => channel.ctrl.word(),
                regmap::channel::SOURCE => channel.source,
                regmap::channel::RATE => {
                    u32::from(channel.rate_reload) | (u32::from(channel.loop_point) << 16)
                }
                regmap::channel::LENGTH => channel.length,
                _ => unreachable!(),
            }
        } else {
            match off {
                regmap::CONTROL => u32::from(self.control.0),
                regmap::BIAS => u32::from(self.bias),
                // Capture units are accepted but not implemented
                regmap::CAPTURE_CONTROL => 0,
                _ => {
                    warn!("Unhandled SPU load at offset 0x{:x}", off);
                    0
                }
            }
        }
    }

    /// Write a full register word, masking each field to its legal width
    /// and applying side effects (a busy bit going 0->1 starts the channel)
    fn poke(&mut self, off: u32, val: u32) {
        if off < 0x100 {
            let slot = ((off >> 4) & 0xf) as u8;
            let channel = &mut self.channels[usize::from(slot)];

            match off & 0xf {
                regmap::channel::CONTROL => channel.set_control(slot, val),
                regmap::channel::SOURCE => channel.source = val & 0x07ff_ffff,
                regmap::channel::RATE => {
                    channel.rate_reload = val as u16;
                    channel.loop_point = (val >> 16) as u16;
                }
                regmap::channel::LENGTH => channel.length = val & 0x1f_ffff,
                _ => unreachable!(),
            }
        } else {
            match off {
                regmap::CONTROL => self.control = MasterControl((val as u16) & 0xbf7f),
                regmap::BIAS => self.bias = (val as u16) & 0x3ff,
                regmap::CAPTURE_CONTROL => (),
                _ => warn!("Unhandled SPU store at offset 0x{:x}: 0x{:x}", off, val),
            }
        }
    }

    /// Serialize the whole SPU state, including any samples still waiting
    /// in the output buffer
    pub fn save_state(&self) -> NdsResult<Vec<u8>> {
        let mut fb = flexbuffers::FlexbufferSerializer::new();

        self.serialize(&mut fb)
            .map_err(|e| NdsError::BadSaveState(e.to_string()))?;

        let view = fb.view();

        let mut state = Vec::with_capacity(8 + view.len());

        state.extend_from_slice(b"NSP1");
        state.extend_from_slice(&(view.len() as u32).to_le_bytes());
        state.extend_from_slice(view);

        Ok(state)
    }

    /// Restore a state produced by [`Spu::save_state`]. Output buffer
    /// handles previously given out stay attached.
    pub fn load_state(&mut self, state: &[u8]) -> NdsResult<()> {
        if state.len() < 8 || state[0..4] != *b"NSP1" {
            return Err(NdsError::BadSaveState("bad magic".to_string()));
        }

        let len = u32::from_le_bytes(*array_ref![state, 4, 4]) as usize;

        let state = state
            .get(8..(8 + len))
            .ok_or_else(|| NdsError::BadSaveState("truncated".to_string()))?;

        let fbr = flexbuffers::Reader::get_root(state)
            .map_err(|e| NdsError::BadSaveState(e.to_string()))?;

        let mut spu =
            Spu::deserialize(fbr).map_err(|e| NdsError::BadSaveState(e.to_string()))?;

        // Move the restored samples into our existing buffer so that the
        // frontend's handles keep working
        *self.output.lock() = spu.output.lock().clone();
        spu.output = self.output.clone();

        *self = spu;

        Ok(())
    }
}

impl Default for Spu {
    fn default() -> Spu {
        Spu::new()
    }
}

impl Index<u8> for Spu {
    type Output = Channel;

    fn index(&self, slot: u8) -> &Channel {
        &self.channels[usize::from(slot)]
    }
}

/// Saturating cast from i32 to i16
pub fn saturate_to_i16(v: i32) -> i16 {
    if v < i32::from(i16::MIN) {
        i16::MIN
    } else if v > i32::from(i16::MAX) {
        i16::MAX
    } else {
        v as i16
    }
}

bitfield! {
    /// Master control register
    #[derive(serde::Serialize, serde::Deserialize, Copy, Clone)]
    pub struct MasterControl(u16);
    impl Debug;

    /// Master volume multiplier
    pub u8, master_volume, set_master_volume: 6, 0;

    /// Left output source selector. Exposed, the mixer always feeds the
    /// plain channel mix.
    pub u8, left_output, set_left_output: 9, 8;

    /// Right output source selector
    pub u8, right_output, set_right_output: 11, 10;

    /// Legacy mixer-bypass flags, exposed but not otherwise used
    pub u8, mixer_bypass, set_mixer_bypass: 13, 12;

    /// Master enable
    pub bool, enabled, set_enabled: 15;
}

#[allow(dead_code)]
mod regmap {
    //! SPU register map: byte offsets from the base of the peripheral
    //! window

    pub mod channel {
        //! Per-channel registers, one 16-byte block per channel. Offsets
        //! are relative to the block, word-aligned (the rate reload and
        //! loop point share the word at 0x8).

        pub const CONTROL: u32 = 0x0;
        pub const SOURCE: u32 = 0x4;
        pub const RATE: u32 = 0x8;
        pub const LOOP_POINT: u32 = 0xa;
        pub const LENGTH: u32 = 0xc;
    }

    pub const CONTROL: u32 = 0x100;
    pub const BIAS: u32 = 0x104;
    pub const CAPTURE_CONTROL: u32 = 0x108;
}

/// Pre-multiply shift selected by the channel volume divider field
static VOLUME_SHIFT: [u8; 4] = [4, 3, 2, 0];

/// The mixer produces samples at 32.768kHz
const AUDIO_FREQ_HZ: CycleCount = 32_768;

/// The CPU frequency is an exact multiple of the audio frequency so the
/// divider is always an integer (1024)
const CYCLES_PER_SAMPLE: CycleCount = CPU_FREQ_HZ / AUDIO_FREQ_HZ;
