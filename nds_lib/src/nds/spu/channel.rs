//! Per-channel playback state machine and the five sample generators.

use std::cmp::min;

use bitfield::bitfield;

use crate::nds::memory::Memory;

/// Per-channel timer ticks elapsed for every mixer output sample: the
/// channel timers run at half the CPU clock and the mixer at 1/1024th of
/// it, so 512 timer ticks fit in one output sample.
const TIMER_STEP: u32 = 512;

/// Value the noise shift register is reseeded to whenever the channel is
/// (re)started
const NOISE_LFSR_SEED: u16 = 0x7fff;

/// Highest valid ADPCM step table index
const ADPCM_INDEX_MAX: u8 = 88;

/// Repeat-mode codes in the control register. Mode 0 is "manual": no
/// end-of-data handling at all, software is expected to stop the channel.
pub const REPEAT_LOOP: u8 = 1;
pub const REPEAT_ONE_SHOT: u8 = 2;

/// Writable bits of the channel control register
const CONTROL_MASK: u32 = 0xff7f_837f;

bitfield! {
    /// Channel control register
    #[derive(serde::Serialize, serde::Deserialize, Copy, Clone)]
    pub struct ChannelControl(u32);
    impl Debug;

    /// Volume multiplier. 127 is treated as full volume, not 127/128
    pub u8, volume, set_volume: 6, 0;

    /// Volume divider: selects a pre-multiply shift of [4, 3, 2, 0]
    pub u8, volume_div, set_volume_div: 9, 8;

    /// Keep the last sample on the output after a one-shot ends instead of
    /// resetting to 0. Exposed but not acted upon, like the hardware's
    /// sibling emulators do.
    pub bool, hold, set_hold: 15;

    /// Stereo panning: 0 is full left, 127 is (almost) full right
    pub u8, panning, set_panning: 22, 16;

    /// PSG square wave duty cycle
    pub u8, wave_duty, set_wave_duty: 26, 24;

    /// 0 = manual, 1 = loop, 2 = one-shot
    pub u8, repeat_mode, set_repeat_mode: 28, 27;

    /// Sample format code. 0 = PCM8, 1 = PCM16, 2 = ADPCM, 3 = PSG or
    /// noise depending on the channel slot.
    pub u8, format, set_format: 30, 29;

    /// Channel is playing. A 0->1 transition through the register
    /// interface (re)starts the channel.
    pub bool, busy, set_busy: 31;
}

impl ChannelControl {
    /// Raw register value as seen through the register interface
    pub fn word(&self) -> u32 {
        self.0
    }
}

/// The generator a channel runs, resolved from the format code and the
/// channel slot when the channel is started
#[derive(serde::Serialize, serde::Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
pub enum Generator {
    Pcm8,
    Pcm16,
    Adpcm,
    Psg,
    Noise,
}

impl Generator {
    /// Format code 3 is special: slots 14 and 15 run the noise LFSR, every
    /// other slot takes the PSG path (8-13 are the documented PSG slots,
    /// 0-7 fall back to it).
    fn resolve(format: u8, slot: u8) -> Generator {
        match format {
            0 => Generator::Pcm8,
            1 => Generator::Pcm16,
            2 => Generator::Adpcm,
            _ => {
                if slot >= 14 {
                    Generator::Noise
                } else {
                    Generator::Psg
                }
            }
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct Channel {
    pub ctrl: ChannelControl,
    /// Base address of the sample data
    pub source: u32,
    /// Timer reload value, two's complement: the closer to 0x10000 the
    /// higher the pitch
    pub rate_reload: u16,
    /// Loop point in 4-byte units from `source`
    pub loop_point: u16,
    /// Sample data length in 4-byte units past the loop point
    pub length: u32,
    /// 16-bit-plus-carry timer accumulator driving the sample cadence
    pub timer: u32,
    /// Playback cursor in format-specific units (bytes for PCM8, halfwords
    /// for PCM16, nibbles for ADPCM). Negative values encode the start-up
    /// delay before the first real sample.
    pub position: i32,
    /// The generator selected when the channel was last started
    pub generator: Generator,
    /// Last sample emitted by the generator
    pub current_sample: i16,
    /// ADPCM predictor
    pub predictor: i32,
    /// ADPCM step table index, always within [0, 88]
    pub step_index: u8,
    /// `(predictor, step_index)` captured when the decode cursor crosses
    /// the loop point, restored on every loop wrap
    pub loop_predictor: i32,
    pub loop_step_index: u8,
    /// Noise shift register
    pub noise_lfsr: u16,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            ctrl: ChannelControl(0),
            source: 0,
            rate_reload: 0,
            loop_point: 0,
            length: 0,
            timer: 0,
            position: 0,
            generator: Generator::Pcm8,
            current_sample: 0,
            predictor: 0,
            step_index: 0,
            loop_predictor: 0,
            loop_step_index: 0,
            noise_lfsr: NOISE_LFSR_SEED,
        }
    }

    /// Store a new control register value. Starting the channel is a side
    /// effect of the busy bit going from 0 to 1; writes that merely keep
    /// it set (or clear it) leave the playback cursor alone.
    pub fn set_control(&mut self, slot: u8, val: u32) {
        let was_busy = self.ctrl.busy();

        self.ctrl = ChannelControl(val & CONTROL_MASK);

        if self.ctrl.busy() && !was_busy {
            self.start(slot);
        }
    }

    /// Reinitialize the channel for playback. Always starts from a clean
    /// cursor, the hardware can't resume mid-stream.
    fn start(&mut self, slot: u8) {
        self.generator = Generator::resolve(self.ctrl.format(), slot);

        self.timer = u32::from(self.rate_reload);
        self.current_sample = 0;
        self.predictor = 0;
        self.step_index = 0;
        self.loop_predictor = 0;
        self.loop_step_index = 0;
        self.noise_lfsr = NOISE_LFSR_SEED;

        // Models the hardware pipeline latency before the first sample
        self.position = match self.generator {
            Generator::Adpcm => -1,
            _ => -3,
        };
    }

    /// Advance the channel timer by one mixer sample and run a generation
    /// tick for every 16-bit overflow. The reload is added back after each
    /// overflow, so small two's-complement magnitudes (reloads close to
    /// 0x10000) overflow again sooner and yield more ticks.
    pub fn run_sample_cycle<M: Memory>(&mut self, mem: &mut M) {
        debug_assert!(self.ctrl.busy());

        self.timer += TIMER_STEP;

        while self.timer >> 16 != 0 {
            self.timer = self.timer - 0x1_0000 + u32::from(self.rate_reload);

            self.tick(mem);

            if !self.ctrl.busy() {
                // One-shot end of data, drop the remaining ticks
                break;
            }
        }
    }

    fn tick<M: Memory>(&mut self, mem: &mut M) {
        match self.generator {
            Generator::Pcm8 => self.next_pcm8(mem),
            Generator::Pcm16 => self.next_pcm16(mem),
            Generator::Adpcm => self.next_adpcm(mem),
            Generator::Psg => self.next_psg(),
            Generator::Noise => self.next_noise(),
        }
    }

    /// End a one-shot channel
    fn stop(&mut self) {
        self.current_sample = 0;
        self.ctrl.set_busy(false);
    }

    /// End of the sample data in bytes from `source`
    fn end_position(&self) -> i32 {
        ((u32::from(self.loop_point) + self.length) << 2) as i32
    }

    fn loop_position(&self) -> i32 {
        (u32::from(self.loop_point) << 2) as i32
    }

    fn next_pcm8<M: Memory>(&mut self, mem: &mut M) {
        self.position += 1;

        if self.position < 0 {
            return;
        }

        if self.position >= self.end_position() {
            match self.ctrl.repeat_mode() {
                REPEAT_LOOP => self.position = self.loop_position(),
                REPEAT_ONE_SHOT => {
                    self.stop();
                    return;
                }
                // Manual mode has no end-of-data handling, the cursor just
                // keeps running
                _ => (),
            }
        }

        let s = mem.load::<u8>(self.source.wrapping_add(self.position as u32)) as i8;

        self.current_sample = i16::from(s) << 8;
    }

    fn next_pcm16<M: Memory>(&mut self, mem: &mut M) {
        self.position += 1;

        if self.position < 0 {
            return;
        }

        // The cursor counts halfwords here
        if self.position >= self.end_position() >> 1 {
            match self.ctrl.repeat_mode() {
                REPEAT_LOOP => self.position = self.loop_position() >> 1,
                REPEAT_ONE_SHOT => {
                    self.stop();
                    return;
                }
                _ => (),
            }
        }

        let addr = self.source.wrapping_add((self.position as u32) << 1);

        self.current_sample = mem.load::<u16>(addr) as i16;
    }

    fn next_adpcm<M: Memory>(&mut self, mem: &mut M) {
        self.position += 1;

        // The cursor counts nibbles, including the 8 nibbles of the block
        // header. The decoder spends the first 8 ticks loading the header,
        // no sample is produced until they elapse.
        if self.position < 8 {
            if self.position == 0 {
                let header = mem.load::<u32>(self.source);

                self.predictor = i32::from(header as u16 as i16);
                self.step_index = min(((header >> 16) & 0xff) as u8, ADPCM_INDEX_MAX);

                self.loop_predictor = self.predictor;
                self.loop_step_index = self.step_index;
            }
            return;
        }

        let loop_start = self.loop_position() << 1;

        // Capture the decoder state right before the loop-point nibble is
        // consumed so that later wraps replay it from identical state. This
        // deliberately overwrites the header snapshot: loops resume from
        // the refined state, not from the block header.
        if self.position == loop_start {
            self.loop_predictor = self.predictor;
            self.loop_step_index = self.step_index;
        }

        if self.position >= self.end_position() << 1 {
            match self.ctrl.repeat_mode() {
                REPEAT_LOOP => {
                    self.position = loop_start;
                    self.predictor = self.loop_predictor;
                    self.step_index = self.loop_step_index;
                }
                REPEAT_ONE_SHOT => {
                    self.stop();
                    return;
                }
                _ => (),
            }
        }

        let byte = mem.load::<u8>(self.source.wrapping_add((self.position >> 1) as u32));

        let nibble = if self.position & 1 == 0 {
            byte & 0xf
        } else {
            byte >> 4
        };

        self.decode_nibble(nibble);

        self.current_sample = self.predictor as i16;
    }

    /// Run one nibble through the ADPCM predictor. This is not quite
    /// standard IMA: the delta sums magnitude/8 unconditionally plus
    /// magnitude/4, /2 and /1 for nibble bits 0-2, and the predictor clamps
    /// to +/-0x7fff symmetrically.
    fn decode_nibble(&mut self, nibble: u8) {
        let magnitude = i32::from(ADPCM_STEP_TABLE[usize::from(self.step_index)]);

        let mut delta = magnitude >> 3;
        if nibble & 1 != 0 {
            delta += magnitude >> 2;
        }
        if nibble & 2 != 0 {
            delta += magnitude >> 1;
        }
        if nibble & 4 != 0 {
            delta += magnitude;
        }

        self.predictor = if nibble & 8 != 0 {
            (self.predictor - delta).max(-0x7fff)
        } else {
            (self.predictor + delta).min(0x7fff)
        };

        let index = i32::from(self.step_index)
            + i32::from(ADPCM_INDEX_TABLE[usize::from(nibble & 7)]);

        self.step_index = index.clamp(0, i32::from(ADPCM_INDEX_MAX)) as u8;
    }

    fn next_psg(&mut self) {
        self.position += 1;

        if self.position < 0 {
            return;
        }

        let duty = usize::from(self.ctrl.wave_duty());

        self.current_sample = PSG_WAVEFORMS[duty][(self.position & 7) as usize];
    }

    fn next_noise(&mut self) {
        self.position += 1;

        if self.position < 0 {
            return;
        }

        let carry = self.noise_lfsr & 1 != 0;

        self.noise_lfsr >>= 1;

        self.current_sample = if carry {
            self.noise_lfsr ^= 0x6000;
            -0x7fff
        } else {
            0x7fff
        };
    }
}

/// ADPCM step magnitudes, indexed by `step_index`
static ADPCM_STEP_TABLE: [u16; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408, 449,
    494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066, 2272,
    2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630, 9493,
    10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794, 32767,
];

/// Step index adjustment, indexed by the low 3 bits of the nibble
static ADPCM_INDEX_TABLE: [i8; 8] = [-1, -1, -1, -1, 2, 4, 6, 8];

/// PSG square waveforms, one row per duty setting. Duty 7 is the
/// constant-low pattern the hardware really produces, not a special case.
static PSG_WAVEFORMS: [[i16; 8]; 8] = [
    [-0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, 0x7fff],
    [-0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, 0x7fff, 0x7fff],
    [-0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, 0x7fff, 0x7fff, 0x7fff],
    [-0x7fff, -0x7fff, -0x7fff, -0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff],
    [-0x7fff, -0x7fff, -0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff],
    [-0x7fff, -0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff],
    [-0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff, 0x7fff],
    [-0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff, -0x7fff],
];
