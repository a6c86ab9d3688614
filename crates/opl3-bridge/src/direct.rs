//! Direct MIDI control of the OPL3.
//!
//! One OPL3 channel per MIDI channel, no allocation games: note on/off,
//! controllers, pitch bend and the NRPN parameter tree all translate
//! straight into register writes. A SysEx protocol under the
//! experimental manufacturer id exposes raw register access, patch
//! dump/load and reset commands.
//!
//! The per-OPL3-channel entry points (`note_on_channel`,
//! `release_channel`, `bend_channel`, `apply_cc_to_channel`,
//! `direct_nrpn`) bypass MIDI status parsing so the
//! [`crate::VoiceAllocator`] can address all 18 channels, including the
//! two with no MIDI channel equivalent.

use log::debug;

use crate::ShadowState;
use crate::registers::{
    KEY_ON_BIT, NoteFreq, REG_FEEDBACK_CONN, REG_FNUM_LOW, REG_FOUR_OP_ENABLE,
    REG_KEYON_BLOCK_FNUM, REG_OP_ATTACK_DECAY, REG_OP_FLAGS, REG_OP_LEVEL,
    REG_OP_SUSTAIN_RELEASE, REG_OP_WAVEFORM, REG_RHYTHM, channel_reg, four_op_enable_bit,
    four_op_partner, fnum_for_hz, midi_note_hz, note_freq, operator_reg,
};

/// SysEx manufacturer id used by the bridge (reserved for
/// non-commercial/experimental use).
pub const MANUFACTURER_ID: u8 = 0x7D;

/// Write one register, 7-bit value.
pub const CMD_REG_WRITE_7: u8 = 0x01;
/// Batch register write, 7-bit values.
pub const CMD_BATCH_WRITE_7: u8 = 0x02;
/// Write one register, 8-bit value carried as two nibbles.
pub const CMD_REG_WRITE_8: u8 = 0x03;
/// Batch register write, 8-bit values.
pub const CMD_BATCH_WRITE_8: u8 = 0x04;
/// Request a patch dump; the response is a [`CMD_PATCH_LOAD`] frame.
pub const CMD_PATCH_DUMP: u8 = 0x10;
/// Load a nibble-encoded patch onto a channel.
pub const CMD_PATCH_LOAD: u8 = 0x11;
/// Reset chip state and reload the default patch.
pub const CMD_RESET_ALL: u8 = 0x20;
/// Configure a MIDI channel's voice pool (voice allocator).
pub const CMD_VOICE_CONFIG: u8 = 0x30;
/// Query a MIDI channel's voice pool (voice allocator).
pub const CMD_VOICE_QUERY: u8 = 0x31;
/// Configure percussion mode and drum bindings (voice allocator).
pub const CMD_PERC_CONFIG: u8 = 0x32;
/// Query percussion mode and drum bindings (voice allocator).
pub const CMD_PERC_QUERY: u8 = 0x33;
/// Hardware reset sequence.
pub const CMD_HW_RESET: u8 = 0x7F;

/// Null marker for NRPN/RPN address bytes.
pub(crate) const PARAM_NULL: u8 = 0x7F;

/// Sink for MIDI output frames (SysEx query responses).
pub(crate) type MidiOutput = Box<dyn FnMut(&[u8]) + Send>;

/// The five OPL3 percussion-mode instruments.
///
/// In percussion mode, channels 6-8 of port 0 are repurposed: their
/// key-on state moves into the rhythm register and each drum sounds
/// through a fixed operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drum {
    /// Bass drum: both operators of channel 6.
    BassDrum,
    /// Snare drum: carrier of channel 7.
    Snare,
    /// Tom-tom: modulator of channel 8.
    TomTom,
    /// Cymbal: carrier of channel 8.
    Cymbal,
    /// Hi-hat: modulator of channel 7.
    HiHat,
}

impl Drum {
    /// All drums, in rhythm-register bit order (bit 4 down to bit 0).
    pub const ALL: [Drum; 5] = [
        Drum::BassDrum,
        Drum::Snare,
        Drum::TomTom,
        Drum::Cymbal,
        Drum::HiHat,
    ];

    /// Index into per-drum state arrays.
    pub fn index(self) -> usize {
        match self {
            Drum::BassDrum => 0,
            Drum::Snare => 1,
            Drum::TomTom => 2,
            Drum::Cymbal => 3,
            Drum::HiHat => 4,
        }
    }

    /// Channel whose frequency registers pitch this drum.
    fn freq_channel(self) -> u8 {
        match self {
            Drum::BassDrum => 6,
            Drum::Snare | Drum::HiHat => 7,
            Drum::TomTom | Drum::Cymbal => 8,
        }
    }

    /// Key-on bit in the rhythm register.
    fn trigger_bit(self) -> u8 {
        match self {
            Drum::BassDrum => 0x10,
            Drum::Snare => 0x08,
            Drum::TomTom => 0x04,
            Drum::Cymbal => 0x02,
            Drum::HiHat => 0x01,
        }
    }

    /// Level register of the operator this drum sounds through.
    fn level_reg(self) -> u16 {
        match self {
            Drum::BassDrum => operator_reg(6, 1, REG_OP_LEVEL),
            Drum::Snare => operator_reg(7, 1, REG_OP_LEVEL),
            Drum::TomTom => operator_reg(8, 0, REG_OP_LEVEL),
            Drum::Cymbal => operator_reg(8, 1, REG_OP_LEVEL),
            Drum::HiHat => operator_reg(7, 0, REG_OP_LEVEL),
        }
    }
}

/// Controller and note state for one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelState {
    /// CC7 channel volume.
    pub volume: u8,
    /// CC11 expression.
    pub expression: u8,
    /// CC10 pan position.
    pub pan: u8,
    /// CC1 modulation wheel.
    pub mod_wheel: u8,
    /// CC74 brightness.
    pub brightness: u8,
    /// CC64 sustain pedal.
    pub sustain: bool,
    /// NRPN address, `0x7F` = null.
    pub nrpn_msb: u8,
    /// NRPN address, `0x7F` = null.
    pub nrpn_lsb: u8,
    /// RPN address, `0x7F` = null.
    pub rpn_msb: u8,
    /// RPN address, `0x7F` = null.
    pub rpn_lsb: u8,
    /// Pitch bend range, whole semitones.
    pub bend_range_semitones: u8,
    /// Pitch bend range, additional cents.
    pub bend_range_cents: u8,
    /// Currently sounding note.
    pub note: Option<u8>,
    /// Velocity of the sounding note.
    pub velocity: u8,
    /// The sounding note received its note-off while the pedal was down.
    pub held_by_sustain: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            volume: 100,
            expression: 127,
            pan: 64,
            mod_wheel: 0,
            brightness: 64,
            sustain: false,
            nrpn_msb: PARAM_NULL,
            nrpn_lsb: PARAM_NULL,
            rpn_msb: PARAM_NULL,
            rpn_lsb: PARAM_NULL,
            bend_range_semitones: 2,
            bend_range_cents: 0,
            note: None,
            velocity: 0,
            held_by_sustain: false,
        }
    }
}

/// Compute the OPL3 carrier attenuation (0-63) for a volume/expression
/// pair, both 0-127. Either at zero silences the channel outright.
pub fn compute_attenuation(volume: u8, expression: u8) -> u8 {
    if volume == 0 || expression == 0 {
        return 63;
    }
    let combined = (f64::from(volume) / 127.0) * (f64::from(expression) / 127.0);
    let atten = (-20.0 * combined.log10() / 0.75).round();
    atten.clamp(0.0, 63.0) as u8
}

/// Modulator attenuation from mod wheel and brightness, combined
/// multiplicatively. More wheel or more brightness means less
/// attenuation, hence more modulation.
fn modulator_attenuation(mod_wheel: u8, brightness: u8) -> u8 {
    let combined = (f64::from(mod_wheel) / 127.0) * (f64::from(brightness) / 127.0);
    if combined < 0.001 {
        return 63;
    }
    let atten = (-20.0 * combined.log10() / 0.75).round();
    atten.clamp(0.0, 63.0) as u8
}

/// Direct OPL3 control: translates MIDI channel-voice messages, NRPNs
/// and SysEx into register writes on the shadow state.
pub struct DirectMode {
    state: ShadowState,
    device_id: u8,
    midi_out: Option<MidiOutput>,
    channels: [ChannelState; 18],
}

impl DirectMode {
    /// Create a direct-mode translator over a shadow state.
    ///
    /// `device_id` filters SysEx: `0x7F` accepts every frame, anything
    /// else accepts its own id and the broadcast id.
    pub fn new(state: ShadowState, device_id: u8) -> Self {
        Self {
            state,
            device_id,
            midi_out: None,
            channels: [ChannelState::default(); 18],
        }
    }

    /// Install the sink for SysEx responses (patch dumps). Without a
    /// sink, dump requests are dropped.
    pub fn set_midi_output(&mut self, sink: MidiOutput) {
        self.midi_out = Some(sink);
    }

    /// Read access to the shadow registers.
    pub fn shadow(&self) -> &ShadowState {
        &self.state
    }

    /// Mutable access to the shadow registers.
    pub fn shadow_mut(&mut self) -> &mut ShadowState {
        &mut self.state
    }

    /// Controller state of a channel (0-17).
    pub fn channel_state(&self, ch: u8) -> &ChannelState {
        &self.channels[ch as usize]
    }

    /// Reset the chip and program the default patch on every channel.
    ///
    /// The default is a plain FM piano-ish voice: sine waves, attack 15,
    /// decay 4, modulator backed off to total level 32, feedback 4, both
    /// speakers on.
    pub fn init(&mut self) {
        self.state.reset();
        self.channels = [ChannelState::default(); 18];

        for ch in 0..self.channels.len() as u8 {
            self.state.write(operator_reg(ch, 0, REG_OP_FLAGS), 0x21);
            self.state.write(operator_reg(ch, 1, REG_OP_FLAGS), 0x21);
            self.state.write(operator_reg(ch, 0, REG_OP_LEVEL), 0x20);
            self.state.write(operator_reg(ch, 1, REG_OP_LEVEL), 0x00);
            self.state.write(operator_reg(ch, 0, REG_OP_ATTACK_DECAY), 0xF4);
            self.state.write(operator_reg(ch, 1, REG_OP_ATTACK_DECAY), 0xF4);
            self.state.write(operator_reg(ch, 0, REG_OP_SUSTAIN_RELEASE), 0x24);
            self.state.write(operator_reg(ch, 1, REG_OP_SUSTAIN_RELEASE), 0x26);
            self.state.write(operator_reg(ch, 0, REG_OP_WAVEFORM), 0x00);
            self.state.write(operator_reg(ch, 1, REG_OP_WAVEFORM), 0x00);
            self.state.write(channel_reg(ch, REG_FEEDBACK_CONN), 0x38);
        }
    }

    /// Process one complete MIDI message.
    ///
    /// Recognises note on/off, control change, pitch bend and SysEx;
    /// anything else, and any too-short frame, is dropped.
    pub fn process(&mut self, msg: &[u8]) {
        let Some(&status) = msg.first() else { return };

        if status == 0xF0 {
            self.handle_sysex(msg);
            return;
        }

        let ch = status & 0x0F;
        match status & 0xF0 {
            0x90 if msg.len() >= 3 => {
                if msg[2] == 0 {
                    self.handle_note_off(ch, msg[1]);
                } else {
                    self.note_on_channel(ch, msg[1], msg[2]);
                }
            }
            0x80 if msg.len() >= 3 => self.handle_note_off(ch, msg[1]),
            0xB0 if msg.len() >= 3 => self.handle_cc(ch, msg[1], msg[2]),
            0xE0 if msg.len() >= 3 => {
                let bend = u16::from(msg[1]) | (u16::from(msg[2]) << 7);
                self.handle_pitch_bend(ch, bend);
            }
            _ => {}
        }
    }

    // --- Note handling ---

    /// Start a note on a specific OPL3 channel (0-17).
    ///
    /// Any note already sounding on the channel is keyed off first. The
    /// carrier level combines channel volume, expression and velocity.
    pub fn note_on_channel(&mut self, ch: u8, note: u8, vel: u8) {
        if ch as usize >= self.channels.len() {
            return;
        }
        let (note, vel) = (note & 0x7F, vel & 0x7F);

        if self.channels[ch as usize].note.is_some() {
            self.write_freq(ch, NoteFreq::default(), false);
        }

        let cs = &mut self.channels[ch as usize];
        cs.note = Some(note);
        cs.velocity = vel;
        cs.held_by_sustain = false;

        let base_atten = compute_attenuation(cs.volume, cs.expression);
        let vel_atten = (127 - vel) >> 1;
        let total = (u32::from(base_atten) + u32::from(vel_atten)).min(63) as u8;

        // Keep the KSL bits, replace the total level
        self.state
            .modify_bits(operator_reg(ch, 1, REG_OP_LEVEL), 0x3F, total);

        self.write_freq(ch, note_freq(note), true);
    }

    /// Key off whatever is sounding on an OPL3 channel, ignoring sustain.
    pub fn release_channel(&mut self, ch: u8) {
        if ch as usize >= self.channels.len() {
            return;
        }
        let cs = &mut self.channels[ch as usize];
        if cs.note.is_none() {
            return;
        }
        cs.note = None;
        cs.held_by_sustain = false;
        self.state
            .modify_bits(channel_reg(ch, REG_KEYON_BLOCK_FNUM), KEY_ON_BIT, 0x00);
    }

    fn handle_note_off(&mut self, ch: u8, note: u8) {
        let cs = &mut self.channels[ch as usize];
        if cs.note != Some(note) {
            return;
        }
        if cs.sustain {
            cs.held_by_sustain = true;
            return;
        }
        self.release_channel(ch);
    }

    /// Rewrite a channel's frequency registers, preserving the current
    /// key-on state so a sounding envelope is not retriggered.
    pub fn bend_channel(&mut self, ch: u8, freq: NoteFreq) {
        if ch as usize >= self.channels.len() {
            return;
        }
        let b0 = self.state.read(channel_reg(ch, REG_KEYON_BLOCK_FNUM));
        self.write_freq(ch, freq, b0 & KEY_ON_BIT != 0);
    }

    fn write_freq(&mut self, ch: u8, freq: NoteFreq, key_on: bool) {
        self.state
            .write(channel_reg(ch, REG_FNUM_LOW), (freq.f_num & 0xFF) as u8);
        let b0 = ((freq.f_num >> 8) & 0x03) as u8
            | ((freq.block & 0x07) << 2)
            | if key_on { KEY_ON_BIT } else { 0 };
        self.state.write(channel_reg(ch, REG_KEYON_BLOCK_FNUM), b0);
    }

    // --- Control changes ---

    /// Apply a controller to a specific OPL3 channel (0-17). Used by the
    /// voice allocator to broadcast a MIDI channel's controllers across
    /// its pool; parameter-addressing CCs are not accepted here.
    pub fn apply_cc_to_channel(&mut self, ch: u8, cc: u8, val: u8) {
        if ch as usize >= self.channels.len() {
            return;
        }
        match cc {
            1 => self.cc_mod_wheel(ch, val),
            7 => self.cc_volume(ch, val),
            10 => self.cc_pan(ch, val),
            11 => self.cc_expression(ch, val),
            64 => self.cc_sustain(ch, val),
            74 => self.cc_brightness(ch, val),
            120 => self.cc_all_sound_off(ch),
            123 => self.cc_all_notes_off(ch),
            _ => {}
        }
    }

    fn handle_cc(&mut self, ch: u8, cc: u8, val: u8) {
        let cs = &mut self.channels[ch as usize];
        match cc {
            // NRPN/RPN addressing; selecting one nulls the other
            99 => {
                cs.nrpn_msb = val;
                (cs.rpn_msb, cs.rpn_lsb) = (PARAM_NULL, PARAM_NULL);
            }
            98 => {
                cs.nrpn_lsb = val;
                (cs.rpn_msb, cs.rpn_lsb) = (PARAM_NULL, PARAM_NULL);
            }
            101 => {
                cs.rpn_msb = val;
                (cs.nrpn_msb, cs.nrpn_lsb) = (PARAM_NULL, PARAM_NULL);
            }
            100 => {
                cs.rpn_lsb = val;
                (cs.nrpn_msb, cs.nrpn_lsb) = (PARAM_NULL, PARAM_NULL);
            }
            6 => self.data_entry_msb(ch, val),
            38 => self.data_entry_lsb(ch, val),
            _ => self.apply_cc_to_channel(ch, cc, val),
        }
    }

    fn data_entry_msb(&mut self, ch: u8, val: u8) {
        let cs = self.channels[ch as usize];
        if cs.nrpn_msb != PARAM_NULL && cs.nrpn_lsb != PARAM_NULL {
            self.nrpn_apply(ch, cs.nrpn_msb, cs.nrpn_lsb, val);
        } else if cs.rpn_msb == 0 && cs.rpn_lsb == 0 {
            // RPN 0x0000: pitch bend sensitivity, coarse
            self.channels[ch as usize].bend_range_semitones = val;
        }
    }

    fn data_entry_lsb(&mut self, ch: u8, val: u8) {
        let cs = &mut self.channels[ch as usize];
        if cs.rpn_msb == 0 && cs.rpn_lsb == 0 {
            // RPN 0x0000: pitch bend sensitivity, fine
            cs.bend_range_cents = val;
        }
    }

    fn cc_mod_wheel(&mut self, ch: u8, val: u8) {
        self.channels[ch as usize].mod_wheel = val;
        self.update_modulator_level(ch);
    }

    fn cc_volume(&mut self, ch: u8, val: u8) {
        self.channels[ch as usize].volume = val;
        self.update_carrier_level(ch);
    }

    fn cc_expression(&mut self, ch: u8, val: u8) {
        self.channels[ch as usize].expression = val;
        self.update_carrier_level(ch);
    }

    fn cc_brightness(&mut self, ch: u8, val: u8) {
        self.channels[ch as usize].brightness = val;
        self.update_modulator_level(ch);
    }

    fn cc_pan(&mut self, ch: u8, val: u8) {
        self.channels[ch as usize].pan = val;

        let pan_bits = if val <= 42 {
            0x10 // left speaker only
        } else if val >= 85 {
            0x20 // right speaker only
        } else {
            0x30
        };
        self.state
            .modify_bits(channel_reg(ch, REG_FEEDBACK_CONN), 0x30, pan_bits);
    }

    fn cc_sustain(&mut self, ch: u8, val: u8) {
        let cs = &mut self.channels[ch as usize];
        let was_on = cs.sustain;
        cs.sustain = val >= 64;

        if was_on && !cs.sustain && cs.held_by_sustain && cs.note.is_some() {
            self.release_channel(ch);
        }
    }

    fn cc_all_sound_off(&mut self, ch: u8) {
        // Key off and slam both release rates to fastest
        self.state
            .modify_bits(channel_reg(ch, REG_KEYON_BLOCK_FNUM), KEY_ON_BIT, 0x00);
        self.state
            .modify_bits(operator_reg(ch, 0, REG_OP_SUSTAIN_RELEASE), 0x0F, 0x0F);
        self.state
            .modify_bits(operator_reg(ch, 1, REG_OP_SUSTAIN_RELEASE), 0x0F, 0x0F);
        let cs = &mut self.channels[ch as usize];
        cs.note = None;
        cs.held_by_sustain = false;
    }

    fn cc_all_notes_off(&mut self, ch: u8) {
        if self.channels[ch as usize].note.is_some() {
            self.release_channel(ch);
        }
    }

    fn update_carrier_level(&mut self, ch: u8) {
        let cs = self.channels[ch as usize];
        let base = compute_attenuation(cs.volume, cs.expression);
        let vel_atten = match cs.note {
            Some(_) => (127 - cs.velocity) >> 1,
            None => 0,
        };
        let total = (u32::from(base) + u32::from(vel_atten)).min(63) as u8;
        self.state
            .modify_bits(operator_reg(ch, 1, REG_OP_LEVEL), 0x3F, total);
    }

    fn update_modulator_level(&mut self, ch: u8) {
        let cs = self.channels[ch as usize];
        let atten = modulator_attenuation(cs.mod_wheel, cs.brightness);
        self.state
            .modify_bits(operator_reg(ch, 0, REG_OP_LEVEL), 0x3F, atten);
    }

    // --- Pitch bend ---

    fn handle_pitch_bend(&mut self, ch: u8, bend: u16) {
        let cs = self.channels[ch as usize];
        let Some(note) = cs.note else { return };

        let range =
            f64::from(cs.bend_range_semitones) + f64::from(cs.bend_range_cents) / 100.0;
        let semitones = f64::from(i32::from(bend) - 8192) * range / 8192.0;
        let freq = fnum_for_hz(midi_note_hz(f64::from(note) + semitones));

        self.bend_channel(ch, freq);
    }

    // --- NRPN parameter tree ---

    /// Apply an NRPN directly to an OPL3 channel (0-17), bypassing the
    /// CC state machine. `msb` selects the addressing level: 0-3 operator
    /// (2-3 address the 4-op partner), 4 channel, 5 global.
    pub fn direct_nrpn(&mut self, ch: u8, msb: u8, lsb: u8, val: u8) {
        if ch as usize >= self.channels.len() {
            return;
        }
        self.nrpn_apply(ch, msb, lsb, val);
    }

    fn nrpn_apply(&mut self, ch: u8, msb: u8, lsb: u8, val: u8) {
        match msb {
            0..=3 => self.nrpn_operator(ch, msb, lsb, val & 0x7F),
            4 => self.nrpn_channel(ch, lsb, val & 0x7F),
            5 => self.nrpn_global(lsb, val & 0x7F),
            _ => {}
        }
    }

    fn nrpn_operator(&mut self, ch: u8, op_idx: u8, param: u8, val: u8) {
        // 0-1 are this channel's operators; 2-3 sit on the 4-op partner
        let (target, slot) = if op_idx <= 1 {
            (ch, op_idx as usize)
        } else {
            let Some(partner) = four_op_partner(ch) else { return };
            (partner, op_idx as usize - 2)
        };

        let on_off = |bit: u8| if val >= 64 { bit } else { 0 };

        match param {
            0 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_ATTACK_DECAY),
                0xF0,
                (val >> 3) << 4,
            ),
            1 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_ATTACK_DECAY),
                0x0F,
                val >> 3,
            ),
            2 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_SUSTAIN_RELEASE),
                0xF0,
                (val >> 3) << 4,
            ),
            3 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_SUSTAIN_RELEASE),
                0x0F,
                val >> 3,
            ),
            4 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_WAVEFORM),
                0x07,
                val >> 4,
            ),
            5 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_FLAGS),
                0x0F,
                val >> 3,
            ),
            6 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_LEVEL),
                0x3F,
                val >> 1,
            ),
            7 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_LEVEL),
                0xC0,
                (val >> 5) << 6,
            ),
            8 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_FLAGS),
                0x80,
                on_off(0x80),
            ),
            9 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_FLAGS),
                0x40,
                on_off(0x40),
            ),
            10 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_FLAGS),
                0x20,
                on_off(0x20),
            ),
            11 => self.state.modify_bits(
                operator_reg(target, slot, REG_OP_FLAGS),
                0x10,
                on_off(0x10),
            ),
            _ => {}
        }
    }

    fn nrpn_channel(&mut self, ch: u8, param: u8, val: u8) {
        let on_off = |bit: u8| if val >= 64 { bit } else { 0 };

        match param {
            0 => self.state.modify_bits(
                channel_reg(ch, REG_FEEDBACK_CONN),
                0x0E,
                (val >> 4) << 1,
            ),
            1 => self
                .state
                .modify_bits(channel_reg(ch, REG_FEEDBACK_CONN), 0x01, on_off(0x01)),
            2 => self
                .state
                .modify_bits(channel_reg(ch, REG_FEEDBACK_CONN), 0x10, on_off(0x10)),
            3 => self
                .state
                .modify_bits(channel_reg(ch, REG_FEEDBACK_CONN), 0x20, on_off(0x20)),
            4 => {
                if let Some(bit) = four_op_enable_bit(ch) {
                    self.state
                        .modify_bits(REG_FOUR_OP_ENABLE, bit, on_off(bit));
                }
            }
            5 => {
                // The second connection bit of a 4-op voice lives on the
                // paired channel's C0 register. This is the supported
                // path to it.
                if let Some(partner) = four_op_partner(ch) {
                    self.state.modify_bits(
                        channel_reg(partner, REG_FEEDBACK_CONN),
                        0x01,
                        on_off(0x01),
                    );
                }
            }
            _ => {}
        }
    }

    fn nrpn_global(&mut self, param: u8, val: u8) {
        let on_off = |bit: u8| if val >= 64 { bit } else { 0 };
        match param {
            0 => self
                .state
                .modify_bits(u16::from(REG_RHYTHM), 0x80, on_off(0x80)),
            1 => self
                .state
                .modify_bits(u16::from(REG_RHYTHM), 0x40, on_off(0x40)),
            2 => self
                .state
                .modify_bits(u16::from(REG_RHYTHM), 0x20, on_off(0x20)),
            _ => {}
        }
    }

    // --- Percussion ---

    /// Trigger a drum, pitched from a MIDI note.
    ///
    /// Writes the frequency to the drum's channel with the B0 key-on bit
    /// left clear (percussion key-on lives in the rhythm register), sets
    /// the drum operator's level from velocity, then raises the drum's
    /// rhythm bit.
    pub fn perc_note_on(&mut self, drum: Drum, note: u8, vel: u8) {
        let (note, vel) = (note & 0x7F, vel & 0x7F);
        let fc = drum.freq_channel();
        let nf = note_freq(note);

        self.state
            .write(channel_reg(fc, REG_FNUM_LOW), (nf.f_num & 0xFF) as u8);
        let b0 = ((nf.f_num >> 8) & 0x03) as u8 | ((nf.block & 0x07) << 2);
        self.state.write(channel_reg(fc, REG_KEYON_BLOCK_FNUM), b0);

        let vel_atten = (127 - vel) >> 1;
        self.state.modify_bits(drum.level_reg(), 0x3F, vel_atten);

        self.state
            .modify_bits(u16::from(REG_RHYTHM), drum.trigger_bit(), drum.trigger_bit());
    }

    /// Silence a drum by dropping its rhythm-register bit.
    pub fn perc_note_off(&mut self, drum: Drum) {
        self.state
            .modify_bits(u16::from(REG_RHYTHM), drum.trigger_bit(), 0x00);
    }

    // --- SysEx ---

    fn handle_sysex(&mut self, msg: &[u8]) {
        // Shortest valid frame: F0 id dev cmd F7
        if msg.len() < 5 || msg[0] != 0xF0 || msg[msg.len() - 1] != 0xF7 {
            return;
        }
        if msg[1] != MANUFACTURER_ID {
            return;
        }
        if msg[2] != self.device_id && msg[2] != 0x7F && self.device_id != 0x7F {
            return;
        }

        let cmd = msg[3];
        let payload = &msg[4..msg.len() - 1];

        match cmd {
            CMD_REG_WRITE_7 => self.sysex_reg_write_7(payload),
            CMD_BATCH_WRITE_7 => self.sysex_batch_write_7(payload),
            CMD_REG_WRITE_8 => self.sysex_reg_write_8(payload),
            CMD_BATCH_WRITE_8 => self.sysex_batch_write_8(payload),
            CMD_PATCH_DUMP => self.sysex_patch_dump(payload),
            CMD_PATCH_LOAD => self.sysex_patch_load(payload),
            CMD_RESET_ALL => self.init(),
            CMD_HW_RESET => self.sysex_hw_reset(),
            _ => debug!("dropping unknown SysEx command {cmd:#04x}"),
        }
    }

    fn sysex_reg_write_7(&mut self, payload: &[u8]) {
        let [hi, lo, val, ..] = *payload else { return };
        let addr = u16::from(hi) << 7 | u16::from(lo);
        if addr > 0x1FF {
            return;
        }
        self.state.write(addr, val);
    }

    fn sysex_reg_write_8(&mut self, payload: &[u8]) {
        let [hi, lo, val_hi, val_lo, ..] = *payload else { return };
        let addr = u16::from(hi) << 7 | u16::from(lo);
        if addr > 0x1FF {
            return;
        }
        self.state.write(addr, (val_hi << 4) | (val_lo & 0x0F));
    }

    fn sysex_batch_write_7(&mut self, payload: &[u8]) {
        let Some((&count, entries)) = payload.split_first() else { return };
        for entry in entries.chunks_exact(3).take(count as usize) {
            let addr = u16::from(entry[0]) << 7 | u16::from(entry[1]);
            if addr > 0x1FF {
                continue; // skip this entry, keep the rest of the batch
            }
            self.state.write(addr, entry[2]);
        }
    }

    fn sysex_batch_write_8(&mut self, payload: &[u8]) {
        let Some((&count, entries)) = payload.split_first() else { return };
        for entry in entries.chunks_exact(4).take(count as usize) {
            let addr = u16::from(entry[0]) << 7 | u16::from(entry[1]);
            if addr > 0x1FF {
                continue;
            }
            self.state.write(addr, (entry[2] << 4) | (entry[3] & 0x0F));
        }
    }

    /// Patch byte layout per operator: 0x20, 0x40, 0x60, 0x80, 0xE0 and
    /// six reserved bytes, each carried as two nibbles.
    const PATCH_OP_BYTES: usize = 11;

    fn sysex_patch_dump(&mut self, payload: &[u8]) {
        let Some(&ch) = payload.first() else { return };
        if ch as usize >= self.channels.len() || self.midi_out.is_none() {
            return;
        }

        let partner = four_op_partner(ch);
        let is_four_op = match four_op_enable_bit(ch) {
            Some(bit) => self.state.read(REG_FOUR_OP_ENABLE) & bit != 0,
            None => false,
        };
        let num_ops = if is_four_op { 4 } else { 2 };

        let mut msg = Vec::with_capacity(7 + num_ops * Self::PATCH_OP_BYTES * 2 + 4);
        msg.extend_from_slice(&[0xF0, MANUFACTURER_ID, self.device_id, CMD_PATCH_LOAD, ch]);

        for op in 0..num_ops {
            let (target, slot) = if op < 2 {
                (ch, op)
            } else {
                (partner.unwrap(), op - 2)
            };

            let mut regs = [0u8; Self::PATCH_OP_BYTES];
            regs[0] = self.state.read(operator_reg(target, slot, REG_OP_FLAGS));
            regs[1] = self.state.read(operator_reg(target, slot, REG_OP_LEVEL));
            regs[2] = self.state.read(operator_reg(target, slot, REG_OP_ATTACK_DECAY));
            regs[3] = self
                .state
                .read(operator_reg(target, slot, REG_OP_SUSTAIN_RELEASE));
            regs[4] = self.state.read(operator_reg(target, slot, REG_OP_WAVEFORM));

            for reg in regs {
                msg.push((reg >> 4) & 0x0F);
                msg.push(reg & 0x0F);
            }
        }

        let fb_conn = self.state.read(channel_reg(ch, REG_FEEDBACK_CONN));
        msg.push((fb_conn >> 4) & 0x0F);
        msg.push(fb_conn & 0x0F);

        if is_four_op {
            let fb_conn2 = self
                .state
                .read(channel_reg(partner.unwrap(), REG_FEEDBACK_CONN));
            msg.push((fb_conn2 >> 4) & 0x0F);
            msg.push(fb_conn2 & 0x0F);
        }

        msg.push(0xF7);

        if let Some(out) = self.midi_out.as_mut() {
            out(&msg);
        }
    }

    fn sysex_patch_load(&mut self, payload: &[u8]) {
        let Some((&ch, nibbles)) = payload.split_first() else { return };
        if ch as usize >= self.channels.len() {
            return;
        }

        let partner = four_op_partner(ch);
        let four_op_len = Self::PATCH_OP_BYTES * 2 * 4 + 4;
        let is_four_op = nibbles.len() >= four_op_len;
        if is_four_op && partner.is_none() {
            // A 4-op payload cannot half-apply to an unpairable channel
            debug!("rejecting 4-op patch load for unpairable channel {ch}");
            return;
        }
        let max_ops = if is_four_op { 4 } else { 2 };

        let mut rest = nibbles;
        for op in 0..max_ops {
            if rest.len() < Self::PATCH_OP_BYTES * 2 {
                break;
            }
            let (target, slot) = if op < 2 {
                (ch, op)
            } else {
                (partner.unwrap(), op - 2)
            };

            let mut regs = [0u8; Self::PATCH_OP_BYTES];
            for (r, pair) in regs.iter_mut().zip(rest.chunks_exact(2)) {
                *r = (pair[0] << 4) | (pair[1] & 0x0F);
            }
            rest = &rest[Self::PATCH_OP_BYTES * 2..];

            self.state
                .write(operator_reg(target, slot, REG_OP_FLAGS), regs[0]);
            self.state
                .write(operator_reg(target, slot, REG_OP_LEVEL), regs[1]);
            self.state
                .write(operator_reg(target, slot, REG_OP_ATTACK_DECAY), regs[2]);
            self.state
                .write(operator_reg(target, slot, REG_OP_SUSTAIN_RELEASE), regs[3]);
            self.state
                .write(operator_reg(target, slot, REG_OP_WAVEFORM), regs[4]);
        }

        // Feedback + connection nibbles; pan bits are not part of a patch
        if rest.len() >= 2 {
            let fb_conn = (rest[0] << 4) | (rest[1] & 0x0F);
            self.state
                .modify_bits(channel_reg(ch, REG_FEEDBACK_CONN), 0x0F, fb_conn & 0x0F);
            rest = &rest[2..];
        }

        if max_ops == 4 && rest.len() >= 2 {
            let fb_conn2 = (rest[0] << 4) | (rest[1] & 0x0F);
            self.state.modify_bits(
                channel_reg(partner.unwrap(), REG_FEEDBACK_CONN),
                0x0F,
                fb_conn2 & 0x0F,
            );
        }
    }

    fn sysex_hw_reset(&mut self) {
        self.state.write(0x0FE, 0x00);
        self.state.write(0x0FF, 0x00);
        self.init();
    }
}

impl std::fmt::Debug for DirectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectMode")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CaptureMidiOut, direct_fixture};

    fn shadow_snapshot(direct: &DirectMode) -> Vec<u8> {
        (0..512u16).map(|addr| direct.shadow().read(addr)).collect()
    }

    #[test]
    fn test_attenuation_formula() {
        assert_eq!(compute_attenuation(0, 127), 63);
        assert_eq!(compute_attenuation(127, 0), 63);
        assert_eq!(compute_attenuation(127, 127), 0);
        assert_eq!(compute_attenuation(100, 127), 3);
        assert_eq!(compute_attenuation(64, 127), 8);
    }

    #[test]
    fn test_modulator_attenuation_formula() {
        assert_eq!(modulator_attenuation(0, 64), 63);
        assert_eq!(modulator_attenuation(127, 127), 0);
        assert_eq!(modulator_attenuation(127, 0), 63);
    }

    #[test]
    fn test_note_on_writes_frequency_and_key_on() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);

        // Note 60: f_num 690 (0x2B2), block 3
        assert_eq!(d.shadow().read(0x0A0), 0xB2);
        assert_eq!(d.shadow().read(0x0B0), 0x2E);
        assert_eq!(d.channel_state(0).note, Some(60));
    }

    #[test]
    fn test_note_on_velocity_scales_carrier_level() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);

        // base attenuation 3 for (100, 127), velocity adds (127-100)/2 = 13
        let carrier = operator_reg(0, 1, REG_OP_LEVEL);
        assert_eq!(d.shadow().read(carrier) & 0x3F, 16);
    }

    #[test]
    fn test_note_on_preserves_ksl_bits() {
        let (mut d, _) = direct_fixture();
        let carrier = operator_reg(0, 1, REG_OP_LEVEL);
        d.shadow_mut().write(carrier, 0xC0); // KSL = 3
        d.process(&[0x90, 60, 127]);
        assert_eq!(d.shadow().read(carrier) & 0xC0, 0xC0);
    }

    #[test]
    fn test_velocity_zero_is_note_off() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);
        d.process(&[0x90, 60, 0]);
        assert_eq!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);
        assert_eq!(d.channel_state(0).note, None);
    }

    #[test]
    fn test_note_off_for_other_note_is_ignored() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);
        d.process(&[0x80, 61, 0]);
        assert_ne!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);
        assert_eq!(d.channel_state(0).note, Some(60));
    }

    #[test]
    fn test_sustain_holds_note_until_pedal_release() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);
        d.process(&[0xB0, 64, 127]); // pedal down
        d.process(&[0x80, 60, 0]);
        assert_ne!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);

        d.process(&[0xB0, 64, 0]); // pedal up releases the held note
        assert_eq!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);
        assert_eq!(d.channel_state(0).note, None);
    }

    #[test]
    fn test_pitch_bend_preserves_key_on() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);
        let carrier_before = d.shadow().read(operator_reg(0, 1, REG_OP_LEVEL));

        // Bend +4096 with the default 2-semitone range = exactly +1 semitone
        d.process(&[0xE0, 0x00, 0x60]);
        assert_eq!(d.shadow().read(0x0A0), (731u16 & 0xFF) as u8);
        assert_ne!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);
        assert_eq!(d.shadow().read(operator_reg(0, 1, REG_OP_LEVEL)), carrier_before);
    }

    #[test]
    fn test_pitch_bend_extremes_stay_in_range() {
        let (mut d, _) = direct_fixture();
        for (note, bend) in [(60u8, [0x00u8, 0x00u8]), (60, [0x7F, 0x7F]), (0, [0x00, 0x00]), (114, [0x7F, 0x7F])] {
            d.process(&[0x90, note, 100]);
            d.process(&[0xE0, bend[0], bend[1]]);
            let b0 = d.shadow().read(0x0B0);
            // F-num high bits and block always fit their fields; key-on
            // survives the rewrite
            assert_ne!(b0 & KEY_ON_BIT, 0, "note {note}");
            d.process(&[0x80, note, 0]);
        }
    }

    #[test]
    fn test_pitch_bend_without_note_is_ignored() {
        let (mut d, _) = direct_fixture();
        let before = shadow_snapshot(&d);
        d.process(&[0xE0, 0x00, 0x00]);
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_volume_change_recomputes_carrier_level() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 127]); // full velocity: no velocity attenuation
        d.process(&[0xB0, 7, 64]);
        let carrier = operator_reg(0, 1, REG_OP_LEVEL);
        assert_eq!(d.shadow().read(carrier) & 0x3F, 8);
    }

    #[test]
    fn test_pan_thresholds() {
        let (mut d, _) = direct_fixture();
        d.process(&[0xB0, 10, 0]);
        assert_eq!(d.shadow().read(0x0C0) & 0x30, 0x10);
        d.process(&[0xB0, 10, 100]);
        assert_eq!(d.shadow().read(0x0C0) & 0x30, 0x20);
        d.process(&[0xB0, 10, 64]);
        assert_eq!(d.shadow().read(0x0C0) & 0x30, 0x30);
        // Feedback bits stay put throughout
        assert_eq!(d.shadow().read(0x0C0) & 0x0F, 0x08);
    }

    #[test]
    fn test_all_sound_off_forces_fast_release() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);
        d.process(&[0xB0, 120, 0]);
        assert_eq!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);
        assert_eq!(d.shadow().read(operator_reg(0, 0, REG_OP_SUSTAIN_RELEASE)) & 0x0F, 0x0F);
        assert_eq!(d.shadow().read(operator_reg(0, 1, REG_OP_SUSTAIN_RELEASE)) & 0x0F, 0x0F);
    }

    #[test]
    fn test_all_notes_off_keys_off_only() {
        let (mut d, _) = direct_fixture();
        d.process(&[0x90, 60, 100]);
        let release_before = d.shadow().read(operator_reg(0, 1, REG_OP_SUSTAIN_RELEASE));
        d.process(&[0xB0, 123, 0]);
        assert_eq!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);
        assert_eq!(
            d.shadow().read(operator_reg(0, 1, REG_OP_SUSTAIN_RELEASE)),
            release_before
        );
    }

    #[test]
    fn test_nrpn_waveform_change() {
        let (mut d, _) = direct_fixture();
        // NRPN (0, 4) = waveform on the modulator, data 16 scales to 1
        d.process(&[0xB0, 99, 0]);
        d.process(&[0xB0, 98, 4]);
        d.process(&[0xB0, 6, 16]);
        assert_eq!(d.shadow().read(operator_reg(0, 0, REG_OP_WAVEFORM)) & 0x07, 1);
    }

    #[test]
    fn test_data_entry_without_nrpn_address_is_ignored() {
        let (mut d, _) = direct_fixture();
        let before = shadow_snapshot(&d);
        d.process(&[0xB0, 6, 64]);
        assert_eq!(shadow_snapshot(&d), before);

        // Half-selected NRPN (MSB only) must also be ignored
        d.process(&[0xB0, 99, 0]);
        d.process(&[0xB0, 6, 64]);
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_nrpn_partner_operator_addressing() {
        let (mut d, _) = direct_fixture();
        // Operator select 2 = first operator of the 4-op partner (ch 3)
        d.direct_nrpn(0, 2, 6, 127);
        let partner_mod = operator_reg(3, 0, REG_OP_LEVEL);
        assert_eq!(d.shadow().read(partner_mod) & 0x3F, 127 >> 1);
    }

    #[test]
    fn test_nrpn_partner_operator_on_unpairable_channel() {
        let (mut d, _) = direct_fixture();
        let before = shadow_snapshot(&d);
        d.direct_nrpn(6, 2, 6, 127); // channel 6 has no partner
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_nrpn_four_op_enable() {
        let (mut d, _) = direct_fixture();
        d.direct_nrpn(0, 4, 4, 127);
        assert_eq!(d.shadow().read(REG_FOUR_OP_ENABLE) & 0x01, 0x01);
        d.direct_nrpn(0, 4, 4, 0);
        assert_eq!(d.shadow().read(REG_FOUR_OP_ENABLE) & 0x01, 0x00);

        // Port 1 pair lands in the upper bit group
        d.direct_nrpn(10, 4, 4, 127);
        assert_eq!(d.shadow().read(REG_FOUR_OP_ENABLE) & 0x10, 0x10);
    }

    #[test]
    fn test_nrpn_secondary_connection_bit() {
        let (mut d, _) = direct_fixture();
        d.direct_nrpn(1, 4, 5, 127);
        assert_eq!(d.shadow().read(channel_reg(4, REG_FEEDBACK_CONN)) & 0x01, 0x01);
    }

    #[test]
    fn test_nrpn_global_percussion_mode() {
        let (mut d, _) = direct_fixture();
        d.direct_nrpn(0, 5, 2, 127);
        assert_eq!(d.shadow().read(u16::from(REG_RHYTHM)) & 0x20, 0x20);
        d.direct_nrpn(0, 5, 2, 0);
        assert_eq!(d.shadow().read(u16::from(REG_RHYTHM)) & 0x20, 0x00);
    }

    #[test]
    fn test_rpn_sets_bend_range() {
        let (mut d, _) = direct_fixture();
        d.process(&[0xB0, 101, 0]);
        d.process(&[0xB0, 100, 0]);
        d.process(&[0xB0, 6, 12]);
        d.process(&[0xB0, 38, 50]);
        assert_eq!(d.channel_state(0).bend_range_semitones, 12);
        assert_eq!(d.channel_state(0).bend_range_cents, 50);

        // Selecting an NRPN nulls the RPN address
        d.process(&[0xB0, 99, 3]);
        assert_eq!(d.channel_state(0).rpn_msb, 0x7F);
    }

    #[test]
    fn test_sysex_reg_write_7() {
        let (mut d, _) = direct_fixture();
        // Address 0x1C3 = hi 3, lo 0x43
        d.process(&[0xF0, 0x7D, 0x7F, CMD_REG_WRITE_7, 0x03, 0x43, 0x25, 0xF7]);
        assert_eq!(d.shadow().read(0x1C3), 0x25);
    }

    #[test]
    fn test_sysex_reg_write_8_nibbles() {
        let (mut d, _) = direct_fixture();
        d.process(&[0xF0, 0x7D, 0x7F, CMD_REG_WRITE_8, 0x00, 0x43, 0x0A, 0x0B, 0xF7]);
        assert_eq!(d.shadow().read(0x043), 0xAB);
    }

    #[test]
    fn test_sysex_out_of_range_address_dropped() {
        let (mut d, _) = direct_fixture();
        let before = shadow_snapshot(&d);
        // hi 4 = address 0x200, beyond the register file
        d.process(&[0xF0, 0x7D, 0x7F, CMD_REG_WRITE_7, 0x04, 0x00, 0x55, 0xF7]);
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_sysex_batch_skips_bad_entry() {
        let (mut d, _) = direct_fixture();
        d.process(&[
            0xF0, 0x7D, 0x7F, CMD_BATCH_WRITE_7, 3, // count
            0x00, 0x43, 0x11, // ok
            0x04, 0x00, 0x22, // out of range, skipped
            0x01, 0x43, 0x33, // ok (0x0C3)
            0xF7,
        ]);
        assert_eq!(d.shadow().read(0x043), 0x11);
        assert_eq!(d.shadow().read(0x0C3), 0x33);
    }

    #[test]
    fn test_sysex_device_id_filter() {
        let sink = crate::testing::CaptureSink::new();
        let hw = crate::HardwareBuffer::new(Box::new(sink));
        let mut d = DirectMode::new(crate::ShadowState::new(hw), 5);
        d.init();

        // Wrong id: dropped
        d.process(&[0xF0, 0x7D, 0x06, CMD_REG_WRITE_7, 0x00, 0x43, 0x11, 0xF7]);
        assert_eq!(d.shadow().read(0x043), 0x3F); // untouched reset value

        // Own id and broadcast id: accepted
        d.process(&[0xF0, 0x7D, 0x05, CMD_REG_WRITE_7, 0x00, 0x43, 0x11, 0xF7]);
        assert_eq!(d.shadow().read(0x043), 0x11);
        d.process(&[0xF0, 0x7D, 0x7F, CMD_REG_WRITE_7, 0x00, 0x43, 0x22, 0xF7]);
        assert_eq!(d.shadow().read(0x043), 0x22);
    }

    #[test]
    fn test_sysex_malformed_frames_dropped() {
        let (mut d, _) = direct_fixture();
        let before = shadow_snapshot(&d);
        // Missing terminator
        d.process(&[0xF0, 0x7D, 0x7F, CMD_REG_WRITE_7, 0x00, 0x43, 0x11]);
        // Wrong manufacturer
        d.process(&[0xF0, 0x43, 0x7F, CMD_REG_WRITE_7, 0x00, 0x43, 0x11, 0xF7]);
        // Unknown command
        d.process(&[0xF0, 0x7D, 0x7F, 0x55, 0x00, 0xF7]);
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_unknown_status_ignored() {
        let (mut d, _) = direct_fixture();
        let before = shadow_snapshot(&d);
        d.process(&[0xC0, 0x05]); // program change is not handled
        d.process(&[0xA0, 60, 10]); // poly aftertouch either
        d.process(&[]);
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_patch_dump_replay_is_identity() {
        let (mut d, _) = direct_fixture();
        let midi_out = CaptureMidiOut::new();
        d.set_midi_output(midi_out.sink());

        // Give channel 2 a distinctive patch first
        d.direct_nrpn(2, 0, 0, 88); // modulator attack
        d.direct_nrpn(2, 1, 4, 100); // carrier waveform
        d.direct_nrpn(2, 4, 0, 127); // feedback

        d.process(&[0xF0, 0x7D, 0x7F, CMD_PATCH_DUMP, 2, 0xF7]);
        let msgs = midi_out.messages();
        assert_eq!(msgs.len(), 1);
        let response = &msgs[0];
        assert_eq!(&response[..5], &[0xF0, 0x7D, 0x7F, CMD_PATCH_LOAD, 2]);
        // 2-op dump: 5 header + 44 operator nibbles + 2 channel nibbles + F7
        assert_eq!(response.len(), 52);

        let before = shadow_snapshot(&d);
        d.process(response);
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_patch_load_rejects_four_op_on_unpairable_channel() {
        let (mut d, _) = direct_fixture();
        let before = shadow_snapshot(&d);

        let mut msg = vec![0xF0, 0x7D, 0x7F, CMD_PATCH_LOAD, 6];
        msg.extend(std::iter::repeat_n(0x05u8, 92));
        msg.push(0xF7);
        d.process(&msg);
        assert_eq!(shadow_snapshot(&d), before);
    }

    #[test]
    fn test_patch_load_two_op() {
        let (mut d, _) = direct_fixture();
        let mut msg = vec![0xF0, 0x7D, 0x7F, CMD_PATCH_LOAD, 0];
        // Operator 0: 0x20 register = 0xE1 (nibbles E, 1), rest zero
        msg.extend([0x0E, 0x01]);
        msg.extend([0u8; 20]);
        // Operator 1: all zero
        msg.extend([0u8; 22]);
        // Channel byte: feedback/connection nibble = 0x7
        msg.extend([0x00, 0x07]);
        msg.push(0xF7);

        d.process(&msg);
        assert_eq!(d.shadow().read(operator_reg(0, 0, REG_OP_FLAGS)), 0xE1);
        assert_eq!(d.shadow().read(operator_reg(0, 1, REG_OP_FLAGS)), 0x00);
        // Low nibble applied, pan bits preserved from the default patch
        assert_eq!(d.shadow().read(0x0C0), 0x37);
    }

    #[test]
    fn test_reset_all_restores_default_patch() {
        let (mut d, _) = direct_fixture();
        d.direct_nrpn(0, 4, 0, 0); // zero the feedback
        d.process(&[0x90, 60, 100]);
        d.process(&[0xF0, 0x7D, 0x7F, CMD_RESET_ALL, 0xF7]);

        assert_eq!(d.shadow().read(0x0C0), 0x38);
        assert_eq!(d.shadow().read(operator_reg(0, 0, REG_OP_LEVEL)), 0x20);
        assert_eq!(d.shadow().read(operator_reg(0, 1, REG_OP_LEVEL)), 0x00);
        assert_eq!(d.shadow().read(0x0B0) & KEY_ON_BIT, 0);
        assert_eq!(d.channel_state(0).note, None);
    }

    #[test]
    fn test_hw_reset_touches_reset_registers() {
        let (mut d, _) = direct_fixture();
        d.shadow_mut().write(0x0FE, 0x55);
        d.process(&[0xF0, 0x7D, 0x7F, CMD_HW_RESET, 0xF7]);
        assert_eq!(d.shadow().read(0x0FE), 0x00);
        assert_eq!(d.shadow().read(0x0C0), 0x38);
    }

    #[test]
    fn test_perc_note_on_drives_rhythm_register() {
        let (mut d, _) = direct_fixture();
        d.perc_note_on(Drum::BassDrum, 36, 80);

        // Note 36: f_num 690, block 1; no key-on bit in B0
        assert_eq!(d.shadow().read(0x0A6), 0xB2);
        assert_eq!(d.shadow().read(0x0B6), 0x06);
        assert_eq!(d.shadow().read(u16::from(REG_RHYTHM)) & 0x10, 0x10);
        // Velocity 80 on the channel 6 carrier
        assert_eq!(d.shadow().read(operator_reg(6, 1, REG_OP_LEVEL)) & 0x3F, 23);

        d.perc_note_off(Drum::BassDrum);
        assert_eq!(d.shadow().read(u16::from(REG_RHYTHM)) & 0x10, 0x00);
    }
}
