//! Polyphonic voice allocation.
//!
//! Sits in front of [`DirectMode`] and virtualises the 16 MIDI channels
//! over the 18 OPL3 channels. Each MIDI channel owns a configurable pool
//! of OPL3 channels and plays every note on `unison_count` of them at
//! once, spread by a detune amount. When the pool runs dry the oldest
//! sounding note group is stolen wholesale, so unison voices never
//! fragment.
//!
//! Controllers are shadowed per MIDI channel and broadcast to the pool;
//! pools are reshaped at runtime through the voice-config SysEx, and the
//! five OPL3 percussion instruments can be bound to MIDI channels of
//! their own.

use log::debug;

use crate::direct::{
    CMD_PERC_CONFIG, CMD_PERC_QUERY, CMD_RESET_ALL, CMD_VOICE_CONFIG, CMD_VOICE_QUERY,
    DirectMode, Drum, MANUFACTURER_ID, MidiOutput, PARAM_NULL,
};
use crate::registers::{
    NUM_CHANNELS, NUM_MIDI_CHANNELS, NoteFreq, fnum_for_hz, four_op_partner, midi_note_hz,
};

/// Voice pool configuration for one MIDI channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConfig {
    /// OPL3 channels owned by the MIDI channel, in allocation order.
    pub opl3_channels: Vec<u8>,
    /// Voices sounded per note; 1 means plain polyphony.
    pub unison_count: u8,
    /// Total unison spread in cents (0-100).
    pub detune_cents: u8,
    /// Count 4-op pairs as a single voice slot.
    pub four_op: bool,
    /// Spread unison voices across the stereo field.
    pub pan_split: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            opl3_channels: Vec::new(),
            unison_count: 1,
            detune_cents: 10,
            four_op: false,
            pan_split: false,
        }
    }
}

/// One OPL3 channel's slot in a MIDI channel's pool.
#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    note: Option<u8>,
    velocity: u8,
    /// Monotonic allocation stamp, shared by a unison group.
    timestamp: u64,
    /// Frequency actually written, including detune and bend.
    freq: NoteFreq,
    /// Held by the sustain pedal after its note-off.
    sustained: bool,
}

/// Allocation and controller state for one MIDI channel.
#[derive(Debug)]
struct MidiChannelState {
    config: VoiceConfig,
    /// One slot per entry in `config.opl3_channels`.
    voices: Vec<Voice>,

    // Shadowed controllers, applied to OPL3 channels as they enter the pool
    volume: u8,
    expression: u8,
    pan: u8,
    mod_wheel: u8,
    brightness: u8,
    sustain: bool,
    pitch_bend: u16,
    bend_range_semitones: u8,
    bend_range_cents: u8,
    nrpn_msb: u8,
    nrpn_lsb: u8,
    rpn_msb: u8,
    rpn_lsb: u8,
}

impl Default for MidiChannelState {
    fn default() -> Self {
        Self {
            config: VoiceConfig::default(),
            voices: Vec::new(),
            volume: 100,
            expression: 127,
            pan: 64,
            mod_wheel: 0,
            brightness: 64,
            sustain: false,
            pitch_bend: 8192,
            bend_range_semitones: 2,
            bend_range_cents: 0,
            nrpn_msb: PARAM_NULL,
            nrpn_lsb: PARAM_NULL,
            rpn_msb: PARAM_NULL,
            rpn_lsb: PARAM_NULL,
        }
    }
}

/// Frequency for one unison voice: base note, pitch bend, and this
/// voice's share of the detune spread.
fn voice_freq(
    note: u8,
    unison_idx: usize,
    unison: usize,
    detune_cents: u8,
    bend: u16,
    range_semitones: u8,
    range_cents: u8,
) -> NoteFreq {
    let mut semitones = f64::from(note);
    if bend != 8192 {
        let range = f64::from(range_semitones) + f64::from(range_cents) / 100.0;
        semitones += f64::from(i32::from(bend) - 8192) * range / 8192.0;
    }
    if unison > 1 {
        let cents = (unison_idx as f64 - (unison as f64 - 1.0) / 2.0)
            * f64::from(detune_cents)
            / (unison as f64 - 1.0);
        semitones += cents / 100.0;
    }
    fnum_for_hz(midi_note_hz(semitones))
}

/// Pan position for a unison voice. Even counts split evenly from hard
/// left to hard right; odd counts centre the middle voice and spread the
/// rest to either side. Callers only invoke this with `unison > 1`.
fn unison_pan(idx: usize, unison: usize) -> u8 {
    if unison % 2 == 0 {
        (idx * 127 / (unison - 1)) as u8
    } else {
        let centre = unison / 2;
        match idx.cmp(&centre) {
            std::cmp::Ordering::Equal => 64,
            std::cmp::Ordering::Less => (idx * 64 / centre) as u8,
            std::cmp::Ordering::Greater => (64 + (idx - centre) * 63 / (unison - 1 - centre)) as u8,
        }
    }
}

/// Polyphonic voice allocator over [`DirectMode`].
pub struct VoiceAllocator {
    direct: DirectMode,
    device_id: u8,
    midi_out: Option<MidiOutput>,
    timestamp: u64,
    channels: [MidiChannelState; NUM_MIDI_CHANNELS],

    perc_mode: bool,
    drum_channel: [Option<u8>; 5],
    drum_note: [Option<u8>; 5],
}

impl VoiceAllocator {
    /// Create an allocator with the default 1:1 mapping: MIDI channel n
    /// owns OPL3 channel n, one voice per note.
    pub fn new(direct: DirectMode, device_id: u8) -> Self {
        let channels = std::array::from_fn(|i| {
            let mut mcs = MidiChannelState::default();
            mcs.config.opl3_channels = vec![i as u8];
            mcs.voices = vec![Voice::default()];
            mcs
        });
        Self {
            direct,
            device_id,
            midi_out: None,
            timestamp: 0,
            channels,
            perc_mode: false,
            drum_channel: [None; 5],
            drum_note: [None; 5],
        }
    }

    /// Install the sink for SysEx query responses.
    pub fn set_midi_output(&mut self, sink: MidiOutput) {
        self.midi_out = Some(sink);
    }

    /// The wrapped direct-mode translator.
    pub fn direct(&self) -> &DirectMode {
        &self.direct
    }

    /// Mutable access to the wrapped direct-mode translator.
    pub fn direct_mut(&mut self) -> &mut DirectMode {
        &mut self.direct
    }

    /// Process one complete MIDI message.
    ///
    /// Note, controller and bend messages run through the allocation
    /// engine; voice and percussion SysEx commands are handled here and
    /// everything else SysEx is forwarded to direct mode.
    pub fn process(&mut self, msg: &[u8]) {
        let Some(&status) = msg.first() else { return };

        if status == 0xF0 {
            if msg.len() >= 5 && msg[1] == MANUFACTURER_ID {
                match msg[3] {
                    CMD_VOICE_CONFIG | CMD_VOICE_QUERY | CMD_PERC_CONFIG | CMD_PERC_QUERY => {
                        self.handle_sysex(msg);
                        return;
                    }
                    CMD_RESET_ALL => {
                        // Drop every voice before the chip state resets
                        self.reset();
                    }
                    _ => {}
                }
            }
            self.direct.process(msg);
            return;
        }

        let ch = status & 0x0F;
        match status & 0xF0 {
            0x90 if msg.len() >= 3 => {
                if msg[2] == 0 {
                    self.handle_note_off(ch, msg[1]);
                } else {
                    self.handle_note_on(ch, msg[1], msg[2]);
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

    /// Release every sounding voice and drum and restart the timestamp
    /// counter (safe once no live stamps remain).
    pub fn reset(&mut self) {
        let Self { direct, channels, .. } = self;
        for mcs in channels.iter_mut() {
            for i in 0..mcs.voices.len() {
                if mcs.voices[i].note.is_some() {
                    direct.release_channel(mcs.config.opl3_channels[i]);
                    mcs.voices[i] = Voice::default();
                }
            }
        }
        self.release_all_drums();
        self.timestamp = 0;
    }

    // --- Note on ---

    fn handle_note_on(&mut self, midi_ch: u8, note: u8, vel: u8) {
        if self.try_perc_note_on(midi_ch, note, vel) {
            return;
        }

        let Self {
            direct,
            channels,
            timestamp,
            ..
        } = self;
        let mcs = &mut channels[midi_ch as usize];
        if mcs.config.opl3_channels.is_empty() {
            debug!("note on dropped: MIDI channel {midi_ch} has no voice pool");
            return;
        }

        let unison = usize::from(mcs.config.unison_count.max(1));

        // Retrigger: release any voices already playing this note
        for i in 0..mcs.voices.len() {
            if mcs.voices[i].note == Some(note) {
                direct.release_channel(mcs.config.opl3_channels[i]);
                mcs.voices[i] = Voice::default();
            }
        }

        let slots = Self::allocate_slots(direct, mcs, unison);
        if slots.is_empty() {
            return;
        }

        *timestamp += 1;
        let ts = *timestamp;

        for (idx, &slot) in slots.iter().enumerate() {
            let opl3_ch = mcs.config.opl3_channels[slot];
            let freq = voice_freq(
                note,
                idx,
                unison,
                mcs.config.detune_cents,
                mcs.pitch_bend,
                mcs.bend_range_semitones,
                mcs.bend_range_cents,
            );

            mcs.voices[slot] = Voice {
                note: Some(note),
                velocity: vel,
                timestamp: ts,
                freq,
                sustained: false,
            };

            direct.note_on_channel(opl3_ch, note, vel);
            if unison > 1 || mcs.pitch_bend != 8192 {
                // Detuned or bent: override the baseline frequency
                direct.bend_channel(opl3_ch, freq);
            }
            if mcs.config.pan_split && unison > 1 {
                direct.apply_cc_to_channel(opl3_ch, 10, unison_pan(idx, unison));
            }
        }
    }

    /// Slot indices to play a new note group on. Free slots first; when
    /// short, whole note groups are stolen oldest-first until the request
    /// is met or nothing is left to steal.
    fn allocate_slots(
        direct: &mut DirectMode,
        mcs: &mut MidiChannelState,
        count: usize,
    ) -> Vec<usize> {
        loop {
            let mut free: Vec<usize> = mcs
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.note.is_none())
                .map(|(i, _)| i)
                .collect();
            if free.len() >= count {
                free.truncate(count);
                return free;
            }
            if !Self::steal_oldest_group(direct, mcs) {
                return free;
            }
        }
    }

    /// Free the unison group holding the oldest timestamp. Returns false
    /// when nothing is sounding.
    fn steal_oldest_group(direct: &mut DirectMode, mcs: &mut MidiChannelState) -> bool {
        let oldest = mcs
            .voices
            .iter()
            .filter(|v| v.note.is_some())
            .min_by_key(|v| v.timestamp)
            .map(|v| (v.note, v.timestamp));
        let Some((note, ts)) = oldest else {
            return false;
        };

        for i in 0..mcs.voices.len() {
            if mcs.voices[i].note == note && mcs.voices[i].timestamp == ts {
                direct.release_channel(mcs.config.opl3_channels[i]);
                mcs.voices[i] = Voice::default();
            }
        }
        true
    }

    // --- Note off ---

    fn handle_note_off(&mut self, midi_ch: u8, note: u8) {
        if self.try_perc_note_off(midi_ch, note) {
            return;
        }

        let Self { direct, channels, .. } = self;
        let mcs = &mut channels[midi_ch as usize];

        for i in 0..mcs.voices.len() {
            if mcs.voices[i].note == Some(note) {
                if mcs.sustain {
                    mcs.voices[i].sustained = true;
                } else {
                    direct.release_channel(mcs.config.opl3_channels[i]);
                    mcs.voices[i] = Voice::default();
                }
            }
        }
    }

    // --- Control changes ---

    fn handle_cc(&mut self, midi_ch: u8, cc: u8, val: u8) {
        let Self { direct, channels, .. } = self;
        let mcs = &mut channels[midi_ch as usize];

        match cc {
            1 => mcs.mod_wheel = val,
            7 => mcs.volume = val,
            10 => mcs.pan = val,
            11 => mcs.expression = val,
            74 => mcs.brightness = val,
            64 => {
                let was_on = mcs.sustain;
                mcs.sustain = val >= 64;
                if was_on && !mcs.sustain {
                    for i in 0..mcs.voices.len() {
                        if mcs.voices[i].sustained {
                            direct.release_channel(mcs.config.opl3_channels[i]);
                            mcs.voices[i] = Voice::default();
                        }
                    }
                }
            }

            // Parameter addressing: consumed here, never broadcast.
            // Selecting an NRPN nulls the RPN and vice versa.
            99 => {
                mcs.nrpn_msb = val;
                (mcs.rpn_msb, mcs.rpn_lsb) = (PARAM_NULL, PARAM_NULL);
                return;
            }
            98 => {
                mcs.nrpn_lsb = val;
                (mcs.rpn_msb, mcs.rpn_lsb) = (PARAM_NULL, PARAM_NULL);
                return;
            }
            101 => {
                mcs.rpn_msb = val;
                (mcs.nrpn_msb, mcs.nrpn_lsb) = (PARAM_NULL, PARAM_NULL);
                return;
            }
            100 => {
                mcs.rpn_lsb = val;
                (mcs.nrpn_msb, mcs.nrpn_lsb) = (PARAM_NULL, PARAM_NULL);
                return;
            }
            6 => {
                if mcs.nrpn_msb != PARAM_NULL && mcs.nrpn_lsb != PARAM_NULL {
                    // The direct-NRPN path addresses the whole pool,
                    // including OPL3 channels 16-17
                    for &ch in &mcs.config.opl3_channels {
                        direct.direct_nrpn(ch, mcs.nrpn_msb, mcs.nrpn_lsb, val);
                    }
                } else if mcs.rpn_msb == 0 && mcs.rpn_lsb == 0 {
                    mcs.bend_range_semitones = val;
                }
                return;
            }
            38 => {
                if mcs.rpn_msb == 0 && mcs.rpn_lsb == 0 {
                    mcs.bend_range_cents = val;
                }
                return;
            }

            _ => {}
        }

        for &ch in &mcs.config.opl3_channels {
            direct.apply_cc_to_channel(ch, cc, val);
        }
    }

    // --- Pitch bend ---

    fn handle_pitch_bend(&mut self, midi_ch: u8, bend: u16) {
        self.channels[midi_ch as usize].pitch_bend = bend;
        self.recompute_bend(midi_ch);
    }

    /// Rewrite the frequency of every sounding voice on a MIDI channel,
    /// applying the current bend on top of each voice's unison offset.
    /// Key-on state is preserved throughout.
    fn recompute_bend(&mut self, midi_ch: u8) {
        let Self { direct, channels, .. } = self;
        let mcs = &mut channels[midi_ch as usize];
        let unison = usize::from(mcs.config.unison_count.max(1));

        for i in 0..mcs.voices.len() {
            let v = mcs.voices[i];
            let Some(note) = v.note else { continue };

            // Position within the unison group = voices of the same group
            // sitting at lower slot indices
            let unison_idx = mcs.voices[..i]
                .iter()
                .filter(|o| o.note == v.note && o.timestamp == v.timestamp)
                .count();

            let freq = voice_freq(
                note,
                unison_idx,
                unison,
                mcs.config.detune_cents,
                mcs.pitch_bend,
                mcs.bend_range_semitones,
                mcs.bend_range_cents,
            );
            mcs.voices[i].freq = freq;
            direct.bend_channel(mcs.config.opl3_channels[i], freq);
        }
    }

    // --- Voice configuration ---

    /// Install a new voice pool for a MIDI channel.
    ///
    /// Sounding notes in the old pool are released, the claimed OPL3
    /// channels are withdrawn from every other MIDI channel (releasing
    /// their notes too), and the shadowed controllers are applied to each
    /// newly assigned channel.
    pub fn set_voice_config(&mut self, midi_ch: u8, config: VoiceConfig) {
        if usize::from(midi_ch) >= NUM_MIDI_CHANNELS {
            return;
        }
        let Self { direct, channels, .. } = self;

        let mcs = &mut channels[midi_ch as usize];
        for i in 0..mcs.voices.len() {
            if mcs.voices[i].note.is_some() {
                direct.release_channel(mcs.config.opl3_channels[i]);
            }
        }

        for &claimed in &config.opl3_channels {
            for other in 0..NUM_MIDI_CHANNELS {
                if other == usize::from(midi_ch) {
                    continue;
                }
                let other_mcs = &mut channels[other];
                if let Some(pos) = other_mcs
                    .config
                    .opl3_channels
                    .iter()
                    .position(|&c| c == claimed)
                {
                    if other_mcs.voices.get(pos).is_some_and(|v| v.note.is_some()) {
                        direct.release_channel(claimed);
                    }
                    other_mcs.config.opl3_channels.remove(pos);
                    if pos < other_mcs.voices.len() {
                        other_mcs.voices.remove(pos);
                    }
                }
            }
        }

        let mcs = &mut channels[midi_ch as usize];
        mcs.voices = vec![Voice::default(); config.opl3_channels.len()];
        mcs.config = config;

        for &ch in &mcs.config.opl3_channels {
            direct.apply_cc_to_channel(ch, 7, mcs.volume);
            direct.apply_cc_to_channel(ch, 11, mcs.expression);
            direct.apply_cc_to_channel(ch, 10, mcs.pan);
            direct.apply_cc_to_channel(ch, 1, mcs.mod_wheel);
            direct.apply_cc_to_channel(ch, 74, mcs.brightness);
        }
    }

    /// Current voice pool of a MIDI channel.
    pub fn voice_config(&self, midi_ch: u8) -> &VoiceConfig {
        &self.channels[midi_ch as usize].config
    }

    /// How many simultaneous notes a MIDI channel can sound: pool size
    /// divided by unison count, with a 4-op pair counting as one slot
    /// when the 4-op flag is set.
    pub fn poly_voice_count(&self, midi_ch: u8) -> usize {
        if usize::from(midi_ch) >= NUM_MIDI_CHANNELS {
            return 0;
        }
        let mcs = &self.channels[midi_ch as usize];
        let unison = usize::from(mcs.config.unison_count.max(1));

        let slots = if mcs.config.four_op {
            let chans = &mcs.config.opl3_channels;
            let mut counted = vec![false; chans.len()];
            let mut slots = 0;
            for i in 0..chans.len() {
                if counted[i] {
                    continue;
                }
                counted[i] = true;
                if let Some(partner) = four_op_partner(chans[i]) {
                    if let Some(j) =
                        (i + 1..chans.len()).find(|&j| !counted[j] && chans[j] == partner)
                    {
                        counted[j] = true;
                    }
                }
                slots += 1;
            }
            slots
        } else {
            mcs.config.opl3_channels.len()
        };

        slots / unison
    }

    // --- Percussion ---

    /// Switch OPL3 percussion mode. Disabling releases all sounding
    /// drums.
    pub fn set_percussion_mode(&mut self, enabled: bool) {
        if self.perc_mode == enabled {
            return;
        }
        self.perc_mode = enabled;
        self.direct
            .direct_nrpn(0, 5, 2, if enabled { 127 } else { 0 });
        if !enabled {
            self.release_all_drums();
        }
    }

    /// Whether percussion mode is active.
    pub fn percussion_mode(&self) -> bool {
        self.perc_mode
    }

    /// Bind a drum to a MIDI channel, or unbind it with `None`. A
    /// sounding drum is released first.
    pub fn set_drum_midi_channel(&mut self, drum: Drum, midi_ch: Option<u8>) {
        if self.drum_note[drum.index()].is_some() {
            self.direct.perc_note_off(drum);
            self.drum_note[drum.index()] = None;
        }
        self.drum_channel[drum.index()] = midi_ch;
    }

    /// The MIDI channel a drum is bound to.
    pub fn drum_midi_channel(&self, drum: Drum) -> Option<u8> {
        self.drum_channel[drum.index()]
    }

    fn release_all_drums(&mut self) {
        for drum in Drum::ALL {
            if self.drum_note[drum.index()].is_some() {
                self.direct.perc_note_off(drum);
                self.drum_note[drum.index()] = None;
            }
        }
    }

    fn try_perc_note_on(&mut self, midi_ch: u8, note: u8, vel: u8) -> bool {
        if !self.perc_mode {
            return false;
        }
        let mut handled = false;
        for drum in Drum::ALL {
            if self.drum_channel[drum.index()] == Some(midi_ch) {
                // Retrigger: drop the key bit before re-asserting it
                if self.drum_note[drum.index()].is_some() {
                    self.direct.perc_note_off(drum);
                }
                self.direct.perc_note_on(drum, note, vel);
                self.drum_note[drum.index()] = Some(note);
                handled = true;
            }
        }
        handled
    }

    fn try_perc_note_off(&mut self, midi_ch: u8, note: u8) -> bool {
        if !self.perc_mode {
            return false;
        }
        let mut handled = false;
        for drum in Drum::ALL {
            if self.drum_channel[drum.index()] == Some(midi_ch)
                && self.drum_note[drum.index()] == Some(note)
            {
                self.direct.perc_note_off(drum);
                self.drum_note[drum.index()] = None;
                handled = true;
            }
        }
        handled
    }

    // --- SysEx ---

    fn handle_sysex(&mut self, msg: &[u8]) {
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
            CMD_VOICE_CONFIG => self.sysex_voice_config(payload),
            CMD_VOICE_QUERY => self.sysex_voice_query(payload),
            CMD_PERC_CONFIG => self.sysex_perc_config(payload),
            CMD_PERC_QUERY => self.sysex_perc_query(),
            _ => {}
        }
    }

    fn sysex_voice_config(&mut self, payload: &[u8]) {
        // midi-ch, count, channels..., unison, detune, flags
        let [midi_ch, count, ..] = *payload else { return };
        if usize::from(midi_ch) >= NUM_MIDI_CHANNELS {
            return;
        }
        let count = usize::from(count);
        if payload.len() < 4 + count {
            return;
        }

        let mut config = VoiceConfig {
            opl3_channels: Vec::with_capacity(count),
            unison_count: payload[2 + count].max(1),
            detune_cents: payload[3 + count],
            four_op: false,
            pan_split: false,
        };
        for &ch in &payload[2..2 + count] {
            if usize::from(ch) < NUM_CHANNELS {
                config.opl3_channels.push(ch);
            } else {
                debug!("voice config: skipping out-of-range OPL3 channel {ch}");
            }
        }
        if let Some(&flags) = payload.get(4 + count) {
            config.four_op = flags & 0x01 != 0;
            config.pan_split = flags & 0x02 != 0;
        }

        self.set_voice_config(midi_ch, config);
    }

    fn sysex_voice_query(&mut self, payload: &[u8]) {
        let Some(&midi_ch) = payload.first() else { return };
        if usize::from(midi_ch) >= NUM_MIDI_CHANNELS || self.midi_out.is_none() {
            return;
        }
        let config = &self.channels[midi_ch as usize].config;

        // Response reuses the voice-config command, so it can be sent
        // straight back to restore this state
        let mut msg = vec![0xF0, MANUFACTURER_ID, self.device_id, CMD_VOICE_CONFIG, midi_ch];
        msg.push(config.opl3_channels.len() as u8);
        msg.extend_from_slice(&config.opl3_channels);
        msg.push(config.unison_count);
        msg.push(config.detune_cents);
        let flags =
            u8::from(config.four_op) | (u8::from(config.pan_split) << 1);
        msg.push(flags);
        msg.push(0xF7);

        if let Some(out) = self.midi_out.as_mut() {
            out(&msg);
        }
    }

    fn sysex_perc_config(&mut self, payload: &[u8]) {
        // perc-mode, then one MIDI channel per drum (0x7F = unbound)
        let [mode, bindings @ ..] = payload else { return };
        if bindings.len() < Drum::ALL.len() {
            return;
        }

        self.set_percussion_mode(*mode >= 64);
        for (drum, &ch) in Drum::ALL.iter().zip(bindings) {
            let bound = (usize::from(ch) < NUM_MIDI_CHANNELS).then_some(ch);
            self.set_drum_midi_channel(*drum, bound);
        }
    }

    fn sysex_perc_query(&mut self) {
        let Some(out) = self.midi_out.as_mut() else { return };

        let mut msg = vec![0xF0, MANUFACTURER_ID, self.device_id, CMD_PERC_CONFIG];
        msg.push(if self.perc_mode { 0x7F } else { 0x00 });
        for drum in Drum::ALL {
            msg.push(self.drum_channel[drum.index()].unwrap_or(0x7F));
        }
        msg.push(0xF7);
        out(&msg);
    }
}

impl std::fmt::Debug for VoiceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceAllocator")
            .field("device_id", &self.device_id)
            .field("perc_mode", &self.perc_mode)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
