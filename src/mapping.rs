//! MIDI mapping descriptors and their wire encoding
//!
//! A mapping binds a MIDI event (channel, message type, note/CC number) to an
//! action on a named loop. On the wire a mapping travels as five
//! space-separated tokens:
//!
//! ```text
//! <channel> <type-code> <value> <action-code> <loop-name>
//! 3 cc_on 64 toggle_recording Drums
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Number of MIDI channels (valid channels are 0-15)
pub const MIDI_CHANNELS: i64 = 16;

/// Number of 7-bit MIDI data values (valid values are 0-127)
pub const MIDI_VALUES: i64 = 128;

/// Rejected mapping field at construction time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("MIDI channel {0} out of range (must be 0-15)")]
    ChannelOutOfRange(i64),

    #[error("MIDI value {0} out of range (must be 0-127)")]
    ValueOutOfRange(i64),

    #[error("unknown MIDI message type '{0}'")]
    UnknownMidiType(String),

    #[error("unknown loop action '{0}'")]
    UnknownLoopAction(String),
}

/// Malformed encoded mapping
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected 5 tokens in encoded mapping, found {0}")]
    TokenCount(usize),

    #[error("{field} '{token}' is not an integer")]
    NotAnInteger { field: &'static str, token: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// MIDI message kind a mapping reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MidiType {
    NoteOn,
    NoteOff,
    /// Control change with a non-zero value
    CCOn,
    /// Control change with a zero value
    CCOff,
}

impl MidiType {
    pub const ALL: [MidiType; 4] = [
        MidiType::NoteOn,
        MidiType::NoteOff,
        MidiType::CCOn,
        MidiType::CCOff,
    ];

    /// Wire code used in encoded mappings
    pub fn code(self) -> &'static str {
        match self {
            MidiType::NoteOn => "on",
            MidiType::NoteOff => "off",
            MidiType::CCOn => "cc_on",
            MidiType::CCOff => "cc_off",
        }
    }

    /// Inverse of [`MidiType::code`]
    pub fn from_code(code: &str) -> Result<Self, ValidationError> {
        match code {
            "on" => Ok(MidiType::NoteOn),
            "off" => Ok(MidiType::NoteOff),
            "cc_on" => Ok(MidiType::CCOn),
            "cc_off" => Ok(MidiType::CCOff),
            other => Err(ValidationError::UnknownMidiType(other.to_string())),
        }
    }
}

impl fmt::Display for MidiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MidiType::NoteOn => "NoteOn",
            MidiType::NoteOff => "NoteOff",
            MidiType::CCOn => "CCOn",
            MidiType::CCOff => "CCOff",
        };
        f.write_str(name)
    }
}

impl FromStr for MidiType {
    type Err = ValidationError;

    /// Parse the display name (`NoteOn`, `CCOff`, ...)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoteOn" => Ok(MidiType::NoteOn),
            "NoteOff" => Ok(MidiType::NoteOff),
            "CCOn" => Ok(MidiType::CCOn),
            "CCOff" => Ok(MidiType::CCOff),
            other => Err(ValidationError::UnknownMidiType(other.to_string())),
        }
    }
}

/// What a mapping does to its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopAction {
    TogglePlayback,
    ToggleRecording,
}

impl LoopAction {
    pub const ALL: [LoopAction; 2] = [LoopAction::TogglePlayback, LoopAction::ToggleRecording];

    pub fn code(self) -> &'static str {
        match self {
            LoopAction::TogglePlayback => "toggle_playback",
            LoopAction::ToggleRecording => "toggle_recording",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, ValidationError> {
        match code {
            "toggle_playback" => Ok(LoopAction::TogglePlayback),
            "toggle_recording" => Ok(LoopAction::ToggleRecording),
            other => Err(ValidationError::UnknownLoopAction(other.to_string())),
        }
    }
}

impl fmt::Display for LoopAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopAction::TogglePlayback => f.write_str("TogglePlayback"),
            LoopAction::ToggleRecording => f.write_str("ToggleRecording"),
        }
    }
}

impl FromStr for LoopAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TogglePlayback" => Ok(LoopAction::TogglePlayback),
            "ToggleRecording" => Ok(LoopAction::ToggleRecording),
            other => Err(ValidationError::UnknownLoopAction(other.to_string())),
        }
    }
}

/// A validated MIDI-to-loop binding
///
/// Fields are checked once in [`MidiMappingInfo::new`] and cannot change
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiMappingInfo {
    channel: u8,
    midi_type: MidiType,
    value: u8,
    loop_name: String,
    loop_action: LoopAction,
}

impl MidiMappingInfo {
    /// Build a mapping, rejecting out-of-range channel or value
    ///
    /// # Arguments
    /// * `channel` - MIDI channel, 0-15
    /// * `midi_type` - Message kind to react to
    /// * `value` - Note or CC number, 0-127
    /// * `loop_name` - Target loop
    /// * `loop_action` - Action applied to the loop
    pub fn new(
        channel: i64,
        midi_type: MidiType,
        value: i64,
        loop_name: impl Into<String>,
        loop_action: LoopAction,
    ) -> Result<Self, ValidationError> {
        if !(0..MIDI_CHANNELS).contains(&channel) {
            return Err(ValidationError::ChannelOutOfRange(channel));
        }
        if !(0..MIDI_VALUES).contains(&value) {
            return Err(ValidationError::ValueOutOfRange(value));
        }

        Ok(Self {
            channel: channel as u8,
            midi_type,
            value: value as u8,
            loop_name: loop_name.into(),
            loop_action,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn midi_type(&self) -> MidiType {
        self.midi_type
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn loop_name(&self) -> &str {
        &self.loop_name
    }

    pub fn loop_action(&self) -> LoopAction {
        self.loop_action
    }
}

impl fmt::Display for MidiMappingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ch{} {} {} -> {} '{}'",
            self.channel, self.midi_type, self.value, self.loop_action, self.loop_name
        )
    }
}

/// Encode a mapping into its wire string
pub fn encode(mapping: &MidiMappingInfo) -> String {
    format!(
        "{} {} {} {} {}",
        mapping.channel,
        mapping.midi_type.code(),
        mapping.value,
        mapping.loop_action.code(),
        mapping.loop_name
    )
}

/// Decode a wire string produced by [`encode`]
pub fn decode(encoded: &str) -> Result<MidiMappingInfo, DecodeError> {
    let tokens: Vec<&str> = encoded.split(' ').collect();
    let &[channel, midi_type, value, action, loop_name] = tokens.as_slice() else {
        return Err(DecodeError::TokenCount(tokens.len()));
    };

    let channel = parse_int("channel", channel)?;
    let midi_type = MidiType::from_code(midi_type)?;
    let value = parse_int("value", value)?;
    let loop_action = LoopAction::from_code(action)?;

    Ok(MidiMappingInfo::new(
        channel,
        midi_type,
        value,
        loop_name,
        loop_action,
    )?)
}

fn parse_int(field: &'static str, token: &str) -> Result<i64, DecodeError> {
    token.parse::<i64>().map_err(|_| DecodeError::NotAnInteger {
        field,
        token: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drums() -> MidiMappingInfo {
        MidiMappingInfo::new(3, MidiType::CCOn, 64, "Drums", LoopAction::ToggleRecording).unwrap()
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(encode(&drums()), "3 cc_on 64 toggle_recording Drums");
    }

    #[test]
    fn test_decode_known_string() {
        let decoded = decode("3 cc_on 64 toggle_recording Drums").unwrap();
        assert_eq!(decoded, drums());
        assert_eq!(decoded.loop_name(), "Drums");
        assert_eq!(decoded.midi_type(), MidiType::CCOn);
    }

    #[test]
    fn test_boundary_values_accepted() {
        for channel in [0, 15] {
            assert!(MidiMappingInfo::new(channel, MidiType::NoteOn, 0, "L", LoopAction::TogglePlayback).is_ok());
        }
        for value in [0, 127] {
            assert!(MidiMappingInfo::new(0, MidiType::NoteOff, value, "L", LoopAction::TogglePlayback).is_ok());
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert_eq!(
            MidiMappingInfo::new(16, MidiType::NoteOn, 0, "L", LoopAction::TogglePlayback),
            Err(ValidationError::ChannelOutOfRange(16))
        );
        assert_eq!(
            MidiMappingInfo::new(0, MidiType::NoteOn, 128, "L", LoopAction::TogglePlayback),
            Err(ValidationError::ValueOutOfRange(128))
        );
        assert!(MidiMappingInfo::new(-1, MidiType::NoteOn, 0, "L", LoopAction::TogglePlayback).is_err());
    }

    #[test]
    fn test_unknown_midi_type_rejected() {
        assert_eq!(
            "Foo".parse::<MidiType>(),
            Err(ValidationError::UnknownMidiType("Foo".to_string()))
        );
        assert_eq!("CCOn".parse::<MidiType>(), Ok(MidiType::CCOn));
        assert!("Bar".parse::<LoopAction>().is_err());
    }

    #[test]
    fn test_decode_too_few_tokens() {
        assert_eq!(decode("5 on"), Err(DecodeError::TokenCount(2)));
    }

    #[test]
    fn test_decode_unknown_type_code() {
        assert_eq!(
            decode("5 bogus 10 toggle_playback L"),
            Err(DecodeError::Invalid(ValidationError::UnknownMidiType("bogus".to_string())))
        );
    }

    #[test]
    fn test_decode_rejects_bad_numbers() {
        assert!(matches!(
            decode("x on 10 toggle_playback L"),
            Err(DecodeError::NotAnInteger { field: "channel", .. })
        ));
        assert_eq!(
            decode("16 on 10 toggle_playback L"),
            Err(DecodeError::Invalid(ValidationError::ChannelOutOfRange(16)))
        );
        assert_eq!(
            decode("0 on 200 toggle_playback L"),
            Err(DecodeError::Invalid(ValidationError::ValueOutOfRange(200)))
        );
        assert!(decode("0 on 1 explode L").is_err());
    }

    #[test]
    fn test_codes_are_bijective() {
        for t in MidiType::ALL {
            assert_eq!(MidiType::from_code(t.code()), Ok(t));
            assert_eq!(t.to_string().parse::<MidiType>(), Ok(t));
        }
        for a in LoopAction::ALL {
            assert_eq!(LoopAction::from_code(a.code()), Ok(a));
        }
    }

    fn arb_mapping() -> impl Strategy<Value = MidiMappingInfo> {
        (
            0i64..16,
            prop::sample::select(MidiType::ALL.to_vec()),
            0i64..128,
            "[A-Za-z0-9_]{1,16}",
            prop::sample::select(LoopAction::ALL.to_vec()),
        )
            .prop_map(|(channel, midi_type, value, name, action)| {
                MidiMappingInfo::new(channel, midi_type, value, name, action).unwrap()
            })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(mapping in arb_mapping()) {
            prop_assert_eq!(decode(&encode(&mapping)), Ok(mapping));
        }
    }
}
