//! Commands understood by the reader

use crate::types::{IndicatorColor, RfidError, Tag};

// Opcodes
const MODEL_INFO: [u8; 2] = [0x01, 0x02];
const BEEP: [u8; 2] = [0x01, 0x03];
const SET_INDICATOR: [u8; 2] = [0x01, 0x04];
const READ_TAG: [u8; 2] = [0x01, 0x0C];
const WRITE_TAG_PRIMARY: [u8; 2] = [0x02, 0x0C];
const WRITE_TAG_FALLBACK: [u8; 2] = [0x03, 0x0C];

/// The two hardware write opcodes, tried in order by
/// [`ReaderSession::write_tag`](crate::ReaderSession::write_tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVariant {
    Primary,
    Fallback,
}

/// A request to the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ModelInfo,
    /// Beep for roughly `n / 255` seconds; 0 beeps continuously
    Beep(u8),
    SetIndicator(IndicatorColor),
    ReadTag,
    WriteTag {
        variant: WriteVariant,
        tag: Tag,
        locked: bool,
    },
}

impl Command {
    /// Build a beep command, rejecting durations outside 0..=255
    pub fn beep(duration: u32) -> Result<Self, RfidError> {
        u8::try_from(duration).map(Command::Beep).map_err(|_| {
            RfidError::Validation(format!(
                "Duration must be between 0 and 255. Was {}.",
                duration
            ))
        })
    }

    pub fn set_indicator(color: IndicatorColor) -> Self {
        Command::SetIndicator(color)
    }

    /// Write `tag`; `locked` makes the tag read-only afterwards
    pub fn write_tag(variant: WriteVariant, tag: Tag, locked: bool) -> Self {
        Command::WriteTag {
            variant,
            tag,
            locked,
        }
    }

    pub fn opcode(&self) -> [u8; 2] {
        match self {
            Command::ModelInfo => MODEL_INFO,
            Command::Beep(_) => BEEP,
            Command::SetIndicator(_) => SET_INDICATOR,
            Command::ReadTag => READ_TAG,
            Command::WriteTag {
                variant: WriteVariant::Primary,
                ..
            } => WRITE_TAG_PRIMARY,
            Command::WriteTag {
                variant: WriteVariant::Fallback,
                ..
            } => WRITE_TAG_FALLBACK,
        }
    }

    /// Unstuffed payload bytes
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::ModelInfo | Command::ReadTag => Vec::new(),
            Command::Beep(duration) => vec![*duration],
            Command::SetIndicator(color) => vec![*color as u8],
            Command::WriteTag { tag, locked, .. } => {
                let mut payload = Vec::with_capacity(1 + tag.as_bytes().len());
                payload.push(u8::from(*locked));
                payload.extend_from_slice(tag.as_bytes());
                payload
            }
        }
    }

    /// Human-readable name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::ModelInfo => "model info",
            Command::Beep(_) => "beep",
            Command::SetIndicator(_) => "set indicator",
            Command::ReadTag => "read tag",
            Command::WriteTag {
                variant: WriteVariant::Primary,
                ..
            } => "write tag (primary)",
            Command::WriteTag {
                variant: WriteVariant::Fallback,
                ..
            } => "write tag (fallback)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_commands() {
        assert_eq!(Command::ModelInfo.opcode(), [0x01, 0x02]);
        assert!(Command::ModelInfo.payload().is_empty());
        assert_eq!(Command::ReadTag.opcode(), [0x01, 0x0C]);
        assert!(Command::ReadTag.payload().is_empty());
    }

    #[test]
    fn test_beep_command() {
        let cmd = Command::beep(5).unwrap();
        assert_eq!(cmd.opcode(), [0x01, 0x03]);
        assert_eq!(cmd.payload(), [0x05]);

        assert_eq!(Command::beep(0).unwrap().payload(), [0x00]);
        assert_eq!(Command::beep(255).unwrap().payload(), [0xFF]);
    }

    #[test]
    fn test_beep_out_of_range() {
        assert!(matches!(Command::beep(256), Err(RfidError::Validation(_))));
        assert!(matches!(Command::beep(u32::MAX), Err(RfidError::Validation(_))));
    }

    #[test]
    fn test_set_indicator_command() {
        assert_eq!(Command::set_indicator(IndicatorColor::None).payload(), [0x00]);
        assert_eq!(Command::set_indicator(IndicatorColor::Red).payload(), [0x01]);
        let cmd = Command::set_indicator(IndicatorColor::Green);
        assert_eq!(cmd.opcode(), [0x01, 0x04]);
        assert_eq!(cmd.payload(), [0x02]);
    }

    #[test]
    fn test_write_tag_commands() {
        let tag = Tag::new([1, 2, 3, 4, 5]);

        let primary = Command::write_tag(WriteVariant::Primary, tag, false);
        assert_eq!(primary.opcode(), [0x02, 0x0C]);
        assert_eq!(primary.payload(), [0x00, 1, 2, 3, 4, 5]);

        let fallback = Command::write_tag(WriteVariant::Fallback, tag, true);
        assert_eq!(fallback.opcode(), [0x03, 0x0C]);
        assert_eq!(fallback.payload(), [0x01, 1, 2, 3, 4, 5]);
    }
}
