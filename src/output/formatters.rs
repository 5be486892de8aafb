use bytes::{BufMut, Bytes, BytesMut};

use super::telegram::{SentenceKind, TalkerId};
use crate::utils::error::SimulationError;

/// Turns telegram fields into one checksummed, line-terminated wire frame.
pub trait TelegramEncoder: Send + Sync {
    fn encode(
        &self,
        talker: TalkerId,
        kind: SentenceKind,
        fields: &[String],
    ) -> Result<Bytes, SimulationError>;
}

/// NMEA 0183 sentence encoder: `$<talker><kind>,<f1>,...*<XX>\r\n`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NmeaEncoder;

pub const NMEA_MAX_SENTENCE_LEN: usize = 82;

impl TelegramEncoder for NmeaEncoder {
    fn encode(
        &self,
        talker: TalkerId,
        kind: SentenceKind,
        fields: &[String],
    ) -> Result<Bytes, SimulationError> {
        let mut body = String::with_capacity(32);
        body.push_str(talker.as_str());
        body.push_str(kind.code());
        for field in fields {
            if field.contains(|c: char| matches!(c, ',' | '*' | '$' | '\r' | '\n') || !c.is_ascii()) {
                return Err(SimulationError::InvalidTelegram(format!(
                    "field '{}' contains reserved characters",
                    field
                )));
            }
            body.push(',');
            body.push_str(field);
        }

        // '$' + body + '*' + 2 checksum digits + CR LF
        let frame_len = body.len() + 6;
        if frame_len > NMEA_MAX_SENTENCE_LEN {
            return Err(SimulationError::InvalidTelegram(format!(
                "sentence of {} bytes exceeds {} byte limit",
                frame_len, NMEA_MAX_SENTENCE_LEN
            )));
        }

        let mut frame = BytesMut::with_capacity(frame_len);
        frame.put_u8(b'$');
        frame.put_slice(body.as_bytes());
        frame.put_slice(format!("*{:02X}\r\n", nmea_checksum(body.as_bytes())).as_bytes());
        Ok(frame.freeze())
    }
}

/// XOR of every byte between `$` and `*`.
pub fn nmea_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc ^ b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmeaSentence {
    pub talker: String,
    pub kind: String,
    pub fields: Vec<String>,
}

impl NmeaSentence {
    pub fn field_as_f64(&self, index: usize) -> Option<f64> {
        self.fields.get(index)?.parse().ok()
    }
}

/// Parses and verifies one sentence, with or without its CR/LF terminator.
pub fn parse_sentence(line: &str) -> Result<NmeaSentence, SimulationError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line
        .strip_prefix('$')
        .ok_or_else(|| SimulationError::InvalidTelegram(format!("missing '$' in '{}'", line)))?;
    let (body, checksum) = rest
        .rsplit_once('*')
        .ok_or_else(|| SimulationError::InvalidTelegram(format!("missing checksum in '{}'", line)))?;

    let expected = u8::from_str_radix(checksum, 16).map_err(|_| {
        SimulationError::InvalidTelegram(format!("malformed checksum '{}'", checksum))
    })?;
    let actual = nmea_checksum(body.as_bytes());
    if checksum.len() != 2 || expected != actual {
        return Err(SimulationError::InvalidTelegram(format!(
            "checksum mismatch: frame says {}, computed {:02X}",
            checksum, actual
        )));
    }

    let mut parts = body.split(',');
    let address = parts.next().unwrap_or_default();
    if address.len() != 5 || !address.is_ascii() {
        return Err(SimulationError::InvalidTelegram(format!(
            "malformed address field '{}'",
            address
        )));
    }
    let (talker, kind) = address.split_at(2);

    Ok(NmeaSentence {
        talker: talker.to_string(),
        kind: kind.to_string(),
        fields: parts.map(str::to_string).collect(),
    })
}
