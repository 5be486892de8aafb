pub mod formatters;
pub mod senders;
pub mod telegram;

pub use formatters::{nmea_checksum, parse_sentence, NmeaEncoder, NmeaSentence, TelegramEncoder};
pub use senders::{BroadcastReport, RegisterSink, SinkStats, TelegramSink, WriteReport};
pub use telegram::{SentenceKind, TalkerId, TelegramSpec};
