use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of items an envelope may carry.
///
/// The engine never looks inside an envelope; it only asks the codec whether
/// an envelope contains one of a handful of kinds. The full taxonomy belongs
/// to the codec, so unrecognized kinds survive as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Event,
    Transaction,
    Attachment,
    Session,
    ClientReport,
    ReplayEvent,
    ReplayRecording,
    CheckIn,
    Profile,
    Other(String),
}

impl ItemKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ItemKind::Event => "event",
            ItemKind::Transaction => "transaction",
            ItemKind::Attachment => "attachment",
            ItemKind::Session => "session",
            ItemKind::ClientReport => "client_report",
            ItemKind::ReplayEvent => "replay_event",
            ItemKind::ReplayRecording => "replay_recording",
            ItemKind::CheckIn => "check_in",
            ItemKind::Profile => "profile",
            ItemKind::Other(name) => name.as_str(),
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "event" => ItemKind::Event,
            "transaction" => ItemKind::Transaction,
            "attachment" => ItemKind::Attachment,
            "session" => ItemKind::Session,
            "client_report" => ItemKind::ClientReport,
            "replay_event" => ItemKind::ReplayEvent,
            "replay_recording" => ItemKind::ReplayRecording,
            "check_in" => ItemKind::CheckIn,
            "profile" => ItemKind::Profile,
            other => ItemKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("envelope serialization failed: {0}")]
    Serialize(String),

    #[error("envelope parse failed: {0}")]
    Parse(String),
}

/// Wire format hand-off for envelopes.
///
/// The transport core treats envelopes as opaque; everything format-shaped
/// is injected through this trait.
pub trait EnvelopeCodec: Send + Sync {
    type Envelope: Send + Sync + 'static;

    fn serialize(&self, envelope: &Self::Envelope) -> Result<Vec<u8>, CodecError>;

    fn parse(&self, bytes: &[u8]) -> Result<Self::Envelope, CodecError>;

    /// Whether `envelope` carries an item of any of the given kinds.
    fn contains_item_kind(&self, envelope: &Self::Envelope, kinds: &[ItemKind]) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_kind_names_round_trip() {
        let kinds = [
            ItemKind::Event,
            ItemKind::Transaction,
            ItemKind::ClientReport,
            ItemKind::ReplayEvent,
            ItemKind::ReplayRecording,
            ItemKind::CheckIn,
        ];

        for kind in kinds {
            assert_eq!(ItemKind::from_name(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_kind_preserved_as_other() {
        let kind = ItemKind::from_name("feedback");
        assert_eq!(kind, ItemKind::Other("feedback".to_string()));
        assert_eq!(kind.as_str(), "feedback");
    }
}
