use serde::{Deserialize, Serialize};

/// Session description type as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// One signaling message exchanged between peers.
///
/// Serialized as `{"description": {...}}` or `{"candidate": {...}}`, the same
/// shape browsers produce for `RTCSessionDescription` and `RTCIceCandidate`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Description(desc) => match desc.kind {
                SdpKind::Offer => "offer",
                SdpKind::Answer => "answer",
                SdpKind::Pranswer => "pranswer",
                SdpKind::Rollback => "rollback",
            },
            Signal::Candidate(_) => "icecandidate",
        }
    }

    pub fn is_description(&self) -> bool {
        matches!(self, Signal::Description(_))
    }
}

/// Ordered signals accumulated since the last hand-off. Never reordered.
pub type SignalBatch = Vec<Signal>;

pub fn encode_batch(batch: &[Signal]) -> Result<String, serde_json::Error> {
    serde_json::to_string(batch)
}

pub fn decode_batch(text: &str) -> Result<SignalBatch, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_browser_shaped_batch() {
        let text = r#"[
            {"description": {"type": "offer", "sdp": "v=0\r\n"}},
            {"candidate": {"candidate": "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host",
                           "sdpMid": "0", "sdpMLineIndex": 0, "usernameFragment": "abcd"}}
        ]"#;
        let batch = decode_batch(text).expect("decode batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], Signal::Description(SessionDescription::offer("v=0\r\n")));
        match &batch[1] {
            Signal::Candidate(candidate) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn encodes_tagged_union_without_absent_fields() {
        let batch = vec![Signal::Candidate(IceCandidate {
            candidate: "candidate:x".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        })];
        let text = encode_batch(&batch).expect("encode");
        assert_eq!(text, r#"[{"candidate":{"candidate":"candidate:x"}}]"#);
    }

    #[test]
    fn empty_batch_is_an_empty_array() {
        assert_eq!(encode_batch(&[]).unwrap(), "[]");
        assert!(decode_batch("[]").unwrap().is_empty());
    }
}
