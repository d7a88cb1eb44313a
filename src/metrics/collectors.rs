use prometheus_client::encoding::EncodeLabelSet;

/// Label for backend failure counters: `tcp` for dial failures, `handshake`
/// for SSH handshake or authentication failures.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabel {
    pub failure: String,
}

impl FailureLabel {
    pub fn tcp() -> Self {
        Self {
            failure: "tcp".to_string(),
        }
    }

    pub fn handshake() -> Self {
        Self {
            failure: "handshake".to_string(),
        }
    }
}
