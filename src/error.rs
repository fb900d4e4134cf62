use crate::config;

/// Everything that can go wrong while setting up or running a capture
/// session. Each variant maps onto a websocket close reason via
/// [`CaptureError::close_reason`]; details that would leak into overly long
/// close frames are kept for the logs only.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Malformed or contradictory capture parameters.
    #[error("{0}")]
    BadRequest(String),

    /// The discovery service could not be reached, timed out, or returned an
    /// unusable response. There is no silent fallback.
    #[error("{0}")]
    Discovery(String),

    /// The namespace resolver came up empty for the requested inode.
    #[error("could not locate network namespace for container")]
    NamespaceNotFound,

    /// Pin-time validation of the namespace reference failed.
    #[error("stale target reference: {0}")]
    Stale(String),

    /// The spawn thread could not switch into the target network namespace.
    #[error("cannot switch to target network stack: {0}")]
    NamespaceSwitch(String),

    /// Promoting capabilities into the ambient set was rejected by the
    /// kernel.
    #[error("cannot set ambient capabilities: {0}")]
    CapabilityPromotion(String),

    /// The capture process could not be started.
    #[error("cannot start capture process: {0}")]
    Spawn(String),
}

impl CaptureError {
    /// The reason text to put into the websocket close frame for this error.
    /// Always fits the close frame reason limit.
    pub fn close_reason(&self) -> String {
        let reason = match self {
            Self::BadRequest(msg) | Self::Discovery(msg) => msg.as_str(),
            Self::NamespaceNotFound => "could not locate network namespace for container",
            Self::Stale(_) => "cannot lock target network stack",
            Self::NamespaceSwitch(_) => "cannot switch to target network stack",
            Self::CapabilityPromotion(_) | Self::Spawn(_) => "cannot start capture process",
        };
        truncate_reason(reason)
    }
}

/// Close frame reasons are limited to 123 octets (125 octets of control
/// frame payload minus the 2-octet status code). Truncates on a char
/// boundary so the reason stays valid UTF-8.
pub fn truncate_reason(reason: &str) -> String {
    const MAX: usize = config::CLOSE_REASON_MAX;
    if reason.len() <= MAX {
        return reason.to_string();
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
