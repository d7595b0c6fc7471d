use thiserror::Error;

/// Engine-wide status taxonomy.
///
/// Every failure an operation can surface maps to exactly one variant, and
/// every variant has a stable wire code so a remote peer's status can be
/// carried inside a response body and mapped back on the requester side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Status {
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("kv cache does not exist: cache_id={0}")]
    KvCacheNotExist(i64),

    #[error("not yet linked with remote cluster")]
    NotYetLink,

    #[error("already linked with remote cluster")]
    AlreadyLink,

    #[error("link exists, unlink before switching role")]
    ExistLink,

    #[error("link is currently processing, try again later")]
    ProcessingLink,

    #[error("link with remote cluster failed: {0}")]
    LinkFailed(String),

    #[error("unlink with remote cluster failed: {0}")]
    UnlinkFailed(String),

    #[error("notify remote cluster to unlink failed: {0}")]
    NotifyPromptUnlinkFailed(String),

    #[error("cluster count exceeds limit: {0}")]
    ClusterNumExceedLimit(usize),

    #[error("link is busy")]
    LinkBusy,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("device out of memory")]
    DeviceOutOfMemory,

    #[error("out of memory")]
    OutOfMemory,

    #[error("operation timed out")]
    Timeout,

    #[error("request waited too long to be processed")]
    WaitProcTimeout,

    #[error("feature is not enabled")]
    FeatureNotEnabled,

    #[error("channel is not connected")]
    NotConnected,

    #[error("channel is already connected")]
    AlreadyConnected,

    #[error("io error: {0}")]
    Io(String),

    #[error("operation failed: {0}")]
    Failed(String),
}

impl Status {
    /// Stable wire code for this status. `0` is reserved for success and is
    /// never produced here.
    pub fn code(&self) -> u32 {
        match self {
            Status::WaitProcTimeout => 1,
            Status::KvCacheNotExist(_) => 2,
            Status::ParamInvalid(_) => 5,
            Status::NotYetLink => 7,
            Status::AlreadyLink => 8,
            Status::LinkFailed(_) => 9,
            Status::UnlinkFailed(_) => 10,
            Status::NotifyPromptUnlinkFailed(_) => 11,
            Status::ClusterNumExceedLimit(_) => 12,
            Status::ProcessingLink => 13,
            Status::DeviceOutOfMemory => 14,
            Status::ExistLink => 24,
            Status::FeatureNotEnabled => 25,
            Status::Timeout => 26,
            Status::LinkBusy => 27,
            Status::OutOfMemory => 28,
            Status::ResourceExhausted(_) => 29,
            Status::NotConnected => 30,
            Status::AlreadyConnected => 31,
            Status::Io(_) => 32,
            Status::Failed(_) => u32::MAX,
        }
    }

    /// Maps a wire code received from a peer back into the local taxonomy.
    /// Returns `None` for code `0` (success). Unknown non-zero codes fall
    /// back to the generic failure so a newer peer cannot wedge us.
    pub fn from_code(code: u32) -> Option<Status> {
        match code {
            0 => None,
            1 => Some(Status::WaitProcTimeout),
            2 => Some(Status::KvCacheNotExist(-1)),
            5 => Some(Status::ParamInvalid("reported by peer".to_string())),
            7 => Some(Status::NotYetLink),
            8 => Some(Status::AlreadyLink),
            9 => Some(Status::LinkFailed("reported by peer".to_string())),
            10 => Some(Status::UnlinkFailed("reported by peer".to_string())),
            11 => Some(Status::NotifyPromptUnlinkFailed(
                "reported by peer".to_string(),
            )),
            12 => Some(Status::ClusterNumExceedLimit(0)),
            13 => Some(Status::ProcessingLink),
            14 => Some(Status::DeviceOutOfMemory),
            24 => Some(Status::ExistLink),
            25 => Some(Status::FeatureNotEnabled),
            26 => Some(Status::Timeout),
            27 => Some(Status::LinkBusy),
            28 => Some(Status::OutOfMemory),
            29 => Some(Status::ResourceExhausted("reported by peer".to_string())),
            30 => Some(Status::NotConnected),
            31 => Some(Status::AlreadyConnected),
            32 => Some(Status::Io("reported by peer".to_string())),
            _ => Some(Status::Failed(format!("peer status code {code}"))),
        }
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Status::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        let all = [
            Status::ParamInvalid("x".into()),
            Status::KvCacheNotExist(3),
            Status::NotYetLink,
            Status::AlreadyLink,
            Status::ExistLink,
            Status::ProcessingLink,
            Status::LinkFailed("x".into()),
            Status::UnlinkFailed("x".into()),
            Status::NotifyPromptUnlinkFailed("x".into()),
            Status::ClusterNumExceedLimit(9),
            Status::LinkBusy,
            Status::ResourceExhausted("x".into()),
            Status::DeviceOutOfMemory,
            Status::OutOfMemory,
            Status::Timeout,
            Status::WaitProcTimeout,
            Status::FeatureNotEnabled,
            Status::NotConnected,
            Status::AlreadyConnected,
            Status::Io("x".into()),
            Status::Failed("x".into()),
        ];
        for status in all {
            let mapped = Status::from_code(status.code()).expect("non-zero code");
            assert_eq!(mapped.code(), status.code());
        }
    }

    #[test]
    fn code_zero_is_success() {
        assert!(Status::from_code(0).is_none());
    }

    #[test]
    fn unknown_code_maps_to_generic_failure() {
        let status = Status::from_code(0xDEAD).unwrap();
        assert!(matches!(status, Status::Failed(_)));
    }
}
