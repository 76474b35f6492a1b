use thiserror::Error;

/// Error taxonomy for the transfer engine. Variants map 1:1 onto the fixed
/// set of error kinds the FSM and scheduler can surface; new failure modes
/// should be folded into an existing kind rather than growing this enum.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("cache not found: {0}")]
    CacheNotExist(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("cluster link not established: {0}")]
    NotYetLink(String),

    #[error("cluster already linked: {0}")]
    AlreadyLink(String),

    #[error("failed to establish link: {0}")]
    LinkFailed(String),

    #[error("failed to tear down link: {0}")]
    UnlinkFailed(String),

    #[error("link busy, in-flight transfer: {0}")]
    LinkBusy(String),

    #[error("feature not enabled: {0}")]
    FeatureNotEnabled(String),

    #[error("remote memory suspect, link must be re-established: {0}")]
    SuspectRemoteError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-stable tag used by tests asserting on error *kind*
    /// without matching the message text.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ParamInvalid(_) => "ParamInvalid",
            EngineError::Timeout(_) => "Timeout",
            EngineError::CacheNotExist(_) => "CacheNotExist",
            EngineError::OutOfMemory(_) => "OutOfMemory",
            EngineError::NotYetLink(_) => "NotYetLink",
            EngineError::AlreadyLink(_) => "AlreadyLink",
            EngineError::LinkFailed(_) => "LinkFailed",
            EngineError::UnlinkFailed(_) => "UnlinkFailed",
            EngineError::LinkBusy(_) => "LinkBusy",
            EngineError::FeatureNotEnabled(_) => "FeatureNotEnabled",
            EngineError::SuspectRemoteError(_) => "SuspectRemoteError",
            EngineError::Internal(_) => "Internal",
        }
    }

    /// Numeric code carried over the wire in `ResponseInfo::ret_code`.
    pub fn ret_code(&self) -> i32 {
        match self {
            EngineError::ParamInvalid(_) => 1,
            EngineError::Timeout(_) => 2,
            EngineError::CacheNotExist(_) => 3,
            EngineError::OutOfMemory(_) => 4,
            EngineError::NotYetLink(_) => 5,
            EngineError::AlreadyLink(_) => 6,
            EngineError::LinkFailed(_) => 7,
            EngineError::UnlinkFailed(_) => 8,
            EngineError::LinkBusy(_) => 9,
            EngineError::FeatureNotEnabled(_) => 10,
            EngineError::SuspectRemoteError(_) => 11,
            EngineError::Internal(_) => 99,
        }
    }

    pub fn from_ret_code(code: i32, message: impl Into<String>) -> Option<EngineError> {
        let message = message.into();
        Some(match code {
            0 => return None,
            1 => EngineError::ParamInvalid(message),
            2 => EngineError::Timeout(message),
            3 => EngineError::CacheNotExist(message),
            4 => EngineError::OutOfMemory(message),
            5 => EngineError::NotYetLink(message),
            6 => EngineError::AlreadyLink(message),
            7 => EngineError::LinkFailed(message),
            8 => EngineError::UnlinkFailed(message),
            9 => EngineError::LinkBusy(message),
            10 => EngineError::FeatureNotEnabled(message),
            11 => EngineError::SuspectRemoteError(message),
            _ => EngineError::Internal(message),
        })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::ParamInvalid(format!("malformed config json: {e}"))
    }
}
