use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// 控制 API 不可达（连接拒绝/超时）。核心启动、停止窗口内属于预期情况。
    #[error("transport error: {0}")]
    Transport(String),

    /// 控制 API 可达但返回了错误状态码。响应体不保证有结构，只保留状态码。
    #[error("control API returned status {status}")]
    Api { status: u16 },

    /// 响应体无法按预期结构解码，通常意味着客户端与核心版本不兼容。
    #[error("failed to decode control API response: {0}")]
    Decode(String),

    #[error("core executable not found: {0}")]
    ExecutableMissing(PathBuf),

    #[error("core is already running")]
    AlreadyRunning,

    #[error("core did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("core process exited with code {code:?} before becoming ready")]
    ProcessExited { code: Option<i32> },

    #[error("another lifecycle operation is in progress")]
    OperationInProgress,

    #[error("no active configuration profile resolves to a file")]
    ConfigNotFound,

    #[error("node '{0}' is not a member of any known group")]
    NodeNotInAnyGroup(String),

    #[error("system proxy: {0}")]
    SystemProxy(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error comes from the process-lifecycle state machine.
    /// Lifecycle errors indicate a real usage or environment problem and
    /// are always surfaced.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::ExecutableMissing(_)
                | Error::AlreadyRunning
                | Error::StartupTimeout(_)
                | Error::ProcessExited { .. }
                | Error::OperationInProgress
        )
    }

    /// Whether this error is expected while the core is stopped or
    /// mid-restart. Background pollers swallow these.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Api { .. } => ErrorKind::Api,
            Error::Decode(_) => ErrorKind::Decode,
            Error::ExecutableMissing(_)
            | Error::AlreadyRunning
            | Error::StartupTimeout(_)
            | Error::ProcessExited { .. }
            | Error::OperationInProgress => ErrorKind::Lifecycle,
            Error::ConfigNotFound | Error::Config(_) => ErrorKind::Config,
            Error::NodeNotInAnyGroup(_) => ErrorKind::Selection,
            Error::SystemProxy(_) => ErrorKind::SystemProxy,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Api,
    Decode,
    Lifecycle,
    Config,
    Selection,
    SystemProxy,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Api => "API",
            ErrorKind::Decode => "DECODE",
            ErrorKind::Lifecycle => "LIFECYCLE",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Selection => "SELECTION",
            ErrorKind::SystemProxy => "SYSTEM_PROXY",
            ErrorKind::Io => "IO",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Decode(e.to_string())
        } else {
            // connect refused, timeout, DNS — all transport from the
            // client's point of view
            Error::Transport(e.to_string())
        }
    }
}
