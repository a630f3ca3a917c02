use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SourceNotFound,
    RenderError,
    IoFailure,
    BackupFailed,
    WriteFailed,
    PermissionDenied,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SourceNotFound => "source-not-found",
            ErrorKind::RenderError => "render-error",
            ErrorKind::IoFailure => "io-failure",
            ErrorKind::BackupFailed => "backup-failed",
            ErrorKind::WriteFailed => "write-failed",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Re-label an error raised by a shared helper for the step that failed.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::IoFailure, err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

// chown/chmod refusals surface as PermissionDenied; anything else is plain I/O.
pub fn acl_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => match err.raw_os_error() {
            Some(code) if code == libc::EPERM || code == libc::EACCES => {
                ErrorKind::PermissionDenied
            }
            _ => ErrorKind::IoFailure,
        },
    }
}

pub type Result<T> = std::result::Result<T, Error>;
