use std::fmt;

use crate::landing::LandingError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    UserError,
    MethodNotAllowed,
    NotFound,
    Conflict,
    ServerError,
}

impl ErrorKind {
    fn as_http_code(self) -> u16 {
        match self {
            ErrorKind::UserError => 400,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::ServerError => 500,
        }
    }

    fn description(self) -> &'static str {
        match self {
            ErrorKind::UserError => "Client error",
            ErrorKind::MethodNotAllowed => "Method not allowed",
            ErrorKind::NotFound => "Not found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::ServerError => "Server error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// An error that ends a single request. The message is sent to the client
/// as is, so it never carries filesystem details.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    pub fn new<T: fmt::Display>(kind: ErrorKind, msg: T) -> Self {
        Error {
            kind,
            msg: msg.to_string(),
        }
    }

    pub fn as_http_code(&self) -> u16 {
        self.kind.as_http_code()
    }

    /// Plain text body, terminated by a newline.
    pub fn as_text(&self) -> String {
        format!("{}\n", self.msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.as_http_code(), self.kind, self.msg)
    }
}

impl From<LandingError> for Error {
    fn from(err: LandingError) -> Self {
        match err {
            LandingError::AlreadyExists { .. } => {
                Error::new(ErrorKind::Conflict, "File already exists.")
            }
            _ => Error::new(ErrorKind::ServerError, "Unable to store file."),
        }
    }
}
