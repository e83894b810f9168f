use portcullis::error::AuthorityError;

use std::error;
use std::fmt;

#[derive(Debug)]
pub enum RequestError {
    /// The caller gave up before credentials were available.
    Canceled,
    /// Another caller's request for the same identity failed. Carries
    /// that request's error.
    CoalescedRequestFailed(String),
    /// The authority refused or failed to issue.
    Authority(AuthorityError),
    /// Issued credentials could not be read back.
    BadCredentials(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RequestError::Canceled => write!(f, "Credential request was canceled"),
            RequestError::CoalescedRequestFailed(ref err) => {
                write!(f, "Concurrent credential request failed: {}", err)
            }
            RequestError::Authority(ref err) => write!(f, "Error from authority: {}", err),
            RequestError::BadCredentials(ref err) => write!(f, "Issued credentials are unusable: {}", err),
        }
    }
}

impl error::Error for RequestError {}

impl From<AuthorityError> for RequestError {
    fn from(e: AuthorityError) -> Self {
        RequestError::Authority(e)
    }
}

impl From<rcgen::RcgenError> for RequestError {
    fn from(e: rcgen::RcgenError) -> Self {
        debug!("Key generation error: {}", e);
        RequestError::BadCredentials(e.to_string())
    }
}
