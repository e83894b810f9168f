use std::fmt;

/// The error taxonomy shared by every authority operation. Callers match on
/// the variant to decide between retrying, creating on demand, or failing.
pub enum AuthorityError {
    /// Malformed input. Always returned before any side effect.
    BadParameter(String),
    /// A lock, role restriction, or identity mismatch prevented the request.
    AccessDenied(String),
    NotFound(String),
    AlreadyExists(String),
    /// A compare-and-swap lost against a concurrent writer.
    CompareFailed(String),
    /// The key store could not produce a signature.
    Signing(String),
    /// The storage backend failed for a reason unrelated to the request.
    Backend(String),
    /// The process cannot continue running with the current state.
    Fatal(String),
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

impl AuthorityError {
    pub fn bad_parameter<S: Into<String>>(msg: S) -> Self {
        AuthorityError::BadParameter(msg.into())
    }

    pub fn access_denied<S: Into<String>>(msg: S) -> Self {
        AuthorityError::AccessDenied(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        AuthorityError::NotFound(msg.into())
    }

    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        AuthorityError::AlreadyExists(msg.into())
    }

    pub fn compare_failed<S: Into<String>>(msg: S) -> Self {
        AuthorityError::CompareFailed(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AuthorityError::NotFound(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, AuthorityError::AccessDenied(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, AuthorityError::AlreadyExists(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, AuthorityError::CompareFailed(_))
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, AuthorityError::BadParameter(_))
    }

    /// The human readable reason without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            AuthorityError::BadParameter(m)
            | AuthorityError::AccessDenied(m)
            | AuthorityError::NotFound(m)
            | AuthorityError::AlreadyExists(m)
            | AuthorityError::CompareFailed(m)
            | AuthorityError::Signing(m)
            | AuthorityError::Backend(m)
            | AuthorityError::Fatal(m) => m,
        }
    }

    /// Prefix the message with extra context while keeping the kind, so
    /// callers up the stack can still branch on it.
    pub fn wrap(self, context: &str) -> Self {
        let wrapped = |m: String| format!("{}: {}", context, m);
        match self {
            AuthorityError::BadParameter(m) => AuthorityError::BadParameter(wrapped(m)),
            AuthorityError::AccessDenied(m) => AuthorityError::AccessDenied(wrapped(m)),
            AuthorityError::NotFound(m) => AuthorityError::NotFound(wrapped(m)),
            AuthorityError::AlreadyExists(m) => AuthorityError::AlreadyExists(wrapped(m)),
            AuthorityError::CompareFailed(m) => AuthorityError::CompareFailed(wrapped(m)),
            AuthorityError::Signing(m) => AuthorityError::Signing(wrapped(m)),
            AuthorityError::Backend(m) => AuthorityError::Backend(wrapped(m)),
            AuthorityError::Fatal(m) => AuthorityError::Fatal(wrapped(m)),
        }
    }
}

impl fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // AccessDenied carries the exact reason shown to users (for example
        // the lock in force message) so it is printed verbatim.
        match self {
            AuthorityError::BadParameter(m) => write!(f, "bad parameter: {}", m),
            AuthorityError::AccessDenied(m) => write!(f, "{}", m),
            AuthorityError::NotFound(m) => write!(f, "not found: {}", m),
            AuthorityError::AlreadyExists(m) => write!(f, "already exists: {}", m),
            AuthorityError::CompareFailed(m) => write!(f, "compare failed: {}", m),
            AuthorityError::Signing(m) => write!(f, "signing failed: {}", m),
            AuthorityError::Backend(m) => write!(f, "backend error: {}", m),
            AuthorityError::Fatal(m) => write!(f, "fatal: {}", m),
        }
    }
}

impl fmt::Debug for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for AuthorityError {}

impl From<serde_json::Error> for AuthorityError {
    fn from(e: serde_json::Error) -> Self {
        AuthorityError::Backend(format!("could not (de)serialize resource: {}", e))
    }
}

impl From<sshcerts::error::Error> for AuthorityError {
    fn from(e: sshcerts::error::Error) -> Self {
        AuthorityError::BadParameter(format!("invalid SSH data: {}", e))
    }
}

impl From<rcgen::RcgenError> for AuthorityError {
    fn from(e: rcgen::RcgenError) -> Self {
        AuthorityError::Signing(format!("x509 generation failed: {}", e))
    }
}
