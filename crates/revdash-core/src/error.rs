use std::fmt;

/// Machine-readable error codes for operators and the status dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    RecordNotFound,
    StaleWrite,
    MigrationFailed,
    KindMismatch,
    DuplicateRegistration,
    UnknownTaskFunc,
    RemoteFetchFailed,
    RemoteNotFound,
    RemoteUnauthorized,
    RemoteParseFailed,
    WindowExhausted,
    LeaseContention,
    StoreWriteFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::RecordNotFound => "E2001",
            Self::StaleWrite => "E2002",
            Self::MigrationFailed => "E2003",
            Self::KindMismatch => "E2004",
            Self::DuplicateRegistration => "E3001",
            Self::UnknownTaskFunc => "E3002",
            Self::RemoteFetchFailed => "E4001",
            Self::RemoteNotFound => "E4002",
            Self::RemoteUnauthorized => "E4003",
            Self::RemoteParseFailed => "E4004",
            Self::WindowExhausted => "E4005",
            Self::LeaseContention => "E5001",
            Self::StoreWriteFailed => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::RecordNotFound => "Record not found",
            Self::StaleWrite => "Incoming record is older than the stored copy",
            Self::MigrationFailed => "Record migration failed",
            Self::KindMismatch => "Record kind registered with a different type",
            Self::DuplicateRegistration => "Duplicate registration",
            Self::UnknownTaskFunc => "Unknown task function",
            Self::RemoteFetchFailed => "Remote fetch failed",
            Self::RemoteNotFound => "Remote entity not found",
            Self::RemoteUnauthorized => "Remote service rejected credentials",
            Self::RemoteParseFailed => "Remote payload could not be parsed",
            Self::WindowExhausted => "Poll window cannot be narrowed further",
            Self::LeaseContention => "Lease held by another worker",
            Self::StoreWriteFailed => "Store write failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `revdash tick` once to create the store."),
            Self::ConfigParseError => Some("Fix syntax in revdash.toml and retry."),
            Self::RecordNotFound | Self::RemoteNotFound => None,
            Self::StaleWrite => Some("The next successful poll reconciles the record."),
            Self::MigrationFailed => {
                Some("Inspect the record with `revdash show` and fix the migration.")
            }
            Self::KindMismatch | Self::DuplicateRegistration => {
                Some("Each kind, job and task name must be registered exactly once.")
            }
            Self::UnknownTaskFunc => Some("The task was queued by a different build; it is dropped."),
            Self::RemoteFetchFailed => Some("The same range is retried on the next period."),
            Self::RemoteUnauthorized => {
                Some("Update the bot credentials with `revdash meta set`.")
            }
            Self::RemoteParseFailed => Some("Check the remote service for an API change."),
            Self::WindowExhausted => {
                Some("Too many updates in one burst; advance the checkpoint manually.")
            }
            Self::LeaseContention => Some("Another worker holds the lease; it expires on its own."),
            Self::StoreWriteFailed => Some("Check disk space and write permissions."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
