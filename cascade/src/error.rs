//! Error types and result definitions for cascade operations.
//!
//! [`CascadeError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source and the call site where it was created. Several errors can
//! be aggregated into one, which the copy worker pool uses to report all failed copies at once.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use cascade_postgres::NodeCallError;

/// Result type used throughout the crate.
pub type CascadeResult<T> = Result<T, CascadeError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the crate.
#[derive(Debug, Clone)]
pub struct CascadeError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<CascadeError>,
        location: &'static Location<'static>,
    },
}

/// Classification of cascade failures.
///
/// The kind decides how a worker reacts, see
/// [`build_error_handling_policy`](crate::workers::policy::build_error_handling_policy).
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connectivity
    SourceConnectionFailed,
    TargetConnectionFailed,
    PeerUnreachable,
    ConnectionFailed,
    Timeout,

    // Query execution
    QueryFailed,
    QueryRetryable,
    ConstraintViolation,
    NodeCallFailed,

    // Protocol violations
    UnknownControlEvent,
    LostPosition,
    RetryEventInCascade,
    InvalidEventFormat,
    InvalidTableTransition,
    InvalidSnapshot,
    InvalidNodeType,
    InvalidHandler,

    // Coordination conflicts
    MissingConsumerState,
    MissingTableState,
    StateOwnershipViolation,
    CopyAlreadyRunning,

    // Operator completion required
    TopologyChangeIncomplete,
    NodeCommandFailed,
    DumpFileExists,

    // General
    ConfigError,
    ConversionError,
    IoError,
    SerializationError,
    DeserializationError,
    WorkerPanic,
    Unknown,

    // Fault injection
    #[cfg(feature = "failpoints")]
    WithNoRetry,
    #[cfg(feature = "failpoints")]
    WithManualRetry,
    #[cfg(feature = "failpoints")]
    WithTimedRetry,
}

impl CascadeError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns the kinds of all contained errors.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the dynamic detail, or the first one found among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Short single line rendering, stored on the consumer row.
    pub fn summary(&self) -> String {
        match &self.repr {
            ErrorRepr::Single(payload) => match &payload.detail {
                Some(detail) => format!("[{:?}] {}: {}", payload.kind, payload.description, detail),
                None => format!("[{:?}] {}", payload.kind, payload.description),
            },
            ErrorRepr::Many { errors, .. } => errors
                .iter()
                .map(|err| err.summary())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    /// Attaches an originating error. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        CascadeError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for CascadeError {
    fn eq(&self, other: &CascadeError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for CascadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = &payload.detail {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write!(f, "\n  Backtrace:")?;
                    for line in backtrace.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} errors aggregated @ {}:{}:{}",
                    errors.len(),
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    if let Some(first_line) = lines.next() {
                        write!(f, "\n  {}. {}", index + 1, first_line)?;
                    }
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for CascadeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for CascadeError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> CascadeError {
        CascadeError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for CascadeError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> CascadeError {
        CascadeError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors; a single error is returned unwrapped.
impl<E> From<Vec<E>> for CascadeError
where
    E: Into<CascadeError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> CascadeError {
        let location = Location::caller();
        let mut errors: Vec<CascadeError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        CascadeError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for CascadeError {
    #[track_caller]
    fn from(err: std::io::Error) -> CascadeError {
        let detail = err.to_string();
        CascadeError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for CascadeError {
    #[track_caller]
    fn from(err: serde_json::Error) -> CascadeError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::DeserializationError, "JSON deserialization failed")
            }
        };

        let detail = err.to_string();
        CascadeError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<std::num::ParseIntError> for CascadeError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> CascadeError {
        let detail = err.to_string();
        CascadeError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Integer parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<chrono::ParseError> for CascadeError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> CascadeError {
        let detail = err.to_string();
        CascadeError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Timestamp parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<tokio::time::error::Elapsed> for CascadeError {
    #[track_caller]
    fn from(err: tokio::time::error::Elapsed) -> CascadeError {
        CascadeError::from_components(
            ErrorKind::Timeout,
            Cow::Borrowed("Operation timed out"),
            None,
            Some(Arc::new(err)),
        )
    }
}

/// Maps a SQLSTATE code to an error kind.
///
/// Connection class errors and the server going away are retryable by nature; serialization
/// failures, deadlocks, lock timeouts and cancellations are retryable because the batch is
/// replayed from scratch.
fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code {
        c if c.starts_with("08") => (ErrorKind::ConnectionFailed, "PostgreSQL connection failed"),
        "57P01" | "57P02" | "57P03" => (
            ErrorKind::ConnectionFailed,
            "PostgreSQL server shutting down or starting up",
        ),
        "53300" => (ErrorKind::ConnectionFailed, "PostgreSQL has too many connections"),
        "40001" | "40P01" => (ErrorKind::QueryRetryable, "PostgreSQL transaction conflict"),
        "55P03" => (ErrorKind::QueryRetryable, "PostgreSQL lock not available"),
        "57014" => (ErrorKind::QueryRetryable, "PostgreSQL query canceled"),
        c if c.starts_with("23") => (
            ErrorKind::ConstraintViolation,
            "PostgreSQL constraint violation",
        ),
        c if c.starts_with("22") => (
            ErrorKind::ConversionError,
            "PostgreSQL data conversion failed",
        ),
        _ => (ErrorKind::QueryFailed, "PostgreSQL query failed"),
    }
}

impl From<sqlx::Error> for CascadeError {
    #[track_caller]
    fn from(err: sqlx::Error) -> CascadeError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => classify_sqlstate(&code),
                None => (ErrorKind::QueryFailed, "PostgreSQL query failed"),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => {
                (ErrorKind::ConnectionFailed, "PostgreSQL connection failed")
            }
            sqlx::Error::RowNotFound => (ErrorKind::QueryFailed, "PostgreSQL returned no rows"),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                (ErrorKind::ConversionError, "PostgreSQL value decoding failed")
            }
            sqlx::Error::Configuration(_) => {
                (ErrorKind::ConfigError, "PostgreSQL connection configuration invalid")
            }
            _ => (ErrorKind::QueryFailed, "PostgreSQL query failed"),
        };

        let detail = err.to_string();
        CascadeError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<NodeCallError> for CascadeError {
    #[track_caller]
    fn from(err: NodeCallError) -> CascadeError {
        match err {
            NodeCallError::Database(err) => err.into(),
            NodeCallError::Failed { .. } => {
                let detail = err.to_string();
                CascadeError::from_components(
                    ErrorKind::NodeCallFailed,
                    Cow::Borrowed("Node function reported failure"),
                    Some(Cow::Owned(detail)),
                    Some(Arc::new(err)),
                )
            }
            NodeCallError::NoRows { .. } => {
                let detail = err.to_string();
                CascadeError::from_components(
                    ErrorKind::QueryFailed,
                    Cow::Borrowed("Node function returned no rows"),
                    Some(Cow::Owned(detail)),
                    Some(Arc::new(err)),
                )
            }
            NodeCallError::InvalidLocation { .. } => {
                let detail = err.to_string();
                CascadeError::from_components(
                    ErrorKind::ConfigError,
                    Cow::Borrowed("Node location is invalid"),
                    Some(Cow::Owned(detail)),
                    Some(Arc::new(err)),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, cascade_error};

    #[test]
    fn test_single_error_display_contains_kind_and_detail() {
        let err = cascade_error!(ErrorKind::LostPosition, "Lost position", "completed tick 7");
        let rendered = err.to_string();
        assert!(rendered.starts_with("[LostPosition] Lost position @"));
        assert!(rendered.contains("completed tick 7"));
        assert_eq!(err.detail(), Some("completed tick 7"));
    }

    #[test]
    fn test_aggregation_of_one_error_unwraps() {
        let err: CascadeError = vec![cascade_error!(ErrorKind::IoError, "io")].into();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(err.kinds(), vec![ErrorKind::IoError]);
    }

    #[test]
    fn test_aggregation_keeps_all_kinds() {
        let err: CascadeError = vec![
            cascade_error!(ErrorKind::IoError, "io"),
            cascade_error!(ErrorKind::LostPosition, "lost"),
        ]
        .into();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(err.kinds(), vec![ErrorKind::IoError, ErrorKind::LostPosition]);
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn test_summary_is_single_line() {
        let err = cascade_error!(ErrorKind::QueryFailed, "Query failed", "relation missing");
        assert_eq!(err.summary(), "[QueryFailed] Query failed: relation missing");
    }

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify_sqlstate("08006").0, ErrorKind::ConnectionFailed);
        assert_eq!(classify_sqlstate("40P01").0, ErrorKind::QueryRetryable);
        assert_eq!(classify_sqlstate("23505").0, ErrorKind::ConstraintViolation);
        assert_eq!(classify_sqlstate("42P01").0, ErrorKind::QueryFailed);
    }

    #[test]
    fn test_node_call_failure_maps_to_node_call_failed() {
        let err: CascadeError = NodeCallError::Failed {
            function: "pgq_node.promote_branch",
            code: 301,
            note: "Node is not branch".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NodeCallFailed);
        assert!(err.detail().unwrap_or_default().contains("301"));
    }

    fn bails() -> CascadeResult<()> {
        bail!(ErrorKind::DumpFileExists, "Dump file exists", "lost.json");
    }

    #[test]
    fn test_bail_returns_error() {
        assert_eq!(bails().unwrap_err().kind(), ErrorKind::DumpFileExists);
    }
}
