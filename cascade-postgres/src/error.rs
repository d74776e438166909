use sqlx::FromRow;
use thiserror::Error;

/// First status code that `pgq_node` and `londiste` functions use to report failure.
const FAILURE_CODE_THRESHOLD: i32 = 300;

/// The `(ret_code, ret_note)` pair returned by most `pgq_node` and `londiste` functions.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct ReturnStatus {
    pub ret_code: i32,
    pub ret_note: String,
}

impl ReturnStatus {
    /// Returns `true` when the function reported success.
    pub fn is_ok(&self) -> bool {
        self.ret_code < FAILURE_CODE_THRESHOLD
    }

    /// Converts a failure status into a [`NodeCallError`].
    pub fn check(self, function: &'static str) -> Result<Self, NodeCallError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(NodeCallError::Failed {
                function,
                code: self.ret_code,
                note: self.ret_note,
            })
        }
    }
}

/// Errors raised by the node function wrappers.
#[derive(Debug, Error)]
pub enum NodeCallError {
    /// The SQL function executed but reported a failure status.
    #[error("{function} failed with code {code}: {note}")]
    Failed {
        function: &'static str,
        code: i32,
        note: String,
    },

    /// The SQL function returned no row where one was expected.
    #[error("{function} returned no rows")]
    NoRows { function: &'static str },

    /// A node location string could not be parsed.
    #[error("invalid node location `{location}`: {reason}")]
    InvalidLocation { location: String, reason: String },

    /// The underlying database call failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_below_threshold_is_ok() {
        let status = ReturnStatus {
            ret_code: 200,
            ret_note: "ok".to_string(),
        };
        assert!(status.clone().check("pgq_node.test").is_ok());
    }

    #[test]
    fn test_status_above_threshold_fails() {
        let status = ReturnStatus {
            ret_code: 404,
            ret_note: "Node not found".to_string(),
        };
        let err = status.check("pgq_node.get_node_info").unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("pgq_node.get_node_info"));
    }
}
