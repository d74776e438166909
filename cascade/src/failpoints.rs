use fail::fail_point;

use crate::bail;
use crate::error::{CascadeResult, ErrorKind};

/// Fires right before the batch transaction commits on the target.
pub const WORKER_BEFORE_COMMIT: &str = "worker.before_commit";

/// Fires between the bulk copy and the switch to catching-up.
pub const COPY_AFTER_BULK_COPY: &str = "copy.after_bulk_copy";

/// Evaluates a fail point, returning an error whose kind is chosen by the fail point argument.
pub fn cascade_fail_point(name: &str) -> CascadeResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("manual_retry") => ErrorKind::WithManualRetry,
            Some("timed_retry") => ErrorKind::WithTimedRetry,
            _ => ErrorKind::WithNoRetry,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
