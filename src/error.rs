//! Failures that callers need to tell apart.
//!
//! Everything else travels as a plain `anyhow::Error` with context attached.
//! These types are raised through `anyhow` and recovered with `downcast_ref`.

use std::path::PathBuf;

/// A child process exited with a nonzero status.
///
/// Carries everything the process printed so the caller can show or log it.
#[derive(Debug, thiserror::Error)]
#[error("Command failed with exit code {exit_code}: {}", args.join(" "))]
pub struct ProcessFailed {
    pub args: Vec<String>,
    pub exit_code: i32,
    pub primary_text: String,
    pub diagnostic_text: String,
}

/// A sandbox operation was invoked while no staging directory is active.
#[derive(Debug, thiserror::Error)]
#[error("'{operation}' requires an active sandbox")]
pub struct NotInSandbox {
    pub operation: &'static str,
}

/// The staging tree is in a state that makes further mutation unsafe.
#[derive(Debug, thiserror::Error)]
#[error("Sandbox integrity violation: {0}")]
pub struct SandboxIntegrityViolation(pub String);

/// A network fetch failed in a way that may succeed on retry.
#[derive(Debug, thiserror::Error)]
#[error("Failed to fetch {url}: {reason}")]
pub struct TransientFetchError {
    pub url: String,
    pub reason: String,
}

/// A configuration entry is missing a required field.
#[derive(Debug, thiserror::Error)]
#[error("Malformed config at {}: entry '{entry}' is missing required field '{field}'", path.display())]
pub struct MalformedConfig {
    pub path: PathBuf,
    pub entry: String,
    pub field: &'static str,
}

/// True when `err` (or anything in its context chain) is a transient fetch failure.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<TransientFetchError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn process_failed_message_names_command_and_code() {
        let err = ProcessFailed {
            args: vec!["apptainer".into(), "build".into()],
            exit_code: 3,
            primary_text: String::new(),
            diagnostic_text: "boom\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "Command failed with exit code 3: apptainer build"
        );
    }

    #[test]
    fn transient_detected_through_context() {
        let err: anyhow::Error = TransientFetchError {
            url: "https://example.invalid".into(),
            reason: "timed out".into(),
        }
        .into();
        let wrapped = Err::<(), _>(err)
            .context("Downloading installer")
            .unwrap_err();
        assert!(is_transient(&wrapped));
    }

    #[test]
    fn plain_errors_are_not_transient() {
        let err = anyhow::anyhow!("disk full");
        assert!(!is_transient(&err));
    }
}
