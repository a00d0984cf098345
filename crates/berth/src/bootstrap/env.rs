//! Environment reset from the sentinel file.

use std::path::Path;

use berth_common::{BerthError, BerthResult};

use super::Step;
use super::syscall::Syscall;

/// Parse the sentinel payload: a JSON array of `KEY=VALUE` or bare `KEY` strings.
///
/// Order is preserved; a bare key maps to an empty value.
///
/// # Errors
///
/// Returns an error if the payload is not a JSON array of strings.
pub fn parse_sentinel(content: &[u8]) -> BerthResult<Vec<(String, String)>> {
    let lines: Vec<String> = serde_json::from_slice(content).map_err(|e| {
        BerthError::bootstrap(
            Step::Environment,
            format!("Unable to unmarshal environment variables: {e}"),
        )
    })?;

    Ok(lines.iter().map(|kv| split_pair(kv)).collect())
}

fn split_pair(kv: &str) -> (String, String) {
    match kv.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (kv.to_string(), String::new()),
    }
}

/// Render an environment as sentinel content.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_sentinel(env: &[String]) -> BerthResult<Vec<u8>> {
    Ok(serde_json::to_vec(env)?)
}

fn settable(key: &str, value: &str) -> bool {
    !key.is_empty() && !key.contains(['=', '\0']) && !value.contains('\0')
}

/// Clear the inherited environment and repopulate it from `sentinel`.
///
/// The environment is cleared before the file is read, so a missing sentinel
/// still leaves nothing of the launcher's environment behind.
///
/// # Errors
///
/// Returns a bootstrap error if the sentinel cannot be read or parsed.
pub fn reset_environment<S: Syscall + ?Sized>(sys: &S, sentinel: &Path) -> BerthResult<()> {
    sys.clear_env();

    let content = sys.read_file(sentinel).map_err(|e| {
        BerthError::bootstrap(
            Step::Environment,
            format!("Unable to load environment variables from {}: {e}", sentinel.display()),
        )
    })?;

    let pairs = parse_sentinel(&content)?;
    for (key, value) in &pairs {
        if settable(key, value) {
            sys.set_env(key, value);
        } else {
            tracing::warn!(key = %key, "Skipping environment entry that cannot be set");
        }
    }

    tracing::debug!(count = pairs.len(), "Environment reset");
    Ok(())
}
