//! Node authentication on the upgrade request.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use nodegate_core::error::NodeGateError;
use nodegate_core::protocol::{NODE_ID_HEADER, NODE_SECRET_HEADER};

const MAX_NODE_ID_LEN: usize = 128;

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Compare secrets via their SHA-256 digests so length never leaks.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided_hash = format!("{:x}", Sha256::digest(provided.as_bytes()));
    let expected_hash = format!("{:x}", Sha256::digest(expected.as_bytes()));
    constant_time_eq(&provided_hash, &expected_hash)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Validate the node id and shared secret headers.
///
/// Returns the node id on success. With no secret configured every node is
/// rejected.
pub fn authenticate(headers: &HeaderMap, expected_secret: Option<&str>) -> Result<String, NodeGateError> {
    let node_id = header(headers, NODE_ID_HEADER)
        .ok_or_else(|| NodeGateError::AuthenticationFailed("missing node id".into()))?;
    if node_id.len() > MAX_NODE_ID_LEN || node_id.chars().any(char::is_control) {
        return Err(NodeGateError::AuthenticationFailed("invalid node id".into()));
    }

    let Some(expected) = expected_secret else {
        return Err(NodeGateError::AuthenticationFailed(
            "node secret not configured on gateway".into(),
        ));
    };
    let provided = header(headers, NODE_SECRET_HEADER)
        .ok_or_else(|| NodeGateError::AuthenticationFailed("missing node secret".into()))?;

    if !secrets_match(provided, expected) {
        return Err(NodeGateError::AuthenticationFailed("invalid node secret".into()));
    }
    Ok(node_id.to_string())
}
