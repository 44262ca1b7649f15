//! Environment sanitization for sandboxed runs

use std::collections::HashMap;

/// Build the environment map handed to the sandbox bootstrap.
///
/// Starts from `HOME=/work` and `TMPDIR=/work/tmp`, then applies user
/// entries, dropping any key that begins with `LD_` (case-insensitive).
/// The bootstrap clears the inherited environment and reinstates this map
/// plus a fixed `PATH`.
pub fn sanitize_env(user: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("HOME".to_string(), "/work".to_string());
    env.insert("TMPDIR".to_string(), "/work/tmp".to_string());

    for (key, value) in user {
        let bytes = key.as_bytes();
        if bytes.len() >= 3 && bytes[..3].eq_ignore_ascii_case(b"LD_") {
            continue;
        }
        env.insert(key.clone(), value.clone());
    }

    env
}
