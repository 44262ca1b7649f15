//! Opaque id minting for runs and stored files

use rand::Rng;

const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 12;

/// 12 characters drawn uniformly from `[A-Za-z0-9]` behind a prefix.
///
/// `thread_rng` is cryptographically strong; collisions are not checked
/// (62^12 keyspace at expected scale).
fn mint(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(prefix.len() + ID_LEN);
    id.push_str(prefix);
    for _ in 0..ID_LEN {
        id.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    id
}

/// Mint a run id (`run_` + 12 alphanumerics).
pub fn run_id() -> String {
    mint("run_")
}

/// Mint a stored-file id (`file_` + 12 alphanumerics).
pub fn file_id() -> String {
    mint("file_")
}
