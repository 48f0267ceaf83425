//! Run digests
//!
//! A run is reproducible: the same question and the same external answers
//! give the same final state, and therefore the same digest.

use crate::state::State;
use sha2::{Digest, Sha256};
use std::io::Write;

/// SHA256 of the serialized state (credentials excluded).
/// Streams JSON directly into the hasher.
pub fn compute_state_digest(state: &State) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), state).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    #[test]
    fn test_digest_ignores_credentials() {
        let a = State::new("question", Credentials::new("id", "secret-a", "key-a"));
        let b = State::new("question", Credentials::new("id", "secret-b", "key-b"));
        assert_eq!(compute_state_digest(&a), compute_state_digest(&b));
        assert_eq!(compute_state_digest(&a).len(), 64);
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = State::new("question", Credentials::default());
        let mut b = a.clone();
        b.add_note("no data found");
        assert_ne!(compute_state_digest(&a), compute_state_digest(&b));
    }
}
