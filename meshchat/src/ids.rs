//! Injected identifier and fingerprint generation.
//!
//! Stores and the session never mint identifiers themselves; they ask an
//! [`IdGenerator`]. Production code uses [`RandomIds`], tests use
//! [`SequentialIds`] so that ids and fingerprints are predictable.

use std::sync::atomic::{AtomicU64, Ordering};

use meshchat_proto::ids::Fingerprint;
use rand::Rng;

/// Alphabet used for the random blocks of a generated fingerprint.
const FINGERPRINT_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of each random block in `MESH-XXXX-XXXX`.
const FINGERPRINT_BLOCK_LEN: usize = 4;

/// Source of record identifiers and network fingerprints.
pub trait IdGenerator: Send + Sync {
    /// Returns a fresh record identifier, unique for the generator's lifetime.
    fn next_id(&self) -> String;

    /// Returns a fresh fingerprint of the form `MESH-XXXX-XXXX`.
    fn fingerprint(&self) -> Fingerprint;
}

/// Generator backed by UUID v7 ids and random fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl RandomIds {
    fn random_block(rng: &mut impl Rng) -> String {
        (0..FINGERPRINT_BLOCK_LEN)
            .map(|_| {
                let idx = rng.random_range(0..FINGERPRINT_ALPHABET.len());
                char::from(FINGERPRINT_ALPHABET[idx])
            })
            .collect()
    }
}

impl IdGenerator for RandomIds {
    fn next_id(&self) -> String {
        uuid::Uuid::now_v7().to_string()
    }

    fn fingerprint(&self) -> Fingerprint {
        let mut rng = rand::rng();
        let first = Self::random_block(&mut rng);
        let second = Self::random_block(&mut rng);
        Fingerprint::new(format!("MESH-{first}-{second}"))
    }
}

/// Deterministic generator: ids `1, 2, 3, …` and fingerprints
/// `MESH-0001-0001, MESH-0002-0002, …`.
#[derive(Debug)]
pub struct SequentialIds {
    next_id: AtomicU64,
    next_fingerprint: AtomicU64,
}

impl SequentialIds {
    /// Creates a generator whose first id is `"1"`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_fingerprint: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn fingerprint(&self) -> Fingerprint {
        let n = self.next_fingerprint.fetch_add(1, Ordering::Relaxed);
        Fingerprint::new(format!("MESH-{n:04}-{n:04}"))
    }
}
