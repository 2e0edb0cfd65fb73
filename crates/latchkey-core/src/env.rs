//! Environment abstraction for deterministic testing.
//!
//! Decouples account and contact logic from system resources (wall clock,
//! randomness). Production uses [`crate::SystemEnv`]; tests provide a
//! settable clock and a seeded RNG.

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect test setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Wall clock time in milliseconds since the Unix epoch.
    ///
    /// Used for key creation timestamps and age checks. Not required to be
    /// monotonic; a clock step backwards only makes keys look younger.
    fn now_millis(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u32`.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// Generates 32 random bytes, the size of every secret key in use.
    fn random_key(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        bytes
    }
}
