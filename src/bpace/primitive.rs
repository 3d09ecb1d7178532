//! Call contract for the BPACE key-agreement primitive.
//!
//! The arithmetic of the key agreement is not implemented here; it is
//! supplied by an external primitive library behind [`KeyAgreement`]. This
//! module fixes the shapes the protocol engine relies on: buffer lengths
//! derived from the domain parameters, the deterministic generator the
//! primitive consumes, and the session keys it produces.


use std::fmt;

use zeroize::{Zeroize, Zeroizing};
use zeroize_derive::ZeroizeOnDrop;


/// The fixed password input buffer of the primitive. Longer passwords are
/// rejected up front rather than silently truncated.
pub const MAX_PASSWORD_LEN: usize = 16;


/// A named domain parameter set for the key agreement.
///
/// Every protocol buffer length is derived from `l`, the security parameter
/// in bits; nothing in the engine hard-codes a particular set.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DomainParams {
    /// Dotted-decimal object identifier of the parameter set.
    pub oid: &'static str,
    /// Security parameter in bits.
    pub l: usize,
    /// Seed for the deterministic generator, taken from the parameter set.
    pub seed: [u8; 8],
}
impl DomainParams {
    /// The standard 256-bit curve parameter set used by the deployed cards.
    pub const fn bign_curve256v1() -> Self {
        Self {
            oid: "1.2.112.0.2.0.34.101.45.3.1",
            l: 128,
            seed: [0x00; 8],
        }
    }

    /// Length in bytes of the encrypted nonce produced at step 2.
    pub const fn nonce_len(&self) -> usize {
        self.l / 8
    }

    /// Length in bytes of the public value plus token produced at step 4.
    pub const fn token_len(&self) -> usize {
        self.l / 2 + 8
    }
}


/// A deterministic pseudo-random generator.
///
/// The engine re-seeds the generator explicitly before each step that
/// consumes randomness; the primitive requires the same byte stream at
/// step 2 and step 4.
pub trait DeterministicRng {
    fn reseed(&mut self, seed: &[u8]);
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

/// A generator that replays its seed cyclically.
///
/// This matches the echo generator the primitive library is driven with:
/// deterministic by construction, with no hidden state beyond the seed and
/// the read position. Before the first reseed it yields zeroes.
#[derive(ZeroizeOnDrop)]
pub struct EchoRng {
    seed: Vec<u8>,
    #[zeroize(skip)] position: usize,
}
impl EchoRng {
    pub const fn new() -> Self {
        Self {
            seed: Vec::new(),
            position: 0,
        }
    }
}
impl Default for EchoRng {
    fn default() -> Self { Self::new() }
}
impl DeterministicRng for EchoRng {
    fn reseed(&mut self, seed: &[u8]) {
        self.seed.zeroize();
        self.seed = seed.to_vec();
        self.position = 0;
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if self.seed.is_empty() {
            dest.fill(0);
            return;
        }
        for byte in dest.iter_mut() {
            *byte = self.seed[self.position];
            self.position = (self.position + 1) % self.seed.len();
        }
    }
}


/// The two independent session keys produced by a successful key agreement.
#[derive(Clone, Eq, PartialEq, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub enc: [u8; 32],
    pub mac: [u8; 32],
}
impl fmt::Debug for SessionKeys {
    // never prints key material
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKeys {} .. {}", '{', '}')
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyAgreementError {
    PasswordTooLong { maximum: usize, obtained: usize },
    NotStarted,
    StepOutOfOrder,
    BadPeerValue,
    TokenMismatch,
    Backend(i32),
}
impl fmt::Display for KeyAgreementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PasswordTooLong { maximum, obtained }
                => write!(f, "password is {} bytes long, expected at most {} bytes", obtained, maximum),
            Self::NotStarted
                => write!(f, "key agreement has not been started"),
            Self::StepOutOfOrder
                => write!(f, "key agreement step invoked out of order"),
            Self::BadPeerValue
                => write!(f, "peer sent an invalid key agreement value"),
            Self::TokenMismatch
                => write!(f, "authentication token mismatch"),
            Self::Backend(code)
                => write!(f, "primitive library failed with code {}", code),
        }
    }
}
impl std::error::Error for KeyAgreementError {
}


/// The password-authenticated key agreement, step by step.
///
/// An implementation owns all of its intermediate state exclusively and
/// wipes it when dropped. The engine drives the steps strictly in order:
/// `start`, `step2`, `step4`, `step6`, `session_keys`; implementations are
/// free to reject any other sequence with [`KeyAgreementError::StepOutOfOrder`].
pub trait KeyAgreement {
    /// The domain parameter set this agreement was instantiated with.
    fn params(&self) -> &DomainParams;

    /// Bind the shared password and the hello-A bytes (the concatenated
    /// authorization templates) into the agreement state.
    fn start(&mut self, password: &[u8], hello_a: &[u8]) -> Result<(), KeyAgreementError>;

    /// Produce the terminal's encrypted nonce, [`DomainParams::nonce_len`]
    /// bytes long.
    fn step2(&mut self, rng: &mut dyn DeterministicRng) -> Result<Zeroizing<Vec<u8>>, KeyAgreementError>;

    /// Consume the card's reply and produce the terminal's ephemeral public
    /// value and token, [`DomainParams::token_len`] bytes long.
    fn step4(&mut self, rng: &mut dyn DeterministicRng, message2: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyAgreementError>;

    /// Verify the card's authentication token.
    fn step6(&mut self, card_token: &[u8]) -> Result<(), KeyAgreementError>;

    /// Derive the definitive session keys. Only valid after [`KeyAgreement::step6`]
    /// has succeeded.
    fn session_keys(&mut self) -> Result<SessionKeys, KeyAgreementError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_rng_replays_seed() {
        let mut rng = EchoRng::new();
        rng.reseed(&[1, 2, 3]);
        let mut buf = [0u8; 7];
        rng.fill_bytes(&mut buf);
        assert_eq!(buf, [1, 2, 3, 1, 2, 3, 1]);
        // continues where it left off
        let mut more = [0u8; 2];
        rng.fill_bytes(&mut more);
        assert_eq!(more, [2, 3]);
    }

    #[test]
    fn echo_rng_reseed_restarts() {
        let mut rng = EchoRng::new();
        rng.reseed(&[9, 8]);
        let mut buf = [0u8; 3];
        rng.fill_bytes(&mut buf);
        rng.reseed(&[9, 8]);
        let mut again = [0u8; 3];
        rng.fill_bytes(&mut again);
        assert_eq!(buf, again);
    }

    #[test]
    fn lengths_follow_security_parameter() {
        let params = DomainParams::bign_curve256v1();
        assert_eq!(params.nonce_len(), 16);
        assert_eq!(params.token_len(), 72);

        let other = DomainParams { oid: "1.2.112.0.2.0.34.101.45.3.2", l: 192, seed: [0; 8] };
        assert_eq!(other.nonce_len(), 24);
        assert_eq!(other.token_len(), 104);
    }
}
