//! Verification API
//!
//! Re-derive a finished game from its revealed seed. A player holding the
//! secret, the pre-game public hash and the game id can run these offline
//! and compare against what was broadcast.

use thiserror::Error;

use crate::core::seed::{commitment_hash, verify_commitment};
use crate::game::candleflip::{self, RoomOutcome, Side};
use crate::game::crash::{self, CrashOutcome, CrashParams};

/// Errors that can occur during verification.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    /// The revealed secret does not hash to the published commitment.
    #[error("commitment mismatch: published {published}, secret hashes to {computed}")]
    CommitmentMismatch {
        /// Hash published before the game.
        published: String,
        /// Hash of the revealed secret.
        computed: String,
    },
}

fn check_commitment(secret: &str, public_hash: &str) -> Result<(), VerifyError> {
    if verify_commitment(secret, public_hash) {
        Ok(())
    } else {
        Err(VerifyError::CommitmentMismatch {
            published: public_hash.to_string(),
            computed: commitment_hash(secret),
        })
    }
}

/// Check the commitment, then replay the crash game.
pub fn verify_crash(
    secret: &str,
    public_hash: &str,
    game_id: &str,
) -> Result<CrashOutcome, VerifyError> {
    verify_crash_with(secret, public_hash, game_id, CrashParams::default())
}

/// [`verify_crash`] for a server running non-default walk parameters.
pub fn verify_crash_with(
    secret: &str,
    public_hash: &str,
    game_id: &str,
    params: CrashParams,
) -> Result<CrashOutcome, VerifyError> {
    check_commitment(secret, public_hash)?;
    Ok(crash::simulate_with(secret, game_id, params))
}

/// Peak only, without walking the ticks.
pub fn verify_crash_peak(
    secret: &str,
    public_hash: &str,
    game_id: &str,
) -> Result<f64, VerifyError> {
    check_commitment(secret, public_hash)?;
    Ok(crash::draw_peak(secret, game_id))
}

/// Winner of a standalone candleflip game.
pub fn verify_candleflip(secret: &str, public_hash: &str) -> Result<Side, VerifyError> {
    check_commitment(secret, public_hash)?;
    Ok(candleflip::simulate_game(secret).1)
}

/// Replay every room of a candleflip batch.
pub fn verify_batch(
    secret: &str,
    public_hash: &str,
    rooms: usize,
) -> Result<Vec<RoomOutcome>, VerifyError> {
    check_commitment(secret, public_hash)?;
    Ok((0..rooms).map(|i| candleflip::simulate_room(secret, i)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::seed::GameSeed;

    #[test]
    fn test_verify_crash_replays_outcome() {
        let seed = GameSeed::from_secret([9; 32]);
        let outcome = verify_crash(&seed.secret_hex(), seed.public_hash(), "42").unwrap();
        assert_eq!(outcome, crash::simulate(&seed.secret_hex(), "42"));

        let peak = verify_crash_peak(&seed.secret_hex(), seed.public_hash(), "42").unwrap();
        assert_eq!(peak, outcome.peak_multiplier);
    }

    #[test]
    fn test_wrong_commitment_rejected() {
        let seed = GameSeed::from_secret([9; 32]);
        let other = GameSeed::from_secret([8; 32]);
        let err = verify_crash(&seed.secret_hex(), other.public_hash(), "42").unwrap_err();
        assert!(matches!(err, VerifyError::CommitmentMismatch { .. }));
        assert!(verify_candleflip(&seed.secret_hex(), other.public_hash()).is_err());
    }

    #[test]
    fn test_verify_batch_matches_rooms() {
        let seed = GameSeed::from_secret([3; 32]);
        let rooms = verify_batch(&seed.secret_hex(), seed.public_hash(), 4).unwrap();
        assert_eq!(rooms.len(), 4);
        for (i, room) in rooms.iter().enumerate() {
            assert_eq!(room, &candleflip::simulate_room(&seed.secret_hex(), i));
        }
    }
}
