//! Random tokens for invitation links

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated invitation tokens
pub const INVITATION_TOKEN_LEN: usize = 32;

/// Generate an unguessable, URL-safe invitation token
///
/// 32 alphanumeric characters from the thread-local CSPRNG, roughly 190 bits
/// of entropy.
pub fn generate_invitation_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INVITATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}
