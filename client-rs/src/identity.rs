//! Random identifiers for client identities and correlation ids

use rand::distr::Alphanumeric;
use rand::Rng;

/// Length of a generated client identity
pub const IDENTITY_LEN: usize = 12;

/// Length of a generated correlation id
pub const CORRELATION_ID_LEN: usize = 8;

/// Random string over `[A-Za-z0-9]`
pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh client identity
pub fn client_identity() -> String {
    random_id(IDENTITY_LEN)
}

/// Fresh correlation id for a wait-for-reply publish
pub fn correlation_id() -> String {
    random_id(CORRELATION_ID_LEN)
}
