use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::SESSION_KEY_LENGTH;

/// Random alphanumeric session key.
pub fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// File-system safe form of an arbitrary identifier.
pub fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
