use rand::RngCore;

/// A short random identifier: 8 random bytes, hex-encoded. Used for both
/// session ids and message ids.
pub fn short_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
