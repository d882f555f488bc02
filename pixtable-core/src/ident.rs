pub use uuid::Uuid;

/// Derive a stable 128-bit identity from arbitrary text by reinterpreting its
/// MD5 digest as UUID bytes. Useful for computing a source image UUID from a
/// URL when the backing service does not hand out one of its own.
pub fn uuid_from_md5(text: &str) -> Uuid {
    let digest = md5::compute(text.as_bytes());
    Uuid::from_bytes(digest.0)
}
