//! Cache keys — 16-byte content fingerprints of an argv vector.
//!
//! The key is a pure function of the literal argv: environment, working
//! directory and stdin contents never influence it. MD5 is a
//! fingerprint here, not a security boundary; the cache is per-user and
//! local.

use std::fmt;

use crate::error::RingneckError;

/// Content fingerprint of one command line.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Derive the key for an argv vector.
    ///
    /// Each element is fed to the digest followed by a NUL terminator.
    /// Argv strings cannot contain NUL, so the canonical byte form is
    /// injective: `["ab", "c"]` and `["a", "bc"]` hash differently.
    pub fn for_argv<S: AsRef<str>>(argv: &[S]) -> Self {
        let mut ctx = md5::Context::new();
        for arg in argv {
            ctx.consume(arg.as_ref().as_bytes());
            ctx.consume([0u8]);
        }
        CacheKey(ctx.compute().0)
    }

    /// Parse the 32-hex-digit form users pass to `--key`.
    pub fn parse(text: &str) -> Result<Self, RingneckError> {
        let raw = hex::decode(text).map_err(|_| RingneckError::InvalidKey)?;
        let bytes: [u8; 16] = raw.try_into().map_err(|_| RingneckError::InvalidKey)?;
        Ok(CacheKey(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Key values are stable across releases; users keep them in
        // scripts via --key.
        assert_eq!(
            CacheKey::for_argv(&["pwd"]).to_hex(),
            "2a0a3031d9c37d89ab8184bd7e79a82c"
        );
        assert_eq!(
            CacheKey::for_argv(&["echo", "-n", "out"]).to_hex(),
            "2b0d740593a1d44e081461e5d3da1cf3"
        );
    }

    #[test]
    fn deterministic() {
        let argv = ["seq", "1", "10"];
        assert_eq!(CacheKey::for_argv(&argv), CacheKey::for_argv(&argv));
    }

    #[test]
    fn element_boundaries_matter() {
        assert_ne!(
            CacheKey::for_argv(&["ab", "c"]),
            CacheKey::for_argv(&["a", "bc"])
        );
        assert_ne!(CacheKey::for_argv(&["ab"]), CacheKey::for_argv(&["ab", ""]));
        assert_ne!(
            CacheKey::for_argv(&["echo", "x"]),
            CacheKey::for_argv(&["echo x"])
        );
    }

    #[test]
    fn hex_roundtrip() {
        let key = CacheKey::for_argv(&["uuidgen"]);
        let parsed = CacheKey::parse(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn malformed_keys_rejected() {
        assert!(CacheKey::parse("666").is_err());
        assert!(CacheKey::parse("").is_err());
        assert!(CacheKey::parse("zz0a3031d9c37d89ab8184bd7e79a82c").is_err());
        // Right charset, wrong length.
        assert!(CacheKey::parse("2a0a3031d9c37d89").is_err());
    }
}
