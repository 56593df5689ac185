// Wrapper for sha1 libraries.
// Chunk verification is where nearly all CPU time of the hashing worker goes,
// so the implementation is swappable at compile time. The pure-rust one is
// the default as it needs no system libraries.

#[cfg(not(any(feature = "sha1-rust", feature = "sha1-crypto-hash")))]
compile_error!("enable one of the \"sha1-rust\" or \"sha1-crypto-hash\" features");

#[cfg(feature = "sha1-crypto-hash")]
pub type Sha1 = Sha1CryptoHash;

#[cfg(all(feature = "sha1-rust", not(feature = "sha1-crypto-hash")))]
pub type Sha1 = Sha1Rust;

pub const DIGEST_LEN: usize = 20;

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; DIGEST_LEN];

    /// Hash a sequence of buffers in one go.
    fn digest<'a>(bufs: impl IntoIterator<Item = &'a [u8]>) -> [u8; DIGEST_LEN]
    where
        Self: Sized,
    {
        let mut h = Self::new();
        for buf in bufs {
            h.update(buf);
        }
        h.finish()
    }
}

#[cfg(feature = "sha1-rust")]
pub struct Sha1Rust {
    inner: sha1::Sha1,
}

#[cfg(feature = "sha1-rust")]
impl ISha1 for Sha1Rust {
    fn new() -> Self {
        use sha1::Digest;
        Sha1Rust {
            inner: sha1::Sha1::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        sha1::Digest::update(&mut self.inner, buf)
    }

    fn finish(self) -> [u8; DIGEST_LEN] {
        sha1::Digest::finalize(self.inner).into()
    }
}

#[cfg(feature = "sha1-crypto-hash")]
pub struct Sha1CryptoHash {
    inner: crypto_hash::Hasher,
}

#[cfg(feature = "sha1-crypto-hash")]
impl ISha1 for Sha1CryptoHash {
    fn new() -> Self {
        Self {
            inner: crypto_hash::Hasher::new(crypto_hash::Algorithm::SHA1),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use std::io::Write;
        // Writing into the hasher only fails if the underlying library is broken.
        if let Err(e) = self.inner.write_all(buf) {
            panic!("sha1 hasher rejected input: {e}");
        }
    }

    fn finish(mut self) -> [u8; DIGEST_LEN] {
        let result = self.inner.finish();
        debug_assert_eq!(result.len(), DIGEST_LEN);
        let mut result_arr = [0u8; DIGEST_LEN];
        result_arr.copy_from_slice(&result);
        result_arr
    }
}
