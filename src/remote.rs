//! The contract a fetchable remote object must satisfy.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::byte_range::ByteRange;
use crate::error::Error;

/// Boxed byte stream returned by a range fetch. Modelled as a trait object
/// the way this crate's HTTP-body boundaries are, since concrete transports
/// (plain HTTP, a cloud-storage API) each bring their own reader type.
pub type Reader = Box<dyn AsyncRead + Unpin + Send>;

/// A hashing algorithm a remote object may publish a digest under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

/// A digest value tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub algorithm: DigestAlgorithm,
    pub bytes: Vec<u8>,
}

impl Digest {
    pub fn hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Incrementally hashes streamed bytes under one of the three supported
/// algorithms, for `StreamingDownloader`'s optional digest verification.
pub enum DigestHasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl DigestHasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        use sha1::Digest as _;
        use sha2::Digest as _;
        match algorithm {
            DigestAlgorithm::Md5 => DigestHasher::Md5(md5::Md5::new()),
            DigestAlgorithm::Sha1 => DigestHasher::Sha1(sha1::Sha1::new()),
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(sha2::Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        use sha1::Digest as _;
        use sha2::Digest as _;
        match self {
            DigestHasher::Md5(h) => h.update(data),
            DigestHasher::Sha1(h) => h.update(data),
            DigestHasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        use sha1::Digest as _;
        use sha2::Digest as _;
        match self {
            DigestHasher::Md5(h) => Digest {
                algorithm: DigestAlgorithm::Md5,
                bytes: h.finalize().to_vec(),
            },
            DigestHasher::Sha1(h) => Digest {
                algorithm: DigestAlgorithm::Sha1,
                bytes: h.finalize().to_vec(),
            },
            DigestHasher::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                bytes: h.finalize().to_vec(),
            },
        }
    }
}

/// Per-error retry guidance handed back by a failed [`RemoteObject::get_range`]
/// call. The remote object classifies its own failures (HTTP status, cloud
/// API error code, ...) instead of the scheduler trying to reverse-engineer
/// a transport it doesn't know about.
pub trait RetryToken: Send + Sync {
    /// Whether the scheduler should retry the range that produced this token.
    fn is_retryable(&self) -> bool;

    /// A server-specified backoff (e.g. `Retry-After`), if any. `None`
    /// means "use the scheduler's own backoff policy".
    fn backoff_duration(&self) -> Option<std::time::Duration>;
}

/// A remote object the download engine can fetch byte ranges from.
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// A human-readable name, used only for logging.
    fn name(&self) -> &str;

    /// Total content length and the block size the engine should plan
    /// around for this object.
    fn content_length_and_block_size(&self) -> (u64, u64);

    /// The object's published digest, if the remote source supplies one.
    fn digest(&self) -> Option<Digest>;

    /// Fetches `range`, returning a byte stream on success. On failure,
    /// returns the failing [`Error`] paired with a [`RetryToken`] that says
    /// whether and how to retry.
    async fn get_range(
        &self,
        cancel: &CancellationToken,
        range: ByteRange,
    ) -> Result<Reader, (Error, Box<dyn RetryToken>)>;
}
