//! Identifiers for blobs.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use nested_enum_utils::common_fields;
use rand::Rng;
use serde::{Deserialize, Serialize, de, ser};
use snafu::{Backtrace, ResultExt, Snafu};

/// Identifier of a blob.
///
/// Ids are opaque 32 byte values. They are rendered as lower-case hex, which is also the
/// name of the directory a blob is stored under.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BlobId([u8; 32]);

impl BlobId {
    /// The length of a [`BlobId`], in bytes.
    pub const LENGTH: usize = 32;

    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self::random_from(&mut rand::thread_rng())
    }

    /// Generates a random id from the given source of randomness.
    pub fn random_from<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        Self(bytes)
    }

    /// Creates an id from its raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex encoding of the id.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// Formats the first five bytes of the id, for logging.
    pub fn fmt_short(&self) -> impl Display + 'static {
        BlobIdShort(
            self.0[0..5]
                .try_into()
                .expect("slice with incorrect length"),
        )
    }
}

struct BlobIdShort([u8; 5]);

impl Display for BlobIdShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.fmt_short())
    }
}

impl AsRef<[u8]> for BlobId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for BlobId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for BlobId {
    type Error = ParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LengthSnafu { len: bytes.len() }.build())?;
        Ok(Self(bytes))
    }
}

/// Error when parsing a [`BlobId`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ParseError {
    /// The input was not valid hex.
    #[snafu(display("invalid hex encoding"))]
    Encoding { source: data_encoding::DecodeError },
    /// The decoded bytes do not have the length of an id.
    #[snafu(display("length must be 32 bytes, but got {len} byte(s)"))]
    Length { len: usize },
}

impl FromStr for BlobId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .context(EncodingSnafu)?;
        Self::try_from(bytes.as_slice())
    }
}

impl Serialize for BlobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(de::Error::custom)
        } else {
            let data: [u8; 32] = Deserialize::deserialize(deserializer)?;
            Ok(Self(data))
        }
    }
}
