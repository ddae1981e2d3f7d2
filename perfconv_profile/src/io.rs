//! Reading and writing [`ProcessProfile`]s.
//!
//! A profile file holds exactly one process profile, encoded as JSON or
//! postcard and optionally wrapped in gzip or zstd compression. Readers can
//! either name the encoding explicitly or let [`read_profile_bytes`] sniff
//! it from the content.

use crate::ProcessProfile;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

pub type Result<T> = std::result::Result<T, IoError>;

/// Profile encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Json,
    Postcard,
}

impl Format {
    /// Conventional file extension for the encoding.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Postcard => "postcard",
        }
    }

    /// Guess the encoding of uncompressed profile bytes. JSON profiles are
    /// objects, so they start with `{` after optional whitespace.
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Format::Json,
            _ => Format::Postcard,
        }
    }
}

/// Compression wrapped around the encoded profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gz"),
            Compression::Zstd => Some("zst"),
        }
    }

    /// Recognize gzip and zstd frames by their magic numbers.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Encode a profile without compression.
pub fn encode(profile: &ProcessProfile, format: Format) -> Result<Vec<u8>> {
    let bytes = match format {
        Format::Json => serde_json::to_vec(profile)?,
        Format::Postcard => postcard::to_stdvec(profile)?,
    };
    Ok(bytes)
}

/// Decode an uncompressed profile.
pub fn decode(bytes: &[u8], format: Format) -> Result<ProcessProfile> {
    let profile = match format {
        Format::Json => serde_json::from_slice(bytes)?,
        Format::Postcard => postcard::from_bytes(bytes)?,
    };
    Ok(profile)
}

/// Write one profile to `writer`.
pub fn write_profile<W: Write>(
    mut writer: W,
    profile: &ProcessProfile,
    format: Format,
    compression: Compression,
) -> Result<()> {
    let bytes = encode(profile, format)?;
    match compression {
        Compression::None => {
            writer.write_all(&bytes)?;
            writer.flush()?;
        }
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
            encoder.write_all(&bytes)?;
            encoder.finish()?.flush()?;
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, 0)?;
            encoder.write_all(&bytes)?;
            encoder.finish()?.flush()?;
        }
    }
    Ok(())
}

/// Read one profile written with the given encoding.
pub fn read_profile<R: Read>(
    reader: R,
    format: Format,
    compression: Compression,
) -> Result<ProcessProfile> {
    let bytes = decompress(reader, compression)?;
    decode(&bytes, format)
}

/// Read one profile, detecting compression and encoding from the content.
pub fn read_profile_bytes(bytes: &[u8]) -> Result<ProcessProfile> {
    let compression = Compression::detect(bytes);
    let raw = decompress(bytes, compression)?;
    match Format::detect(&raw) {
        // A postcard pid varint can look like `{`, so fall back before failing.
        Format::Json => decode(&raw, Format::Json)
            .or_else(|json_err| decode(&raw, Format::Postcard).map_err(|_| json_err)),
        Format::Postcard => decode(&raw, Format::Postcard),
    }
}

fn decompress<R: Read>(mut reader: R, compression: Compression) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match compression {
        Compression::None => {
            reader.read_to_end(&mut bytes)?;
        }
        Compression::Gzip => {
            GzDecoder::new(reader).read_to_end(&mut bytes)?;
        }
        Compression::Zstd => {
            zstd::stream::read::Decoder::new(reader)?.read_to_end(&mut bytes)?;
        }
    }
    Ok(bytes)
}
