//! Wire format for record batches exchanged between cluster members.
//!
//! Batches are serialized as JSON and optionally compressed. Column names,
//! strategies, kinds and values survive the round trip unchanged, since the
//! receiving side merges using the decoded strategies.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::keyed::KeyedRecord;

/// One record addressed to a graph on the receiving member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    pub graph_id: String,
    pub record: KeyedRecord,
}

/// A batch of envelopes sent in one transport call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub entries: Vec<RemoteEnvelope>,
}

/// Payload compression algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl Compression {
    /// Returns the Content-Encoding header value for the algorithm.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }

    /// Parses a Content-Encoding header value. A missing header means none.
    pub fn from_content_encoding(value: Option<&str>) -> Result<Self, CodecError> {
        match value.map(str::trim) {
            None | Some("") | Some("identity") => Ok(Self::None),
            Some("gzip") => Ok(Self::Gzip),
            Some("zstd") => Ok(Self::Zstd),
            Some("deflate") => Ok(Self::Zlib),
            Some("snappy") => Ok(Self::Snappy),
            Some(other) => Err(CodecError::UnsupportedEncoding(other.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serializing batch: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("deserializing batch: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("{algorithm} compression: {source}")]
    Compress {
        algorithm: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{algorithm} decompression: {source}")]
    Decompress {
        algorithm: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
}

/// Serializes and compresses a batch.
pub fn encode(batch: &RemoteBatch, compression: Compression) -> Result<Vec<u8>, CodecError> {
    let raw = serde_json::to_vec(batch).map_err(CodecError::Serialize)?;
    compress(&raw, compression)
}

/// Decompresses and deserializes a batch.
pub fn decode(data: &[u8], compression: Compression) -> Result<RemoteBatch, CodecError> {
    let raw = decompress(data, compression)?;
    serde_json::from_slice(&raw).map_err(CodecError::Deserialize)
}

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>, CodecError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|source| CodecError::Compress {
                    algorithm: "gzip",
                    source,
                })
        }
        Compression::Zstd => zstd::encode_all(data, 0).map_err(|source| CodecError::Compress {
            algorithm: "zstd",
            source,
        }),
        Compression::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|source| CodecError::Compress {
                    algorithm: "zlib",
                    source,
                })
        }
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| CodecError::Compress {
                algorithm: "snappy",
                source: e.into(),
            }),
    }
}

/// Reverses [`compress`].
pub fn decompress(data: &[u8], compression: Compression) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len() * 4);
    match compression {
        Compression::None => return Ok(data.to_vec()),
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|source| CodecError::Decompress {
                    algorithm: "gzip",
                    source,
                })?;
        }
        Compression::Zstd => {
            out = zstd::decode_all(data).map_err(|source| CodecError::Decompress {
                algorithm: "zstd",
                source,
            })?;
        }
        Compression::Zlib => {
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|source| CodecError::Decompress {
                    algorithm: "zlib",
                    source,
                })?;
        }
        Compression::Snappy => {
            out = snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| CodecError::Decompress {
                    algorithm: "snappy",
                    source: e.into(),
                })?;
        }
    }
    Ok(out)
}
