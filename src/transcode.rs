//! Binary ↔ text payload codecs used by the snapshot format.
//!
//! Encoders and compressors are selected by name so the snapshot JSON can
//! record which pair produced a payload (`base64://zlib://<payload>`).
//! Unknown names fail with [`Error::Encoder`] / [`Error::Compressor`].

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::Error;

/// Compress (optionally) then encode `bin` into text.
pub(crate) fn bin_to_txt(encoder: &str, compressor: &str, bin: &[u8]) -> Result<String, Error> {
    let encode = |bytes: &[u8]| -> Result<String, Error> {
        match encoder {
            "base64" => Ok(BASE64.encode(bytes)),
            other => Err(Error::Encoder(other.into())),
        }
    };

    match compressor {
        "none" => encode(bin),
        "zlib" => {
            let mut zip = ZlibEncoder::new(Vec::new(), Compression::default());
            zip.write_all(bin)
                .and_then(|_| zip.finish())
                .map_err(|_| Error::InvalidArgument)
                .and_then(|deflated| encode(&deflated))
        }
        other => Err(Error::Compressor(other.into())),
    }
}

/// Decode then decompress (optionally) `src` back into bytes.
pub(crate) fn txt_to_bin(decoder: &str, decompressor: &str, src: &str) -> Result<Vec<u8>, Error> {
    let bin = match decoder {
        "base64" => BASE64.decode(src).map_err(|_| Error::InvalidArgument)?,
        other => return Err(Error::Encoder(other.into())),
    };

    match decompressor {
        "none" => Ok(bin),
        "zlib" => {
            let mut inflated = Vec::new();
            ZlibDecoder::new(bin.as_slice())
                .read_to_end(&mut inflated)
                .map_err(|_| Error::InvalidArgument)?;
            Ok(inflated)
        }
        other => Err(Error::Compressor(other.into())),
    }
}

/// MD5 digest of `bytes` (rom identity).
pub(crate) fn md5_digest(bytes: &[u8]) -> [u8; 16] {
    md5::compute(bytes).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let bytes = [0xD3u8, 0xFE, 0xD3, 0xFF, 0x76];
        let txt = bin_to_txt("base64", "none", &bytes).unwrap();
        assert_eq!(txt, "0/7T/3Y=");
        assert_eq!(txt_to_bin("base64", "none", &txt).unwrap(), bytes);
    }

    #[test]
    fn zlib_round_trip() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let txt = bin_to_txt("base64", "zlib", &bytes).unwrap();
        // Repetitive input must actually shrink.
        assert!(txt.len() < bytes.len());
        assert_eq!(txt_to_bin("base64", "zlib", &txt).unwrap(), bytes);
    }

    #[test]
    fn unknown_codecs() {
        assert_eq!(
            bin_to_txt("rot13", "none", &[0]),
            Err(Error::Encoder("rot13".into()))
        );
        assert_eq!(
            bin_to_txt("base64", "lz4", &[0]),
            Err(Error::Compressor("lz4".into()))
        );
        assert_eq!(
            txt_to_bin("base64", "lz4", "AA=="),
            Err(Error::Compressor("lz4".into()))
        );
    }

    #[test]
    fn md5_of_empty_input() {
        // RFC 1321 test vector.
        assert_eq!(
            md5_digest(b""),
            [
                0xD4, 0x1D, 0x8C, 0xD9, 0x8F, 0x00, 0xB2, 0x04, 0xE9, 0x80, 0x09, 0x98, 0xEC,
                0xF8, 0x42, 0x7E
            ]
        );
    }
}
