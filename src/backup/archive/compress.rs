use crate::backup::result_error::result::Result;
use derive_more::From;
use io_enum::Write;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io;
use std::io::Write;
use std::num::NonZero;
use std::result;
use validator::{Validate, ValidationErrors};

static DEFAULT_COMPRESSION_LEVEL: u32 = 3;
static DEFAULT_MAX_PARALLELIZATION: usize = 32;

/// Writers that need an explicit end-of-stream step before the inner writer
/// can be recovered.
pub trait Finish<O> {
    fn finish(self) -> io::Result<O>;
}

impl<W: Write> Finish<W> for XzEncoder<W> {
    fn finish(self) -> io::Result<W> {
        XzEncoder::finish(self)
    }
}

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    Xz(XzEncoder<W>),
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::Xz(w) => w.finish(),
        }
    }
}

#[derive(Clone, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    Xz(XzConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Xz(XzConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

impl CompressorConfig {
    pub fn build_compressor<W: Write>(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
    }

    /// Archive file extension, without the leading dot.
    pub fn file_ext(&self) -> &'static str {
        match self {
            CompressorConfig::None => "tar",
            CompressorConfig::Xz(_) => "tar.xz",
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct XzConfig {
    /// 0 (fastest) to 9 (smallest)
    #[validate(range(min = 0, max = 9))]
    pub level: Option<u32>,
    /// Defaults to half the available cores.
    #[validate(range(min = 1))]
    pub thread: Option<u32>,
}

impl XzConfig {
    fn build_compressor<W: Write>(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        let thread = self.thread.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .map(|core| (core / 2).clamp(1, DEFAULT_MAX_PARALLELIZATION) as u32)
                .unwrap_or(1)
        });

        tracing::debug!("Creating xz compressor with level={}, threads={}", level, thread);

        if thread == 1 {
            Ok(XzEncoder::new(writer, level).into())
        } else {
            let stream = MtStreamBuilder::new()
                .preset(level)
                .check(Check::Crc64)
                .threads(thread)
                .encoder()?;
            Ok(XzEncoder::new_stream(writer, stream).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liblzma::read::XzDecoder;
    use std::io::{Cursor, Read};

    #[test]
    fn test_file_ext() {
        assert_eq!(CompressorConfig::None.file_ext(), "tar");
        assert_eq!(CompressorConfig::default().file_ext(), "tar.xz");
    }

    #[test]
    fn test_xz_config_validation() {
        let config = XzConfig {
            level: Some(10),
            thread: Some(1),
        };
        assert!(CompressorConfig::Xz(config).validate().is_err());

        let config = XzConfig {
            level: Some(5),
            thread: Some(0),
        };
        assert!(config.validate().is_err());
        assert!(XzConfig::default().validate().is_ok());
    }

    #[test]
    fn test_xz_output_decodes() {
        for thread in [Some(1), Some(2)] {
            let config = CompressorConfig::Xz(XzConfig {
                level: Some(1),
                thread,
            });
            let mut compressor = config.build_compressor(Cursor::new(Vec::new())).unwrap();
            compressor.write_all(b"mirror contents").unwrap();
            let bytes = compressor.finish().unwrap().into_inner();

            let mut decoded = String::new();
            XzDecoder::new(bytes.as_slice())
                .read_to_string(&mut decoded)
                .unwrap();
            assert_eq!(decoded, "mirror contents");
        }
    }

    #[test]
    fn test_none_passes_through() {
        let mut compressor = CompressorConfig::None
            .build_compressor(Cursor::new(Vec::new()))
            .unwrap();
        compressor.write_all(b"raw").unwrap();
        assert_eq!(compressor.finish().unwrap().into_inner(), b"raw");
    }

    #[test]
    fn test_compressor_config_yaml() {
        let config: CompressorConfig =
            serde_yml::from_str("compressor_type: xz\nlevel: 4\n").unwrap();
        assert_eq!(
            config,
            CompressorConfig::Xz(XzConfig {
                level: Some(4),
                thread: None
            })
        );
        let config: CompressorConfig = serde_yml::from_str("compressor_type: none\n").unwrap();
        assert_eq!(config, CompressorConfig::None);
    }
}
