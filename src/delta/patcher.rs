// src/delta/patcher.rs

//! Delta application
//!
//! Deltas are zstd frames compressed against the previous package file as
//! dictionary, so applying one is a dictionary decompression.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use tracing::{debug, info};

/// Applies a delta file to produce a new package file
pub trait DeltaPatcher {
    /// Reconstruct `to` from `from` and `delta`
    fn apply(&self, from: &Path, delta: &Path, to: &Path) -> Result<()>;
}

/// zstd dictionary based patcher
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdPatcher;

impl DeltaPatcher for ZstdPatcher {
    fn apply(&self, from: &Path, delta: &Path, to: &Path) -> Result<()> {
        info!("applying {} to {}", delta.display(), from.display());

        let dictionary = fs::read(from).map_err(|e| {
            Error::DeltaPatchFailed(format!("cannot read {}: {}", from.display(), e))
        })?;
        debug!("base file loaded: {} bytes", dictionary.len());

        let decoder_dict = zstd::dict::DecoderDictionary::copy(&dictionary);
        let input = File::open(delta).map_err(|e| {
            Error::DeltaPatchFailed(format!("cannot open {}: {}", delta.display(), e))
        })?;
        let mut decoder = zstd::Decoder::with_prepared_dictionary(BufReader::new(input), &decoder_dict)
            .map_err(|e| Error::DeltaPatchFailed(format!("failed to create decoder: {}", e)))?;

        let mut output = File::create(to)?;
        let written = io::copy(&mut decoder, &mut output).map_err(|e| {
            let _ = fs::remove_file(to);
            Error::DeltaPatchFailed(format!("{}: {}", delta.display(), e))
        })?;

        debug!("{} reconstructed: {} bytes", to.display(), written);
        Ok(())
    }
}
