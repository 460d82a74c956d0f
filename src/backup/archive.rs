// backuptool/src/backup/archive.rs
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::backup::naming::COMPRESSED_EXT;
use crate::errors::{AppError, Result};

/// Compresses a single file with gzip.
///
/// # Arguments
/// * `source` - The file to compress.
/// * `destination_dir` - The directory in which to store the compressed file.
///
/// # Returns
/// Path to the compressed file; its name is the source file name plus the
/// `.gz` extension. The file is fully written when this returns.
pub fn compress_file(source: &Path, destination_dir: &Path) -> Result<PathBuf> {
    let mut compressed_name = source
        .file_name()
        .ok_or_else(|| path_without_file_name(source))?
        .to_os_string();
    compressed_name.push(".");
    compressed_name.push(COMPRESSED_EXT);
    let destination = destination_dir.join(compressed_name);

    let mut input = File::open(source)?;
    let output = File::create(&destination)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;

    Ok(destination)
}

/// Decompresses a gzip file.
///
/// # Arguments
/// * `source` - The file to decompress.
/// * `destination_dir` - The directory in which to store the plain file.
///
/// # Returns
/// Path to the decompressed file; its name is the source file name with the
/// compression extension stripped. The file is fully written when this
/// returns.
pub fn decompress_file(source: &Path, destination_dir: &Path) -> Result<PathBuf> {
    let plain_name = source
        .file_stem()
        .ok_or_else(|| path_without_file_name(source))?;
    let destination = destination_dir.join(plain_name);

    let input = File::open(source)?;
    let mut decoder = GzDecoder::new(input);
    let mut output = File::create(&destination)?;
    io::copy(&mut decoder, &mut output)?;

    Ok(destination)
}

fn path_without_file_name(path: &Path) -> AppError {
    AppError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Path has no file name: {}", path.display()),
    ))
}
