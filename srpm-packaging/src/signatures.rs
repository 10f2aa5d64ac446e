// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Per-spec signature manifests.

A manifest is a JSON object with a single `Signatures` key mapping a source
file name to the lowercase hex SHA-256 digest the file is expected to have.
An absent manifest file is an empty manifest.
*/

use {
    crate::error::{Result, SrpmPackagingError},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    slog::warn,
    std::{
        collections::BTreeMap,
        fs::File,
        io::Read,
        path::Path,
    },
};

/// How digest mismatches between a source file and its manifest are handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureHandling {
    /// Every hydrated file must match the manifest.
    Enforce,
    /// Signatures are neither read nor recorded.
    SkipCheck,
    /// Observed digests replace the manifest's entries.
    Update,
}

/// Mapping of file name to expected hex SHA-256 digest.
pub type SignatureLookup = BTreeMap<String, String>;

#[derive(Debug, Default, Deserialize, Serialize)]
struct FileSignaturesWrapper {
    #[serde(rename = "Signatures")]
    file_signatures: SignatureLookup,
}

/// Read a signature manifest.
///
/// A missing file is not an error; some specs have no sources.
pub fn read_signature_file(path: &Path) -> Result<SignatureLookup> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SignatureLookup::new());
        }
        Err(e) => return Err(SrpmPackagingError::IoPath(path.display().to_string(), e)),
    };

    let wrapper: FileSignaturesWrapper = serde_json::from_slice(&data)
        .map_err(|e| SrpmPackagingError::SignatureFileFormat(path.display().to_string(), e))?;

    Ok(wrapper.file_signatures)
}

/// Write a signature manifest, preserving the on-disk shape.
pub fn write_signature_file(path: &Path, signatures: &SignatureLookup) -> Result<()> {
    let wrapper = FileSignaturesWrapper {
        file_signatures: signatures.clone(),
    };

    let data = serde_json::to_vec_pretty(&wrapper)
        .map_err(|e| SrpmPackagingError::SignatureFileFormat(path.display().to_string(), e))?;

    std::fs::write(path, data)
        .map_err(|e| SrpmPackagingError::IoPath(path.display().to_string(), e))
}

/// Compute the lowercase hex SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let io_error = |e| SrpmPackagingError::IoPath(path.display().to_string(), e);

    let file = File::open(path).map_err(io_error)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0; 32768];

    loop {
        let count = reader.read(&mut buffer).map_err(io_error)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check a file's digest against the manifest.
///
/// Digests of validated files are recorded into `current_signatures`; under
/// [SignatureHandling::Update] an unknown or mismatching digest is recorded
/// instead of rejected. Comparison is case-insensitive.
pub fn validate_signature(
    logger: &slog::Logger,
    path: &Path,
    handling: SignatureHandling,
    lookup: &SignatureLookup,
    current_signatures: &mut SignatureLookup,
) -> Result<()> {
    if handling == SignatureHandling::SkipCheck {
        return Ok(());
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let expected = lookup.get(&file_name);
    if expected.is_none() && handling != SignatureHandling::Update {
        return Err(SrpmPackagingError::SignatureMissing(file_name));
    }

    let expected = expected.map(String::as_str).unwrap_or("");
    let actual = sha256_file(path)?;

    if expected.eq_ignore_ascii_case(&actual) {
        current_signatures.insert(file_name, actual);
    } else if handling == SignatureHandling::Update {
        warn!(
            logger,
            "Updating signature for ({}) from ({}) to ({})", file_name, expected, actual
        );
        current_signatures.insert(file_name, actual);
    } else {
        return Err(SrpmPackagingError::SignatureMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }

    Ok(())
}
