// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Populating a build tree's SOURCES directory.

Hydration satisfies every patch and source a spec references. Files are
taken from the local source directory first; sources that remain missing
are fetched from the remote source server, with each download retried a
fixed number of times. Whatever is still missing after both passes fails
the hydration as a whole.
*/

use {
    crate::{
        error::{Result, SrpmPackagingError},
        fs as fsutil, http,
        rpm::{self, Defines},
        signatures::{self, SignatureHandling, SignatureLookup},
    },
    slog::{debug, error, warn},
    std::{
        collections::BTreeMap,
        path::Path,
        time::Duration,
    },
    walkdir::WalkDir,
};

const SOURCES_DIR: &str = "SOURCES";

const DOWNLOAD_RETRY_ATTEMPTS: u32 = 3;
const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The kind of file a hydration pass is gathering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    /// Patches come from the local source tree only and skip signatures.
    Patch,
    /// Sources may fall back to the remote server and honor signatures.
    Source,
}

/// Where and how source files are retrieved for one spec.
///
/// A run holds one read-only template of this configuration; each pack
/// worker clones it and specializes `local_source_dir` and
/// `signature_lookup` for the spec at hand.
#[derive(Clone)]
pub struct SourceRetrievalConfig {
    /// Directory scanned by the local hydration pass.
    pub local_source_dir: std::path::PathBuf,

    /// Base URL of the remote source server. Empty disables remote
    /// hydration.
    pub source_url: String,

    /// Client carrying the CA pool and optional TLS identity.
    pub client: reqwest::blocking::Client,

    pub signature_handling: SignatureHandling,

    /// Expected digests loaded from the spec's signature manifest.
    pub signature_lookup: SignatureLookup,
}

/// Hydrate every file of `kind` the spec references into
/// `working_dir/SOURCES`.
///
/// Digests of files that pass (or, under update handling, reset) signature
/// validation are recorded into `current_signatures`.
pub fn hydrate_files(
    logger: &slog::Logger,
    kind: FileKind,
    spec_file: &Path,
    working_dir: &Path,
    config: &SourceRetrievalConfig,
    current_signatures: &mut SignatureLookup,
    defines: &Defines,
) -> Result<()> {
    const PATCH_TAG: &str = "PATCH";
    const SOURCE_TAG: &str = "SOURCE";

    let (spec_tag, hydrate_remotely, skip_signature_handling) = match kind {
        FileKind::Patch => (PATCH_TAG, false, true),
        FileKind::Source => (SOURCE_TAG, true, false),
    };

    let new_source_dir = working_dir.join(SOURCES_DIR);

    let files_needed = read_spec_tag_array(
        spec_file,
        &config.local_source_dir,
        spec_tag,
        defines,
    )?;

    let mut hydration_state: BTreeMap<String, bool> = files_needed
        .into_iter()
        .map(|file_name| (file_name, false))
        .collect();

    if !config.local_source_dir.as_os_str().is_empty() {
        if let Err(e) = hydrate_from_local_source(
            logger,
            &mut hydration_state,
            &new_source_dir,
            config,
            skip_signature_handling,
            current_signatures,
        ) {
            // Local failures are recoverable; the remote pass may still
            // satisfy the missing files.
            warn!(
                logger,
                "Error hydrating from local source directory ({}): {}",
                config.local_source_dir.display(),
                e
            );
        }
    }

    if hydrate_remotely && !config.source_url.is_empty() {
        hydrate_from_remote_source(
            logger,
            &mut hydration_state,
            &new_source_dir,
            config,
            skip_signature_handling,
            current_signatures,
        );
    }

    let unhydrated: Vec<String> = hydration_state
        .into_iter()
        .filter(|(_, hydrated)| !hydrated)
        .map(|(file_name, _)| file_name)
        .collect();

    if unhydrated.is_empty() {
        return Ok(());
    }

    for file_name in &unhydrated {
        error!(logger, "unable to hydrate file: {}", file_name);
    }

    Err(SrpmPackagingError::Hydration(unhydrated))
}

/// List the values of a repeatable spec tag (e.g. every SOURCE entry).
fn read_spec_tag_array(
    spec_file: &Path,
    source_dir: &Path,
    tag: &str,
    defines: &Defines,
) -> Result<Vec<String>> {
    let query_format = format!(r"[%{{{}}}\n]", tag);

    rpm::query_spec(
        spec_file,
        source_dir,
        &query_format,
        defines,
        rpm::QUERY_HEADER_ARGUMENT,
    )
}

fn hydrate_from_local_source(
    logger: &slog::Logger,
    hydration_state: &mut BTreeMap<String, bool>,
    new_source_dir: &Path,
    config: &SourceRetrievalConfig,
    skip_signature_handling: bool,
    current_signatures: &mut SignatureLookup,
) -> Result<()> {
    for entry in WalkDir::new(&config.local_source_dir) {
        let entry = entry.map_err(|e| {
            SrpmPackagingError::IoPath(config.local_source_dir.display().to_string(), e.into())
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().to_string();

        let hydrated = match hydration_state.get(&file_name) {
            Some(hydrated) => *hydrated,
            None => continue,
        };

        if hydrated {
            warn!(
                logger,
                "Duplicate matching file found at ({}), skipping",
                entry.path().display()
            );
            continue;
        }

        if !skip_signature_handling {
            if let Err(e) = signatures::validate_signature(
                logger,
                entry.path(),
                config.signature_handling,
                &config.signature_lookup,
                current_signatures,
            ) {
                warn!(logger, "{}", e);
                continue;
            }
        }

        if let Err(e) = fsutil::copy_file(entry.path(), &new_source_dir.join(&file_name)) {
            warn!(
                logger,
                "Failed to copy file ({}), skipping. Error: {}",
                entry.path().display(),
                e
            );
            continue;
        }

        debug!(
            logger,
            "Hydrated ({}) from ({})",
            file_name,
            entry.path().display()
        );

        hydration_state.insert(file_name, true);
    }

    Ok(())
}

fn hydrate_from_remote_source(
    logger: &slog::Logger,
    hydration_state: &mut BTreeMap<String, bool>,
    new_source_dir: &Path,
    config: &SourceRetrievalConfig,
    skip_signature_handling: bool,
    current_signatures: &mut SignatureLookup,
) {
    for (file_name, hydrated) in hydration_state.iter_mut() {
        if *hydrated {
            continue;
        }

        let destination_file = new_source_dir.join(file_name.as_str());

        let url = match http::join_url(&config.source_url, file_name) {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    logger,
                    "Failed to form URL for ({}). Error: {}", file_name, e
                );
                continue;
            }
        };

        let mut downloaded = false;
        for attempt in 1..=DOWNLOAD_RETRY_ATTEMPTS {
            match http::download_file(&config.client, &url, &destination_file) {
                Ok(()) => {
                    downloaded = true;
                    break;
                }
                Err(e) => {
                    warn!(logger, "Failed to download ({}). Error: {}", url, e);
                    if attempt < DOWNLOAD_RETRY_ATTEMPTS {
                        std::thread::sleep(DOWNLOAD_RETRY_DELAY);
                    }
                }
            }
        }

        if !downloaded {
            continue;
        }

        if !skip_signature_handling {
            if let Err(e) = signatures::validate_signature(
                logger,
                &destination_file,
                config.signature_handling,
                &config.signature_lookup,
                current_signatures,
            ) {
                warn!(logger, "{}", e);

                // Leave cleanup failures to the working directory teardown.
                if let Err(e) = std::fs::remove_file(&destination_file) {
                    warn!(
                        logger,
                        "Failed to delete file ({}). Error: {}",
                        destination_file.display(),
                        e
                    );
                }

                continue;
            }
        }

        *hydrated = true;
        debug!(logger, "Hydrated ({}) from ({})", file_name, url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fs::{create_dir_all, write},
        io::{Read, Write},
        net::TcpListener,
        path::PathBuf,
    };

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    // SHA-256 of b"tarball contents".
    const TARBALL_DIGEST: &str = "ce76234fe2d1afc1085d606bf99a0b59404ad10c0f5a3f7ec014bd9bbf92f811";

    fn test_config(local_source_dir: PathBuf, handling: SignatureHandling) -> SourceRetrievalConfig {
        SourceRetrievalConfig {
            local_source_dir,
            source_url: String::new(),
            client: reqwest::blocking::Client::new(),
            signature_handling: handling,
            signature_lookup: SignatureLookup::new(),
        }
    }

    fn state_of(entries: &[(&str, bool)]) -> BTreeMap<String, bool> {
        entries
            .iter()
            .map(|(name, hydrated)| (name.to_string(), *hydrated))
            .collect()
    }

    #[test]
    fn test_local_pass_copies_matching_files() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();
        let source_dir = td.path().join("sources");
        create_dir_all(source_dir.join("nested")).unwrap();
        write(source_dir.join("nested/wanted.tar.gz"), b"tarball contents").unwrap();
        write(source_dir.join("unrelated.txt"), b"noise").unwrap();

        let new_source_dir = td.path().join("build/SOURCES");
        let config = test_config(source_dir, SignatureHandling::SkipCheck);
        let mut state = state_of(&[("wanted.tar.gz", false)]);
        let mut current = SignatureLookup::new();

        hydrate_from_local_source(
            &test_logger(),
            &mut state,
            &new_source_dir,
            &config,
            true,
            &mut current,
        )
        .unwrap();

        assert!(state["wanted.tar.gz"]);
        assert_eq!(
            std::fs::read(new_source_dir.join("wanted.tar.gz")).unwrap(),
            b"tarball contents"
        );
        assert!(!new_source_dir.join("unrelated.txt").exists());
    }

    #[test]
    fn test_local_pass_enforce_rejects_bad_digest() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();
        let source_dir = td.path().join("sources");
        create_dir_all(&source_dir).unwrap();
        write(source_dir.join("wanted.tar.gz"), b"tarball contents").unwrap();

        let new_source_dir = td.path().join("build/SOURCES");
        let mut config = test_config(source_dir, SignatureHandling::Enforce);
        config
            .signature_lookup
            .insert("wanted.tar.gz".to_string(), "00".repeat(32));

        let mut state = state_of(&[("wanted.tar.gz", false)]);
        let mut current = SignatureLookup::new();

        hydrate_from_local_source(
            &test_logger(),
            &mut state,
            &new_source_dir,
            &config,
            false,
            &mut current,
        )
        .unwrap();

        assert!(!state["wanted.tar.gz"]);
        assert!(!new_source_dir.join("wanted.tar.gz").exists());
        assert!(current.is_empty());
    }

    #[test]
    fn test_local_pass_update_records_observed_digest() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();
        let source_dir = td.path().join("sources");
        create_dir_all(&source_dir).unwrap();
        write(source_dir.join("wanted.tar.gz"), b"tarball contents").unwrap();

        let new_source_dir = td.path().join("build/SOURCES");
        let mut config = test_config(source_dir, SignatureHandling::Update);
        config
            .signature_lookup
            .insert("wanted.tar.gz".to_string(), "00".repeat(32));

        let mut state = state_of(&[("wanted.tar.gz", false)]);
        let mut current = SignatureLookup::new();

        hydrate_from_local_source(
            &test_logger(),
            &mut state,
            &new_source_dir,
            &config,
            false,
            &mut current,
        )
        .unwrap();

        assert!(state["wanted.tar.gz"]);
        assert_eq!(
            current.get("wanted.tar.gz").map(String::as_str),
            Some(TARBALL_DIGEST)
        );
    }

    #[test]
    fn test_local_pass_skips_duplicate_match() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();
        let source_dir = td.path().join("sources");
        create_dir_all(source_dir.join("a")).unwrap();
        create_dir_all(source_dir.join("b")).unwrap();
        write(source_dir.join("a/wanted.tar.gz"), b"first").unwrap();
        write(source_dir.join("b/wanted.tar.gz"), b"second").unwrap();

        let new_source_dir = td.path().join("build/SOURCES");
        let config = test_config(source_dir, SignatureHandling::SkipCheck);
        let mut state = state_of(&[("wanted.tar.gz", false)]);
        let mut current = SignatureLookup::new();

        hydrate_from_local_source(
            &test_logger(),
            &mut state,
            &new_source_dir,
            &config,
            true,
            &mut current,
        )
        .unwrap();

        assert!(state["wanted.tar.gz"]);
        // Whichever copy won the walk, the second match must not overwrite it.
        let data = std::fs::read(new_source_dir.join("wanted.tar.gz")).unwrap();
        assert!(data == b"first" || data == b"second");
    }

    /// Serve canned HTTP status codes, one connection per entry.
    fn spawn_http_stub(responses: Vec<u16>) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            for status in responses {
                let (mut stream, _) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };

                // Consume the request head before answering.
                let mut buffer = [0; 4096];
                let _ = stream.read(&mut buffer);

                let body = b"tarball contents";
                let reason = if status == 200 { "OK" } else { "Internal Server Error" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    reason,
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(body);
            }
        });

        (format!("http://{}", address), handle)
    }

    #[test]
    fn test_remote_pass_retries_until_success() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();
        let new_source_dir = td.path().join("build/SOURCES");
        create_dir_all(&new_source_dir).unwrap();

        let (url, handle) = spawn_http_stub(vec![500, 500, 200]);

        let mut config = test_config(PathBuf::new(), SignatureHandling::SkipCheck);
        config.source_url = url;

        let mut state = state_of(&[("wanted.tar.gz", false)]);
        let mut current = SignatureLookup::new();

        hydrate_from_remote_source(
            &test_logger(),
            &mut state,
            &new_source_dir,
            &config,
            true,
            &mut current,
        );
        handle.join().unwrap();

        assert!(state["wanted.tar.gz"]);
        assert_eq!(
            std::fs::read(new_source_dir.join("wanted.tar.gz")).unwrap(),
            b"tarball contents"
        );
    }

    #[test]
    fn test_remote_pass_gives_up_after_three_failures() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();
        let new_source_dir = td.path().join("build/SOURCES");
        create_dir_all(&new_source_dir).unwrap();

        let (url, handle) = spawn_http_stub(vec![500, 500, 500]);

        let mut config = test_config(PathBuf::new(), SignatureHandling::SkipCheck);
        config.source_url = url;

        let mut state = state_of(&[("wanted.tar.gz", false)]);
        let mut current = SignatureLookup::new();

        hydrate_from_remote_source(
            &test_logger(),
            &mut state,
            &new_source_dir,
            &config,
            true,
            &mut current,
        );
        handle.join().unwrap();

        assert!(!state["wanted.tar.gz"]);
    }

    #[test]
    fn test_remote_pass_deletes_file_failing_validation() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();
        let new_source_dir = td.path().join("build/SOURCES");
        create_dir_all(&new_source_dir).unwrap();

        let (url, handle) = spawn_http_stub(vec![200]);

        let mut config = test_config(PathBuf::new(), SignatureHandling::Enforce);
        config.source_url = url;
        config
            .signature_lookup
            .insert("wanted.tar.gz".to_string(), "00".repeat(32));

        let mut state = state_of(&[("wanted.tar.gz", false)]);
        let mut current = SignatureLookup::new();

        hydrate_from_remote_source(
            &test_logger(),
            &mut state,
            &new_source_dir,
            &config,
            false,
            &mut current,
        );
        handle.join().unwrap();

        assert!(!state["wanted.tar.gz"]);
        assert!(!new_source_dir.join("wanted.tar.gz").exists());
    }
}
