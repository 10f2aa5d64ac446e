// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Packing a single spec file into a source package.

Each spec marked for packing gets a private working tree under the build
directory with the canonical SPECS/SOURCES/SRPMS layout. Patches hydrate
first and only from local disk; sources follow, with a remote fallback.
Once both passes finish the external builder runs and its output is
copied into the output directory. The working tree is removed on every
exit path.
*/

use {
    crate::pipeline::{PackResult, SpecState},
    anyhow::{anyhow, Context, Result},
    slog::{debug, info, warn},
    srpm_packaging::{
        fs as fsutil,
        hydrate::{self, FileKind, SourceRetrievalConfig},
        rpm::{self, Defines},
        signatures::{self, SignatureHandling, SignatureLookup},
    },
    std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc::{Receiver, Sender},
            Arc, Mutex,
        },
    },
    walkdir::WalkDir,
};

const SRPM_OUT_DIR: &str = "SRPMS";
const SRPM_SPEC_DIR: &str = "SPECS";
const SRPM_SOURCES_DIR: &str = "SOURCES";

const SPEC_SUFFIX: &str = ".spec";
const SIGNATURE_FILE_SUFFIX: &str = "signatures.json";

/// Per-run inputs shared by every pack worker.
#[derive(Clone)]
pub struct PackParams {
    pub dist_tag: String,
    pub build_dir: PathBuf,
    pub run_check: bool,
}

/// Stage-2 worker loop: drain spec states, emit one [PackResult] apiece.
pub fn pack_srpm_worker(
    logger: &slog::Logger,
    requests: &Arc<Mutex<Receiver<SpecState>>>,
    results: &Sender<PackResult>,
    cancel: &Arc<AtomicBool>,
    params: &PackParams,
    template_config: &SourceRetrievalConfig,
) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!(logger, "Cancellation signal received");
            return;
        }

        let state = {
            let receiver = match requests.lock() {
                Ok(receiver) => receiver,
                Err(_) => return,
            };
            match receiver.recv() {
                Ok(state) => state,
                Err(_) => return,
            }
        };

        let result = pack_spec(logger, &state, params, template_config);
        if results.send(result).is_err() {
            return;
        }
    }
}

fn pack_spec(
    logger: &slog::Logger,
    state: &SpecState,
    params: &PackParams,
    template_config: &SourceRetrievalConfig,
) -> PackResult {
    let mut result = PackResult {
        spec_file: state.spec_file.clone(),
        srpm_file: None,
        err: None,
    };

    // No-op for specs that analysis decided not to repack.
    if !state.to_pack {
        return result;
    }

    let signatures_file = spec_to_signatures_path(&state.spec_file);

    let src_config = match initialize_source_config(template_config, &signatures_file) {
        Ok(config) => config,
        Err(e) => {
            result.err = Some(e);
            return result;
        }
    };

    let full_out_dir = match state.srpm_file.parent() {
        Some(parent) => parent.to_path_buf(),
        None => {
            result.err = Some(anyhow!(
                "no output directory for SRPM ({})",
                state.srpm_file.display()
            ));
            return result;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&full_out_dir) {
        result.err = Some(
            anyhow::Error::new(e)
                .context(format!("creating output directory {}", full_out_dir.display())),
        );
        return result;
    }

    match pack_single_spec(
        logger,
        &state.spec_file,
        &state.srpm_file,
        &signatures_file,
        params,
        &full_out_dir,
        &src_config,
    ) {
        Ok(output_path) => result.srpm_file = Some(output_path),
        Err(e) => result.err = Some(e),
    }

    result
}

/// Resolve the signature manifest sitting next to a spec file.
pub fn spec_to_signatures_path(spec_file: &Path) -> PathBuf {
    let file_name = spec_file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let spec_name = file_name.strip_suffix(SPEC_SUFFIX).unwrap_or(&file_name);

    spec_file.with_file_name(format!("{}.{}", spec_name, SIGNATURE_FILE_SUFFIX))
}

/// Clone the template retrieval configuration for one spec.
fn initialize_source_config(
    template_config: &SourceRetrievalConfig,
    signatures_file: &Path,
) -> Result<SourceRetrievalConfig> {
    let mut src_config = template_config.clone();

    src_config.local_source_dir = signatures_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if src_config.signature_handling != SignatureHandling::SkipCheck {
        src_config.signature_lookup = signatures::read_signature_file(signatures_file)
            .with_context(|| {
                format!("reading signatures file {}", signatures_file.display())
            })?;
    }

    Ok(src_config)
}

/// Removes the per-spec working tree when the pack attempt ends.
struct WorkingDirCleanup<'a> {
    logger: &'a slog::Logger,
    working_dir: &'a Path,
}

impl<'a> Drop for WorkingDirCleanup<'a> {
    fn drop(&mut self) {
        if std::fs::remove_dir_all(self.working_dir).is_err() {
            warn!(
                self.logger,
                "Unable to cleanup working directory: {}",
                self.working_dir.display()
            );
        }
    }
}

/// Pack one spec file into a source package and return the output path.
pub fn pack_single_spec(
    logger: &slog::Logger,
    spec_file: &Path,
    srpm_file: &Path,
    signatures_file: &Path,
    params: &PackParams,
    out_dir: &Path,
    src_config: &SourceRetrievalConfig,
) -> Result<PathBuf> {
    let srpm_name = srpm_file
        .file_name()
        .ok_or_else(|| anyhow!("SRPM path ({}) has no file name", srpm_file.display()))?;
    let working_dir = params.build_dir.join(srpm_name);

    debug!(logger, "Working directory: {}", working_dir.display());

    std::fs::create_dir_all(&working_dir)
        .with_context(|| format!("creating working directory {}", working_dir.display()))?;
    let _cleanup = WorkingDirCleanup {
        logger,
        working_dir: &working_dir,
    };

    for dir in [SRPM_SOURCES_DIR, SRPM_SPEC_DIR, SRPM_OUT_DIR] {
        std::fs::create_dir_all(working_dir.join(dir))
            .with_context(|| format!("creating {} under {}", dir, working_dir.display()))?;
    }

    let spec_name = spec_file
        .file_name()
        .ok_or_else(|| anyhow!("spec path ({}) has no file name", spec_file.display()))?;
    fsutil::copy_file(spec_file, &working_dir.join(SRPM_SPEC_DIR).join(spec_name))
        .with_context(|| format!("copying {} into the working tree", spec_file.display()))?;

    // Only signatures validated or observed during this pack end up here.
    let mut current_signatures = SignatureLookup::new();

    let mut defines: Defines = rpm::default_defines(params.run_check);
    if !params.dist_tag.is_empty() {
        defines.insert(rpm::DIST_TAG_DEFINE.to_string(), params.dist_tag.clone());
    }

    hydrate::hydrate_files(
        logger,
        FileKind::Patch,
        spec_file,
        &working_dir,
        src_config,
        &mut current_signatures,
        &defines,
    )
    .with_context(|| format!("hydrating patches for {}", spec_file.display()))?;

    hydrate::hydrate_files(
        logger,
        FileKind::Source,
        spec_file,
        &working_dir,
        src_config,
        &mut current_signatures,
        &defines,
    )
    .with_context(|| format!("hydrating sources for {}", spec_file.display()))?;

    update_signatures_if_applicable(logger, signatures_file, src_config, &current_signatures);

    rpm::generate_srpm_from_spec(logger, spec_file, &working_dir, &defines)
        .with_context(|| format!("building SRPM from {}", spec_file.display()))?;

    copy_output(&working_dir, out_dir)
}

/// Rewrite the signature manifest when update handling observed changes.
///
/// A failed rewrite is reported but never fails the pack.
fn update_signatures_if_applicable(
    logger: &slog::Logger,
    signatures_file: &Path,
    src_config: &SourceRetrievalConfig,
    current_signatures: &SignatureLookup,
) {
    if src_config.signature_handling == SignatureHandling::Update
        && src_config.signature_lookup != *current_signatures
    {
        info!(logger, "Updating ({})", signatures_file.display());

        if let Err(e) = signatures::write_signature_file(signatures_file, current_signatures) {
            warn!(
                logger,
                "Unable to update signatures file ({}): {}",
                signatures_file.display(),
                e
            );
        }
    }
}

/// Copy every built artifact out of the working tree.
///
/// Returns the last path copied, which for a source package build is the
/// SRPM itself.
fn copy_output(working_dir: &Path, out_dir: &Path) -> Result<PathBuf> {
    let rpmbuild_out_dir = working_dir.join(SRPM_OUT_DIR);

    let mut output_path = None;
    for entry in WalkDir::new(&rpmbuild_out_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let destination = out_dir.join(entry.file_name());
        fsutil::copy_file(entry.path(), &destination)
            .with_context(|| format!("copying {} to output", entry.path().display()))?;
        output_path = Some(destination);
    }

    output_path.ok_or_else(|| {
        anyhow!(
            "no SRPM found under ({}) after build",
            rpmbuild_out_dir.display()
        )
    })
}
