// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Deciding which spec files actually need repacking.

A spec is repacked when its predicted source package is missing from the
output directory, when anything under the spec's containing directory is
newer than that package, or when a full repack was requested. Specs whose
architecture tags rule out the host are skipped outright.
*/

use {
    crate::pipeline::SpecState,
    anyhow::anyhow,
    slog::{debug, info},
    srpm_packaging::{
        rpm::{self, Defines},
        SrpmPackagingError,
    },
    std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc::{Receiver, Sender},
            Arc, Mutex,
        },
    },
};

const SRPM_QUERY_FORMAT: &str = "%{NAME}-%{VERSION}-%{RELEASE}.src.rpm";
const NESTED_SOURCE_DIR_NAME: &str = "SOURCES";

/// Per-run inputs shared by every staleness worker.
#[derive(Clone)]
pub struct AnalyzeParams {
    pub dist_tag: String,
    pub out_dir: PathBuf,
    pub nested_sources: bool,
    pub repack_all: bool,
    pub run_check: bool,
}

/// Stage-1 worker loop: drain spec files, emit one [SpecState] apiece.
///
/// Cancellation is honored between iterations only; the spec currently
/// being analyzed always runs to completion.
pub fn specs_to_pack_worker(
    logger: &slog::Logger,
    requests: &Arc<Mutex<Receiver<PathBuf>>>,
    results: &Sender<SpecState>,
    cancel: &Arc<AtomicBool>,
    params: &AnalyzeParams,
) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!(logger, "Cancellation signal received");
            return;
        }

        let spec_file = {
            let receiver = match requests.lock() {
                Ok(receiver) => receiver,
                Err(_) => return,
            };
            match receiver.recv() {
                Ok(spec_file) => spec_file,
                Err(_) => return,
            }
        };

        let state = analyze_spec(logger, &spec_file, params);
        if results.send(state).is_err() {
            return;
        }
    }
}

fn analyze_spec(logger: &slog::Logger, spec_file: &Path, params: &AnalyzeParams) -> SpecState {
    let mut state = SpecState {
        spec_file: spec_file.to_path_buf(),
        srpm_file: PathBuf::new(),
        to_pack: false,
        err: None,
    };

    let containing_dir = spec_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut defines: Defines = rpm::default_defines(params.run_check);
    defines.insert(rpm::DIST_TAG_DEFINE.to_string(), params.dist_tag.clone());

    // The spec's sources either sit next to it or in a nested SOURCES
    // directory, depending on how the spec tree is laid out.
    let source_dir = if params.nested_sources {
        containing_dir.join(NESTED_SOURCE_DIR_NAME)
    } else {
        containing_dir.clone()
    };

    let query_results = match rpm::query_spec(
        spec_file,
        &source_dir,
        SRPM_QUERY_FORMAT,
        &defines,
        rpm::QUERY_HEADER_ARGUMENT,
    ) {
        Ok(results) => results,
        Err(SrpmPackagingError::NoCompatibleArch) => {
            info!(
                logger,
                "Skipping SPEC ({}) due to incompatible build architecture",
                spec_file.display()
            );
            return state;
        }
        Err(e) => {
            state.err = Some(e.into());
            return state;
        }
    };

    if query_results.len() != 1 {
        state.err = Some(anyhow!(
            "unexpected query results, wanted (1) result but got ({}), results: {:?}",
            query_results.len(),
            query_results
        ));
        return state;
    }

    state.srpm_file = params.out_dir.join(&query_results[0]);

    if params.repack_all {
        state.to_pack = true;
        return state;
    }

    // The query alone does not prove the spec builds here; re-check the
    // architecture gates before consulting timestamps.
    let compatible = match rpm::spec_arch_is_compatible(spec_file, &source_dir, &defines) {
        Ok(compatible) => compatible,
        Err(e) => {
            state.err = Some(e.into());
            return state;
        }
    };

    if !compatible {
        info!(
            logger,
            "Skipping ({}) since it cannot be built on current architecture.",
            spec_file.display()
        );
        return state;
    }

    let srpm_metadata = match std::fs::metadata(&state.srpm_file) {
        Ok(metadata) => metadata,
        Err(_) => {
            debug!(
                logger,
                "Updating ({}) since ({}) is not yet built",
                spec_file.display(),
                state.srpm_file.display()
            );
            state.to_pack = true;
            return state;
        }
    };

    let (spec_mod_time, latest_file) =
        match srpm_packaging::fs::last_modified_file(&containing_dir) {
            Ok(latest) => latest,
            Err(e) => {
                state.err = Some(anyhow!(
                    "failed to query modification time for SPEC ({}). Error: {}",
                    spec_file.display(),
                    e
                ));
                return state;
            }
        };

    let srpm_mod_time = match srpm_metadata.modified() {
        Ok(time) => time,
        Err(e) => {
            state.err = Some(anyhow!(
                "failed to query modification time for SRPM ({}). Error: {}",
                state.srpm_file.display(),
                e
            ));
            return state;
        }
    };

    if spec_mod_time > srpm_mod_time {
        debug!(
            logger,
            "Updating ({}) since ({}) has changed",
            spec_file.display(),
            latest_file.display()
        );
        state.to_pack = true;
    }

    state
}
