// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
The two-stage packing pipeline.

Stage one fans spec files out over a pool of staleness workers and collects
a [SpecState] per spec. Stage two feeds those states to a pool of pack
workers. The stages never overlap, which keeps the number of open file
descriptors bounded by the worker count.

Both pools share one shape: all work is staged onto a request channel
before results are drained, exactly one result is drained per request, the
first worker error flips a shared cancellation flag, and every worker is
joined before the coordinator returns.
*/

use {
    crate::{analyze, chroot, pack},
    anyhow::{anyhow, bail, Context, Result},
    slog::{debug, error, info},
    srpm_packaging::{fs as fsutil, hydrate::SourceRetrievalConfig},
    std::{
        collections::HashSet,
        fs::File,
        io::{BufRead, BufReader},
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc, Mutex,
        },
        thread,
    },
};

// Spec names starting with this prefix are externally provided and may be
// absent from the spec tree without failing the pack list.
const EXTERNAL_SPEC_PREFIX: &str = "msopenjdk-11";

/// State of one spec file: whether it should be packed, and into what.
pub struct SpecState {
    pub spec_file: PathBuf,
    pub srpm_file: PathBuf,
    pub to_pack: bool,
    pub err: Option<anyhow::Error>,
}

/// Outcome of packing one spec file.
pub struct PackResult {
    pub spec_file: PathBuf,
    pub srpm_file: Option<PathBuf>,
    pub err: Option<anyhow::Error>,
}

/// Inputs describing one packing run.
#[derive(Clone)]
pub struct PackOptions {
    pub specs_dir: PathBuf,
    pub dist_tag: String,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub worker_tar: Option<PathBuf>,
    pub workers: usize,
    pub nested_sources: bool,
    pub repack_all: bool,
    pub run_check: bool,
}

/// Parse a pack list: one spec base name per line, blank lines ignored,
/// duplicates removed.
pub fn parse_pack_list_file(pack_list_file: &Path) -> Result<Vec<String>> {
    let file = File::open(pack_list_file)
        .with_context(|| format!("opening pack list {}", pack_list_file.display()))?;

    let mut pack_list = Vec::new();
    let mut seen = HashSet::new();

    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| {
            format!("reading pack list {}", pack_list_file.display())
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if seen.insert(line.to_string()) {
            pack_list.push(line.to_string());
        }
    }

    if pack_list.is_empty() {
        bail!("cannot have empty pack list ({})", pack_list_file.display());
    }

    Ok(pack_list)
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    for path in glob::glob(pattern).with_context(|| format!("bad glob pattern {}", pattern))? {
        matches.push(path?);
    }

    Ok(matches)
}

/// Find all spec files to consider for packing.
///
/// An empty pack list selects every spec under `specs_dir`. Otherwise each
/// listed name must match exactly one spec file, with the externally
/// provided specs allowed to be absent.
pub fn find_spec_files(
    logger: &slog::Logger,
    specs_dir: &Path,
    pack_list: &[String],
) -> Result<Vec<PathBuf>> {
    let mut spec_files = Vec::new();

    if pack_list.is_empty() {
        spec_files = glob_files(&format!("{}/**/*.spec", specs_dir.display()))?;
    } else {
        for spec_name in pack_list {
            let mut matches =
                glob_files(&format!("{}/**/{}.spec", specs_dir.display(), spec_name))?;

            if matches.len() != 1 {
                if spec_name.starts_with(EXTERNAL_SPEC_PREFIX) {
                    debug!(
                        logger,
                        "Ignoring missing match for '{}', which is externally-provided and thus doesn't have a local spec.",
                        spec_name
                    );
                    continue;
                }

                bail!(
                    "unexpected number of matches ({}) for spec file ({})",
                    matches.len(),
                    spec_name
                );
            }

            spec_files.append(&mut matches);
        }
    }

    Ok(spec_files)
}

/// Run stage one: decide which specs need repacking.
fn calculate_specs_to_repack(
    logger: &slog::Logger,
    spec_files: &[PathBuf],
    params: &analyze::AnalyzeParams,
    workers: usize,
) -> Result<Vec<SpecState>> {
    let (request_sender, request_receiver) = mpsc::channel::<PathBuf>();
    let request_receiver = Arc::new(Mutex::new(request_receiver));
    let (result_sender, result_receiver) = mpsc::channel::<SpecState>();
    let cancel = Arc::new(AtomicBool::new(false));

    info!(logger, "Calculating SPECs to repack");

    // Start the workers now so they begin working as soon as a new job is
    // staged.
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let requests = Arc::clone(&request_receiver);
        let results = result_sender.clone();
        let cancel = Arc::clone(&cancel);
        let logger = logger.clone();
        let params = params.clone();

        handles.push(thread::spawn(move || {
            analyze::specs_to_pack_worker(&logger, &requests, &results, &cancel, &params);
        }));
    }
    drop(result_sender);

    for spec_file in spec_files {
        // A send only fails once every worker has exited; the drain below
        // settles the outcome in that case.
        let _ = request_sender.send(spec_file.clone());
    }
    drop(request_sender);

    let mut states = Vec::with_capacity(spec_files.len());
    let mut first_error = None;
    let mut total_to_repack = 0;

    for _ in 0..spec_files.len() {
        let mut state = match result_receiver.recv() {
            Ok(state) => state,
            Err(_) => break,
        };

        if let Some(err) = state.err.take() {
            error!(
                logger,
                "Failed to check ({}). Error: {:#}",
                state.spec_file.display(),
                err
            );
            first_error = Some(err);
            cancel.store(true, Ordering::SeqCst);
            break;
        }

        if state.to_pack {
            total_to_repack += 1;
        }

        states.push(state);
    }

    debug!(logger, "Waiting for outstanding workers to finish");
    for handle in handles {
        let _ = handle.join();
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    info!(logger, "Packing {}/{} SPECs", total_to_repack, spec_files.len());

    Ok(states)
}

/// Run stage two: pack every spec marked `to_pack`.
fn pack_srpms(
    logger: &slog::Logger,
    spec_states: Vec<SpecState>,
    params: &pack::PackParams,
    template_config: &SourceRetrievalConfig,
    workers: usize,
) -> Result<()> {
    let state_count = spec_states.len();

    let (request_sender, request_receiver) = mpsc::channel::<SpecState>();
    let request_receiver = Arc::new(Mutex::new(request_receiver));
    let (result_sender, result_receiver) = mpsc::channel::<PackResult>();
    let cancel = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let requests = Arc::clone(&request_receiver);
        let results = result_sender.clone();
        let cancel = Arc::clone(&cancel);
        let logger = logger.clone();
        let params = params.clone();
        let template_config = template_config.clone();

        handles.push(thread::spawn(move || {
            pack::pack_srpm_worker(&logger, &requests, &results, &cancel, &params, &template_config);
        }));
    }
    drop(result_sender);

    for state in spec_states {
        let _ = request_sender.send(state);
    }
    drop(request_sender);

    let mut first_error = None;

    for _ in 0..state_count {
        let mut result = match result_receiver.recv() {
            Ok(result) => result,
            Err(_) => break,
        };

        if let Some(err) = result.err.take() {
            error!(
                logger,
                "Failed to pack ({}). Error: {:#}",
                result.spec_file.display(),
                err
            );
            first_error = Some(err);
            cancel.store(true, Ordering::SeqCst);
            break;
        }

        // Specs that were not packed by request carry no SRPM.
        if let Some(srpm_file) = &result.srpm_file {
            info!(
                logger,
                "Packed ({}) -> ({})",
                result.spec_file.file_name().unwrap_or_default().to_string_lossy(),
                srpm_file.file_name().unwrap_or_default().to_string_lossy()
            );
        }
    }

    debug!(logger, "Waiting for outstanding workers to finish");
    for handle in handles {
        let _ = handle.join();
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Discover specs and run both pipeline stages.
pub fn create_all_srpms(
    logger: &slog::Logger,
    options: &PackOptions,
    pack_list: &[String],
    template_config: &SourceRetrievalConfig,
) -> Result<()> {
    info!(logger, "Finding all SPEC files");

    let spec_files = find_spec_files(logger, &options.specs_dir, pack_list)?;

    let analyze_params = analyze::AnalyzeParams {
        dist_tag: options.dist_tag.clone(),
        out_dir: options.out_dir.clone(),
        nested_sources: options.nested_sources,
        repack_all: options.repack_all,
        run_check: options.run_check,
    };
    let spec_states =
        calculate_specs_to_repack(logger, &spec_files, &analyze_params, options.workers)?;

    let pack_params = pack::PackParams {
        dist_tag: options.dist_tag.clone(),
        build_dir: options.build_dir.clone(),
        run_check: options.run_check,
    };
    pack_srpms(
        logger,
        spec_states,
        &pack_params,
        template_config,
        options.workers,
    )
}

/// Run the pipeline, optionally inside an isolation root.
///
/// With a worker archive configured the whole pipeline executes inside a
/// private root filesystem; without one it runs directly on the host.
pub fn create_all_srpms_wrapper(
    logger: &slog::Logger,
    options: PackOptions,
    pack_list: &[String],
    template_config: &SourceRetrievalConfig,
) -> Result<()> {
    let original_out_dir = options.out_dir.clone();
    let mut options = options;

    let active_chroot = match options.worker_tar.clone() {
        Some(worker_tar) => {
            let created = chroot::create_chroot(
                logger,
                &worker_tar,
                &options.build_dir,
                &options.out_dir,
                &options.specs_dir,
            )?;
            options.build_dir = created.build_dir.clone();
            options.out_dir = created.out_dir.clone();
            options.specs_dir = created.specs_dir.clone();
            Some(created.chroot)
        }
        None => None,
    };

    let mut result = match &active_chroot {
        Some(active) => {
            info!(logger, "Packing SRPMs inside a chroot environment");
            active.run(|| create_all_srpms(logger, &options, pack_list, template_config))
        }
        None => {
            info!(logger, "Packing SRPMs in the host environment");
            create_all_srpms(logger, &options, pack_list, template_config)
        }
    };

    if let Some(active) = active_chroot {
        // Without bind mounts the packed SRPMs only exist inside the
        // isolation root; bring them back out before teardown.
        if result.is_ok() && !chroot::is_regular_build() {
            let srpms_in_root = chroot::path_inside_root(active.root_dir(), &options.out_dir);
            result = fsutil::copy_directory_contents(&srpms_in_root, &original_out_dir)
                .map_err(|e| anyhow!("copying SRPMs out of the isolation root: {}", e));
        }

        active.close(logger);
    }

    result
}
