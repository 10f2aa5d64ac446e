// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{logging, pipeline},
    anyhow::{bail, Context, Result},
    clap::{App, Arg},
    slog::warn,
    srpm_packaging::{
        http,
        hydrate::SourceRetrievalConfig,
        signatures::{SignatureHandling, SignatureLookup},
    },
    std::path::{Path, PathBuf},
};

const SIGNATURE_ENFORCE_STRING: &str = "enforce";
const SIGNATURE_SKIP_STRING: &str = "skip";
const SIGNATURE_UPDATE_STRING: &str = "update";

const DEFAULT_BUILD_DIR: &str = "./build/SRPMS";
const DEFAULT_WORKER_COUNT: &str = "10";

pub fn run_cli() -> Result<()> {
    let matches = App::new("srpmpacker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A tool to package a SRPM.")
        .arg(
            Arg::with_name("specs-dir")
                .long("specs-dir")
                .required(true)
                .takes_value(true)
                .value_name("DIR")
                .help("Path to the SPEC directory to create SRPMs from"),
        )
        .arg(
            Arg::with_name("out-dir")
                .long("out-dir")
                .required(true)
                .takes_value(true)
                .value_name("DIR")
                .help("Directory to place the output SRPM"),
        )
        .arg(
            Arg::with_name("build-dir")
                .long("build-dir")
                .takes_value(true)
                .default_value(DEFAULT_BUILD_DIR)
                .value_name("DIR")
                .help("Directory to store temporary files while building"),
        )
        .arg(
            Arg::with_name("dist-tag")
                .long("dist-tag")
                .required(true)
                .takes_value(true)
                .value_name("TAG")
                .help("The distribution tag SRPMs will be built with"),
        )
        .arg(
            Arg::with_name("pack-list")
                .long("pack-list")
                .takes_value(true)
                .value_name("FILE")
                .help("Path to a list of SPECs to pack. If empty will pack all SPECs"),
        )
        .arg(
            Arg::with_name("run-check")
                .long("run-check")
                .help("Whether or not to run the spec file's check section during package build"),
        )
        .arg(
            Arg::with_name("workers")
                .long("workers")
                .takes_value(true)
                .default_value(DEFAULT_WORKER_COUNT)
                .value_name("N")
                .help("Number of concurrent workers to pack with"),
        )
        .arg(
            Arg::with_name("repack")
                .long("repack")
                .help("Rebuild all SRPMs, even if already built"),
        )
        .arg(
            Arg::with_name("nested-sources")
                .long("nested-sources")
                .help("Set if for a given SPEC, its sources are contained in a SOURCES directory next to the SPEC file"),
        )
        .arg(
            Arg::with_name("source-url")
                .long("source-url")
                .takes_value(true)
                .value_name("URL")
                .help("URL to a source server to download SPEC sources from"),
        )
        .arg(
            Arg::with_name("ca-cert")
                .long("ca-cert")
                .takes_value(true)
                .value_name("FILE")
                .help("Root certificate authority to use when downloading files"),
        )
        .arg(
            Arg::with_name("tls-cert")
                .long("tls-cert")
                .takes_value(true)
                .value_name("FILE")
                .help("TLS client certificate to use when downloading files"),
        )
        .arg(
            Arg::with_name("tls-key")
                .long("tls-key")
                .takes_value(true)
                .value_name("FILE")
                .help("TLS client key to use when downloading files"),
        )
        .arg(
            Arg::with_name("worker-tar")
                .long("worker-tar")
                .takes_value(true)
                .value_name("FILE")
                .help("Full path to worker_chroot.tar.gz. If this argument is empty, SRPMs will be packed in the host environment"),
        )
        .arg(
            Arg::with_name("signature-handling")
                .long("signature-handling")
                .takes_value(true)
                .possible_values(&[
                    SIGNATURE_ENFORCE_STRING,
                    SIGNATURE_SKIP_STRING,
                    SIGNATURE_UPDATE_STRING,
                ])
                .default_value(SIGNATURE_ENFORCE_STRING)
                .help("Specifies how to handle signature mismatches for source files"),
        )
        .arg(
            Arg::with_name("log-file")
                .long("log-file")
                .takes_value(true)
                .value_name("FILE")
                .help("Also append log output to this file"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .possible_values(&["debug", "info", "warn", "error"])
                .default_value("info")
                .help("Minimum log level to emit"),
        )
        .get_matches();

    let min_level = match matches.value_of("log-level").unwrap_or("info") {
        "debug" => slog::Level::Debug,
        "warn" => slog::Level::Warning,
        "error" => slog::Level::Error,
        _ => slog::Level::Info,
    };
    let log_file = non_empty_value(&matches, "log-file").map(PathBuf::from);
    let logger = logging::logger_from_options(min_level, log_file.as_deref())?;

    let workers = matches
        .value_of("workers")
        .unwrap_or(DEFAULT_WORKER_COUNT)
        .parse::<i64>()
        .context("parsing --workers")?;
    if workers <= 0 {
        bail!("Value in --workers must be greater than zero. Found {}", workers);
    }

    let signature_handling = match matches
        .value_of("signature-handling")
        .unwrap_or(SIGNATURE_ENFORCE_STRING)
    {
        SIGNATURE_SKIP_STRING => {
            warn!(logger, "Skipping signature enforcement");
            SignatureHandling::SkipCheck
        }
        SIGNATURE_UPDATE_STRING => {
            warn!(logger, "Will update signature files as needed");
            SignatureHandling::Update
        }
        _ => SignatureHandling::Enforce,
    };

    let specs_dir = PathBuf::from(
        matches
            .value_of("specs-dir")
            .context("--specs-dir is required")?,
    );
    if !specs_dir.is_dir() {
        bail!("--specs-dir ({}) is not a directory", specs_dir.display());
    }

    let out_dir = PathBuf::from(
        matches.value_of("out-dir").context("--out-dir is required")?,
    );
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    let worker_tar = match non_empty_value(&matches, "worker-tar").map(PathBuf::from) {
        Some(path) => {
            if !path.is_file() {
                bail!("--worker-tar ({}) does not exist", path.display());
            }
            Some(path)
        }
        None => None,
    };

    // The build system may pass empty strings for unset TLS options; an
    // identity needs both halves.
    let tls_cert = non_empty_value(&matches, "tls-cert").map(PathBuf::from);
    let tls_key = non_empty_value(&matches, "tls-key").map(PathBuf::from);
    let client_identity = match (&tls_cert, &tls_key) {
        (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be provided together"),
    };

    let ca_cert = non_empty_value(&matches, "ca-cert").map(PathBuf::from);
    let client = http::build_client(ca_cert.as_deref(), client_identity)
        .context("building the source download client")?;

    // Template configuration every packed SRPM starts from; workers clone
    // it and fill in the per-spec pieces.
    let template_config = SourceRetrievalConfig {
        local_source_dir: PathBuf::new(),
        source_url: non_empty_value(&matches, "source-url")
            .unwrap_or("")
            .to_string(),
        client,
        signature_handling,
        signature_lookup: SignatureLookup::new(),
    };

    let pack_list = match non_empty_value(&matches, "pack-list") {
        Some(path) => pipeline::parse_pack_list_file(Path::new(path))?,
        None => Vec::new(),
    };

    let options = pipeline::PackOptions {
        specs_dir,
        dist_tag: matches
            .value_of("dist-tag")
            .context("--dist-tag is required")?
            .to_string(),
        build_dir: PathBuf::from(matches.value_of("build-dir").unwrap_or(DEFAULT_BUILD_DIR)),
        out_dir,
        worker_tar,
        workers: workers as usize,
        nested_sources: matches.is_present("nested-sources"),
        repack_all: matches.is_present("repack"),
        run_check: matches.is_present("run-check"),
    };

    pipeline::create_all_srpms_wrapper(&logger, options, &pack_list, &template_config)
}

fn non_empty_value<'a>(matches: &'a clap::ArgMatches, name: &str) -> Option<&'a str> {
    matches.value_of(name).filter(|value| !value.is_empty())
}
