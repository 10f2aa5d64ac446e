// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Interaction with the system RPM tooling.

Spec files are never interpreted here. Everything flows through the
external `rpmspec` and `rpmbuild` programs: queries against a spec's
header, architecture compatibility checks, and source package builds.
*/

use {
    crate::error::{Result, SrpmPackagingError},
    duct::cmd,
    once_cell::sync::OnceCell,
    slog::debug,
    std::{
        collections::BTreeMap,
        io::{BufRead, BufReader},
        path::Path,
        process::Command,
    },
};

/// Macro name carrying the distribution tag.
pub const DIST_TAG_DEFINE: &str = "dist";

/// Macro name toggling a spec's %check section.
pub const WITH_CHECK_DEFINE: &str = "with_check";

/// Argument restricting spec queries to the source package header.
pub const QUERY_HEADER_ARGUMENT: &str = "--srpm";

const EXCLUSIVE_ARCH_QUERY_FORMAT: &str = "[%{EXCLUSIVEARCH} ]";
const EXCLUDE_ARCH_QUERY_FORMAT: &str = "[%{EXCLUDEARCH} ]";

// Emitted by rpmspec/rpmbuild when ExclusiveArch/ExcludeArch rule out the
// host. Callers treat this as a skip rather than a failure.
const NO_COMPATIBLE_ARCH_MARKER: &str = "No compatible architectures found for build";

/// Macro definitions passed to every query and build invocation.
pub type Defines = BTreeMap<String, String>;

/// Baseline defines every invocation starts from.
///
/// Always contains the `dist` and `with_check` keys; `dist` is expected to
/// be overwritten with a real distribution tag by the caller.
pub fn default_defines(run_check: bool) -> Defines {
    let mut defines = Defines::new();
    defines.insert(
        WITH_CHECK_DEFINE.to_string(),
        if run_check { "1" } else { "0" }.to_string(),
    );
    defines.insert(DIST_TAG_DEFINE.to_string(), "%{nil}".to_string());

    defines
}

fn define_arguments(source_dir: &Path, defines: &Defines) -> Vec<String> {
    let mut args = vec![
        "--define".to_string(),
        format!("_sourcedir {}", source_dir.display()),
    ];

    for (name, value) in defines {
        args.push("--define".to_string());
        args.push(format!("{} {}", name, value));
    }

    args
}

/// Trim query output and drop lines carrying no tag value.
fn sanitize_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "(none)")
        .map(String::from)
        .collect()
}

/// Query a spec file via `rpmspec` and return the non-empty output lines.
///
/// A query failure caused by the spec excluding the host architecture is
/// reported as [SrpmPackagingError::NoCompatibleArch].
pub fn query_spec(
    spec_file: &Path,
    source_dir: &Path,
    query_format: &str,
    defines: &Defines,
    header_argument: &str,
) -> Result<Vec<String>> {
    let mut command = Command::new("rpmspec");
    command
        .arg("-q")
        .arg(header_argument)
        .arg("--qf")
        .arg(query_format)
        .args(define_arguments(source_dir, defines))
        .arg(spec_file);

    let output = command.output().map_err(|e| SrpmPackagingError::Tool {
        tool: "rpmspec",
        message: e.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);

        if stderr.contains(NO_COMPATIBLE_ARCH_MARKER) {
            return Err(SrpmPackagingError::NoCompatibleArch);
        }

        return Err(SrpmPackagingError::Tool {
            tool: "rpmspec",
            message: format!(
                "query of ({}) exited with {}: {}",
                spec_file.display(),
                output.status,
                stderr.trim()
            ),
        });
    }

    Ok(sanitize_output(&String::from_utf8_lossy(&output.stdout)))
}

/// The RPM architecture of the host, resolved once per process.
pub fn host_architecture() -> Result<&'static str> {
    static HOST_ARCH: OnceCell<String> = OnceCell::new();

    let arch = HOST_ARCH.get_or_try_init(|| -> Result<String> {
        let output = Command::new("rpm")
            .arg("--eval")
            .arg("%{_arch}")
            .output()
            .map_err(|e| SrpmPackagingError::Tool {
                tool: "rpm",
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SrpmPackagingError::Tool {
                tool: "rpm",
                message: format!(
                    "evaluating %{{_arch}} exited with {}",
                    output.status
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    })?;

    Ok(arch.as_str())
}

fn arch_tokens(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .filter(|token| *token != "(none)")
        .map(String::from)
        .collect()
}

fn exclusive_list_allows(arch_list: &[String], host_arch: &str) -> bool {
    arch_list.is_empty() || arch_list.iter().any(|arch| arch == host_arch)
}

fn exclude_list_allows(arch_list: &[String], host_arch: &str) -> bool {
    !arch_list.iter().any(|arch| arch == host_arch)
}

/// Whether the spec's ExclusiveArch tag permits building on this host.
///
/// A spec with no ExclusiveArch entries builds everywhere.
pub fn spec_exclusive_arch_is_compatible(
    spec_file: &Path,
    source_dir: &Path,
    defines: &Defines,
) -> Result<bool> {
    let lines = query_spec(
        spec_file,
        source_dir,
        EXCLUSIVE_ARCH_QUERY_FORMAT,
        defines,
        QUERY_HEADER_ARGUMENT,
    )?;

    Ok(exclusive_list_allows(&arch_tokens(&lines), host_architecture()?))
}

/// Whether the spec's ExcludeArch tag permits building on this host.
pub fn spec_exclude_arch_is_compatible(
    spec_file: &Path,
    source_dir: &Path,
    defines: &Defines,
) -> Result<bool> {
    let lines = query_spec(
        spec_file,
        source_dir,
        EXCLUDE_ARCH_QUERY_FORMAT,
        defines,
        QUERY_HEADER_ARGUMENT,
    )?;

    Ok(exclude_list_allows(&arch_tokens(&lines), host_architecture()?))
}

/// Whether both architecture gates permit building on this host.
pub fn spec_arch_is_compatible(
    spec_file: &Path,
    source_dir: &Path,
    defines: &Defines,
) -> Result<bool> {
    if !spec_exclusive_arch_is_compatible(spec_file, source_dir, defines)? {
        return Ok(false);
    }

    spec_exclude_arch_is_compatible(spec_file, source_dir, defines)
}

/// Build a source package from a spec with `rpmbuild -bs`.
///
/// `top_dir` must already hold the canonical SPECS/SOURCES/SRPMS layout.
/// Builder output is streamed line by line into the logger.
pub fn generate_srpm_from_spec(
    logger: &slog::Logger,
    spec_file: &Path,
    top_dir: &Path,
    defines: &Defines,
) -> Result<()> {
    let mut args = vec![
        "-bs".to_string(),
        "--define".to_string(),
        format!("_topdir {}", top_dir.display()),
    ];

    for (name, value) in defines {
        args.push("--define".to_string());
        args.push(format!("{} {}", name, value));
    }

    args.push(spec_file.display().to_string());

    let tool_error = |message: String| SrpmPackagingError::Tool {
        tool: "rpmbuild",
        message,
    };

    let reader = cmd("rpmbuild", &args)
        .stderr_to_stdout()
        .reader()
        .map_err(|e| tool_error(e.to_string()))?;
    {
        let lines = BufReader::new(&reader);
        for line in lines.lines() {
            let line = line.map_err(|e| tool_error(e.to_string()))?;
            debug!(logger, "{}", line);
        }
    }

    let output = reader
        .try_wait()
        .map_err(|e| tool_error(e.to_string()))?
        .ok_or_else(|| tool_error("unable to wait on rpmbuild".to_string()))?;

    if !output.status.success() {
        return Err(tool_error(format!(
            "build of ({}) exited with {}",
            spec_file.display(),
            output.status
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// The architecture-gating tests drive the real rpm tooling against
    /// fixture specs whose tags name the usual build hosts; skip elsewhere.
    fn rpm_tooling_usable() -> bool {
        let rpmspec_present = Command::new("rpmspec")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);

        if !rpmspec_present {
            return false;
        }

        matches!(host_architecture(), Ok("x86_64") | Ok("aarch64"))
    }

    fn testdata_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata")
    }

    fn fixture_defines() -> Defines {
        let mut defines = Defines::new();
        defines.insert(DIST_TAG_DEFINE.to_string(), ".cmX".to_string());
        defines.insert(WITH_CHECK_DEFINE.to_string(), "1".to_string());
        defines
    }

    fn assert_arch_checks(spec_name: &str, expected: bool) {
        let spec_file = testdata_dir().join(spec_name);
        let source_dir = testdata_dir();
        let defines = fixture_defines();

        assert_eq!(
            spec_exclusive_arch_is_compatible(&spec_file, &source_dir, &defines).unwrap(),
            expected
        );
        assert_eq!(
            spec_exclude_arch_is_compatible(&spec_file, &source_dir, &defines).unwrap(),
            expected
        );
        assert_eq!(
            spec_arch_is_compatible(&spec_file, &source_dir, &defines).unwrap(),
            expected
        );
    }

    #[test]
    fn test_arch_checks_pass_for_supported_architectures() {
        if !rpm_tooling_usable() {
            return;
        }

        assert_arch_checks("supported_unsupported_architectures.spec", true);
    }

    #[test]
    fn test_arch_checks_pass_without_arch_tags() {
        if !rpm_tooling_usable() {
            return;
        }

        assert_arch_checks("no_exclusive_architecture.spec", true);
    }

    #[test]
    fn test_arch_checks_fail_for_unsupported_architectures() {
        if !rpm_tooling_usable() {
            return;
        }

        assert_arch_checks("unsupported_architectures.spec", false);
    }

    #[test]
    fn test_query_spec_predicts_srpm_name() {
        if !rpm_tooling_usable() {
            return;
        }

        let results = query_spec(
            &testdata_dir().join("no_exclusive_architecture.spec"),
            &testdata_dir(),
            "%{NAME}-%{VERSION}-%{RELEASE}.src.rpm",
            &fixture_defines(),
            QUERY_HEADER_ARGUMENT,
        )
        .unwrap();

        assert_eq!(
            results,
            vec!["no-exclusive-architecture-1.0.0-1.cmX.src.rpm".to_string()]
        );
    }

    #[test]
    fn test_default_defines_keys() {
        let defines = default_defines(true);
        assert_eq!(defines.get(WITH_CHECK_DEFINE).map(String::as_str), Some("1"));
        assert!(defines.contains_key(DIST_TAG_DEFINE));

        let defines = default_defines(false);
        assert_eq!(defines.get(WITH_CHECK_DEFINE).map(String::as_str), Some("0"));
    }

    #[test]
    fn test_sanitize_output() {
        let raw = "  hello-1.0-1.src.rpm  \n\n(none)\n  world.tar.gz\n";
        assert_eq!(
            sanitize_output(raw),
            vec!["hello-1.0-1.src.rpm".to_string(), "world.tar.gz".to_string()]
        );
    }

    #[test]
    fn test_exclusive_list_allows() {
        let empty: Vec<String> = vec![];
        assert!(exclusive_list_allows(&empty, "x86_64"));

        let arches = vec!["x86_64".to_string(), "aarch64".to_string()];
        assert!(exclusive_list_allows(&arches, "x86_64"));
        assert!(!exclusive_list_allows(&arches, "i686"));
    }

    #[test]
    fn test_exclude_list_allows() {
        let empty: Vec<String> = vec![];
        assert!(exclude_list_allows(&empty, "x86_64"));

        let arches = vec!["i686".to_string()];
        assert!(exclude_list_allows(&arches, "x86_64"));
        assert!(!exclude_list_allows(&arches, "i686"));
    }

    #[test]
    fn test_define_arguments_order() {
        let mut defines = Defines::new();
        defines.insert("dist".to_string(), ".cm2".to_string());

        let args = define_arguments(Path::new("/tmp/sources"), &defines);
        assert_eq!(args[0], "--define");
        assert_eq!(args[1], "_sourcedir /tmp/sources");
        assert_eq!(args[2], "--define");
        assert_eq!(args[3], "dist .cm2");
    }
}
