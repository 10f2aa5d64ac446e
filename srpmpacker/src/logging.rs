// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    anyhow::{Context, Result},
    slog::Drain,
    std::{io::Write, path::Path, sync::Mutex},
};

/// A slog Drain that uses println! and optionally appends to a log file.
pub struct PrintlnDrain {
    /// Minimum logging level that we're emitting.
    pub min_level: slog::Level,

    log_file: Option<Mutex<std::fs::File>>,
}

impl slog::Drain for PrintlnDrain {
    type Ok = ();
    type Err = std::io::Error;

    fn log(
        &self,
        record: &slog::Record,
        _values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        if !record.level().is_at_least(self.min_level) {
            return Ok(());
        }

        println!("{}", record.msg());

        if let Some(log_file) = &self.log_file {
            if let Ok(mut file) = log_file.lock() {
                writeln!(file, "{}", record.msg())?;
            }
        }

        Ok(())
    }
}

/// Construct the root logger from the CLI logging options.
pub fn logger_from_options(
    min_level: slog::Level,
    log_file: Option<&Path>,
) -> Result<slog::Logger> {
    let log_file = match log_file {
        None => None,
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;

            Some(Mutex::new(file))
        }
    };

    Ok(slog::Logger::root(
        PrintlnDrain {
            min_level,
            log_file,
        }
        .fuse(),
        slog::o!(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_receives_emitted_records() {
        let td = tempfile::Builder::new()
            .prefix("srpmpacker-test")
            .tempdir()
            .unwrap();
        let log_path = td.path().join("packer.log");

        let logger = logger_from_options(slog::Level::Info, Some(&log_path)).unwrap();
        slog::info!(logger, "visible line");
        slog::debug!(logger, "suppressed line");
        drop(logger);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("visible line"));
        assert!(!contents.contains("suppressed line"));
    }
}
