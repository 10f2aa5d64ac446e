// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Source package assembly building blocks.

This crate holds the machinery for turning RPM spec files into source
packages: wrappers over the external `rpmspec`/`rpmbuild` tooling, the
per-spec signature manifest with its digest verifier, the source hydrator
that fills a build tree's SOURCES directory from local disk and a remote
server, and the small filesystem helpers those pieces share.

The pipeline driving this machinery in parallel lives in the `srpmpacker`
binary crate.
*/

pub mod error;
pub mod fs;
pub mod http;
pub mod hydrate;
pub mod rpm;
pub mod signatures;

pub use crate::error::{Result, SrpmPackagingError};
