// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Pack a tree of RPM spec files into source packages.

For every spec file under the input tree, `srpmpacker` asks the RPM
tooling what source package the spec would produce, decides whether that
package is stale, and if so assembles a private build tree, hydrates the
referenced patches and sources (verifying their digests against a per-spec
signature manifest), runs the external builder, and copies the result into
the output directory. Work fans out over a fixed pool of workers and can
optionally run inside an isolation root extracted from a worker archive.
*/

pub mod analyze;
pub mod chroot;
pub mod cli;
pub mod logging;
pub mod pack;
pub mod pipeline;
