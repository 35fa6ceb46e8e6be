// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for the test suite.  These should not be used in
//! production code.

use slog::Drain;
use slog::Logger;
use slog::o;

/// Set up a logger appropriate for a test named `test_name`.
///
/// Output goes through the test harness's captured stdout, so it only
/// appears for failing tests (or under `--nocapture`).
pub fn test_setup_log(test_name: &str) -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("test" => test_name.to_string()))
}
