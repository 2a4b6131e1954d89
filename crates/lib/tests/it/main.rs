/*! Integration tests for driftsync.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - store: metadata store invariants (usn ordering, batches, observers)
 * - refresh: filesystem indexing against real temp trees
 * - sync_pair: two in-process devices synchronizing over loopback
 * - transfer: standalone download/upload tasks against a real peer
 * - kernel: façade lifecycle and the public operation surface
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("driftsync=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod helpers;
mod kernel;
mod refresh;
mod store;
mod sync_pair;
mod transfer;
