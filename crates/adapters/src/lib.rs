// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Adapters for everything outside the process boundary: the Nix store,
//! remote builder machines, the machines file, and the `nix-store
//! --serve` wire protocol (§6 "External interfaces").

pub mod artifacts;
pub mod derivation_store;
pub mod machines;
pub mod nar;
pub mod protocol;
pub mod store;
pub mod transport;
mod watcher;

pub use derivation_store::{DerivationStore, DerivationStoreError, LocalDerivationStore};
pub use machines::{MachinesFileError, MACHINES_FILE_POLL_INTERVAL};
pub use protocol::{BuildDerivationRequest, BuildDerivationResult, ProtocolError};
pub use store::{ContentStore, LocalStore, PathInfo, StoreError};
pub use transport::{BuilderConnection, BuilderTransport, SubprocessTransport, TransportError};
pub use watcher::MachinesFileWatcher;

#[cfg(any(test, feature = "test-support"))]
pub use derivation_store::fake::FakeDerivationStore;
#[cfg(any(test, feature = "test-support"))]
pub use store::fake::FakeContentStore;
#[cfg(any(test, feature = "test-support"))]
pub use transport::fake::FakeBuilderTransport;
