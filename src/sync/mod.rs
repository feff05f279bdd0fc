// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Secret Synchronizer: materializes issued tokens as pull secrets and keeps them
//! attached to service accounts.

pub mod secrets;
pub mod service_accounts;

pub use secrets::{
    get_pull_secret, recorded_expiry, recorded_scope, render_pull_secret, sync_pull_secret,
    SyncOutcome,
};
pub use service_accounts::{detach_everywhere, sync_attachments, Attachments};
