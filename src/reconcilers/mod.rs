// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Binding reconciler and its scheduling and status helpers.

pub mod binding;
pub mod schedule;
pub mod status;

pub use binding::BindingReconciler;
pub use schedule::{Assessment, BackoffPolicy};
