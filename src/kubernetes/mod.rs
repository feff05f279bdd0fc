// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes startup utilities.

pub mod crd;

pub use crd::wait_for_binding_crd;
