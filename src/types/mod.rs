// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resource and credential types.

pub mod binding;
pub mod token;

pub use binding::{
    AcrPullBinding, AcrPullBindingSpec, AcrPullBindingStatus, BindingCondition, BindingKey,
    ManagedIdentity, ResolvedBinding,
};
pub use token::IssuedToken;
