// Copyright 2026 Trellis Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trellis runtime library: a container engine for live, mutating web pages.
//!
//! Declarative container definitions are matched against a page into a tree
//! of nodes with stable ids. Each node refreshes itself as the DOM changes,
//! and operations are queued against nodes, bindings, or the focused node.

#![allow(clippy::new_without_default, clippy::should_implement_trait)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod container;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod focus;
pub mod ops;
pub mod page;
