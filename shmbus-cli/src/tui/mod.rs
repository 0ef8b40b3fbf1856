// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Pandey

//! TUI module for the shmbus dashboard.

mod app;

pub use app::run_dashboard;
