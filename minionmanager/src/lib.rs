// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Minion Manager service of the Mariner migration framework.
//!
//! Owns the full lifecycle of minion pools and their machines, validates
//! and satisfies minion machine reservations for transfer actions, and
//! drives the asynchronous allocation, deallocation and healthcheck
//! workflows behind them.

pub mod cron;
pub mod flow;
pub mod lock;
pub mod manager;
pub mod route;
pub mod rpc;
pub mod store;
pub mod taskflow;
pub mod tasks;
