// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound clients for the peer services.
//!
//! Clients are built fresh for every use through the factory below;
//! handles are never cached across flow or task boundaries, so a worker
//! that forks or a task that lands on another runtime thread always talks
//! through a clean connection.

pub mod conductor;
pub mod scheduler;
pub mod worker;

pub use conductor::{ConductorClient, HttpConductorClient};
pub use scheduler::{HttpSchedulerClient, SchedulerClient};
pub use worker::{HttpWorkerClient, WorkerClient};

use common::spec::WorkerService;

/// Builds one-shot peer clients. Task constructors take the factory, not
/// client instances.
pub trait ClientFactory: Send + Sync {
    fn conductor(&self) -> Box<dyn ConductorClient>;
    fn scheduler(&self) -> Box<dyn SchedulerClient>;
    /// Client for a specific worker service picked by the scheduler.
    fn worker_for_service(&self, service: &WorkerService) -> Box<dyn WorkerClient>;
}

/// Production factory reading peer base URLs from the settings file.
#[derive(Default)]
pub struct HttpClientFactory;

impl HttpClientFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ClientFactory for HttpClientFactory {
    fn conductor(&self) -> Box<dyn ConductorClient> {
        Box::new(HttpConductorClient::new(
            common::setting::get_config().peers.conductor_url.clone(),
        ))
    }

    fn scheduler(&self) -> Box<dyn SchedulerClient> {
        Box::new(HttpSchedulerClient::new(
            common::setting::get_config().peers.scheduler_url.clone(),
        ))
    }

    fn worker_for_service(&self, service: &WorkerService) -> Box<dyn WorkerClient> {
        Box::new(HttpWorkerClient::new(service.url.clone()))
    }
}
