// src/state.rs

use std::sync::Arc;

use axum::extract::FromRef;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    config::Config,
    repository::Repositories,
    services::{
        attempt::ExamService,
        catalog::CatalogService,
        certificate::{CertificateRenderer, CertificateService, HtmlCertificateRenderer},
        enrollment::EnrollmentService,
        progress::{ProgressAggregator, ProgressEvent, ProgressPipeline, run_worker},
        unlock::UnlockGate,
    },
};

/// Every service, wired to its repositories once at assembly time.
#[derive(Clone)]
pub struct Services {
    pub exams: Arc<ExamService>,
    pub catalog: Arc<CatalogService>,
    pub enrollments: Arc<EnrollmentService>,
    pub unlock: Arc<UnlockGate>,
    pub progress: Arc<ProgressAggregator>,
    pub certificates: CertificateService,
}

impl Services {
    /// Wires services without starting the progress worker. The returned
    /// receiver carries every published progress event.
    pub fn assemble(
        repos: &Repositories,
        enrollment_update_retries: u32,
        renderer: Arc<dyn CertificateRenderer>,
    ) -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (pipeline, receiver) = ProgressPipeline::channel();

        let certificates = CertificateService::new(repos, renderer);
        let unlock = Arc::new(UnlockGate::new(repos));
        let services = Self {
            exams: Arc::new(ExamService::new(repos, pipeline.clone())),
            catalog: Arc::new(CatalogService::new(repos)),
            enrollments: Arc::new(EnrollmentService::new(repos, unlock.clone(), pipeline)),
            unlock,
            progress: Arc::new(ProgressAggregator::new(
                repos,
                certificates.clone(),
                enrollment_update_retries,
            )),
            certificates,
        };

        (services, receiver)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub services: Services,
}

impl AppState {
    /// Assembles services and spawns the progress worker.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: Config, repos: Repositories) -> Self {
        let (services, receiver) = Services::assemble(
            &repos,
            config.enrollment_update_retries,
            Arc::new(HtmlCertificateRenderer),
        );
        tokio::spawn(run_worker(services.progress.clone(), receiver));

        Self { config, services }
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for Arc<ExamService> {
    fn from_ref(state: &AppState) -> Self {
        state.services.exams.clone()
    }
}

impl FromRef<AppState> for Arc<CatalogService> {
    fn from_ref(state: &AppState) -> Self {
        state.services.catalog.clone()
    }
}

impl FromRef<AppState> for Arc<EnrollmentService> {
    fn from_ref(state: &AppState) -> Self {
        state.services.enrollments.clone()
    }
}

impl FromRef<AppState> for Arc<UnlockGate> {
    fn from_ref(state: &AppState) -> Self {
        state.services.unlock.clone()
    }
}

impl FromRef<AppState> for Arc<ProgressAggregator> {
    fn from_ref(state: &AppState) -> Self {
        state.services.progress.clone()
    }
}

impl FromRef<AppState> for CertificateService {
    fn from_ref(state: &AppState) -> Self {
        state.services.certificates.clone()
    }
}
