//! Gallery post-processing
//!
//! The workflow, its activities and the collaborators the activities are
//! built with.

mod activities;
mod services;
mod workflow;

pub use activities::{
    error_types, GalleryLimits, NotificationInput, ProcessImagesActivity,
    SendNotificationEmailActivity,
};
pub use services::{
    BlobGalleryRepository, BlobStore, EmailMessage, FsBlobStore, Gallery, GalleryRepository,
    InMemoryBlobStore, InMemoryGalleryRepository, InMemoryMailer, LogMailer, Mailer, ServiceError,
};
pub use workflow::{
    GalleryProcessingInput, GalleryProcessingOutput, GalleryProcessingWorkflow,
    PROCESSING_COMPLETE_SIGNAL,
};

use std::sync::Arc;
use std::time::Duration;

use photoflow_durable::{ActivityRegistry, WorkflowRegistry};

/// Collaborators handed to the gallery activities
#[derive(Clone)]
pub struct GalleryServices {
    pub repository: Arc<dyn GalleryRepository>,
    pub blobs: Arc<dyn BlobStore>,
    pub mailer: Arc<dyn Mailer>,
}

/// Register the gallery workflow
pub fn register_workflows(registry: &mut WorkflowRegistry, default_timeout: Duration) {
    registry.register(GalleryProcessingWorkflow::new(default_timeout));
}

/// Register the gallery activities with their collaborators
pub fn register_activities(
    registry: &mut ActivityRegistry,
    services: &GalleryServices,
    limits: GalleryLimits,
) {
    registry
        .register(ProcessImagesActivity::new(
            services.repository.clone(),
            services.blobs.clone(),
            limits,
        ))
        .register(SendNotificationEmailActivity::new(services.mailer.clone()));
}
