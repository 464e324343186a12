//! Gallery activities
//!
//! Both activities may run more than once for the same scheduled call
//! (retries, expired leases). Image processing overwrites its derived files
//! and the notification is deduplicated by the mailer through a key derived
//! from the call and its content.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use photoflow_durable::activity::{Activity, ActivityContext, ActivityError};

use super::services::{BlobStore, EmailMessage, GalleryRepository, Mailer, ServiceError};

/// Error types reported by the gallery activities
pub mod error_types {
    pub const GALLERY_NOT_FOUND: &str = "GALLERY_NOT_FOUND";
    pub const TOO_MANY_IMAGES: &str = "TOO_MANY_IMAGES";
    pub const IMAGE_MISSING: &str = "IMAGE_MISSING";
    pub const IMAGE_TOO_LARGE: &str = "IMAGE_TOO_LARGE";
    pub const INVALID_EMAIL: &str = "INVALID_EMAIL";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
}

/// Missing records are permanent; everything else is worth retrying
fn service_error(err: ServiceError) -> ActivityError {
    match err {
        ServiceError::NotFound(what) => ActivityError::non_retryable(format!("not found: {what}"))
            .with_type(error_types::GALLERY_NOT_FOUND),
        other => ActivityError::retryable(other.to_string())
            .with_type(error_types::SERVICE_UNAVAILABLE),
    }
}

// =============================================================================
// Process images
// =============================================================================

/// Limits enforced while processing a gallery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GalleryLimits {
    pub max_images: usize,
    pub max_file_size: u64,
}

impl Default for GalleryLimits {
    fn default() -> Self {
        Self {
            max_images: 100,
            max_file_size: 100 * 1024 * 1024,
        }
    }
}

/// Computes a content digest for every image of a gallery
///
/// Input is the gallery id; output is the number of processed images.
pub struct ProcessImagesActivity {
    repository: Arc<dyn GalleryRepository>,
    blobs: Arc<dyn BlobStore>,
    limits: GalleryLimits,
}

impl ProcessImagesActivity {
    pub fn new(
        repository: Arc<dyn GalleryRepository>,
        blobs: Arc<dyn BlobStore>,
        limits: GalleryLimits,
    ) -> Self {
        Self {
            repository,
            blobs,
            limits,
        }
    }

    /// Key of the digest written for an image
    pub fn digest_key(image_key: &str) -> String {
        format!("derived/{image_key}.sha256")
    }
}

#[async_trait]
impl Activity for ProcessImagesActivity {
    const TYPE: &'static str = "process_images";
    type Input = String;
    type Output = usize;

    #[instrument(skip(self, ctx), fields(attempt = ctx.attempt))]
    async fn execute(&self, ctx: &ActivityContext, gallery_id: String) -> Result<usize, ActivityError> {
        let gallery = self
            .repository
            .find_gallery(&gallery_id)
            .await
            .map_err(service_error)?
            .ok_or_else(|| {
                ActivityError::non_retryable(format!("gallery {gallery_id} not found"))
                    .with_type(error_types::GALLERY_NOT_FOUND)
            })?;

        if gallery.images.len() > self.limits.max_images {
            return Err(ActivityError::non_retryable(format!(
                "gallery {gallery_id} has {} images, limit is {}",
                gallery.images.len(),
                self.limits.max_images
            ))
            .with_type(error_types::TOO_MANY_IMAGES));
        }

        for (index, image_key) in gallery.images.iter().enumerate() {
            let data = self
                .blobs
                .get(image_key)
                .await
                .map_err(service_error)?
                .ok_or_else(|| {
                    ActivityError::non_retryable(format!("image {image_key} missing"))
                        .with_type(error_types::IMAGE_MISSING)
                })?;

            if data.len() as u64 > self.limits.max_file_size {
                return Err(ActivityError::non_retryable(format!(
                    "image {image_key} is {} bytes, limit is {}",
                    data.len(),
                    self.limits.max_file_size
                ))
                .with_type(error_types::IMAGE_TOO_LARGE));
            }

            let digest = hex::encode(Sha256::digest(&data));
            self.blobs
                .put(&Self::digest_key(image_key), digest.into_bytes())
                .await
                .map_err(service_error)?;

            ctx.heartbeat(Some(json!({ "processed": index + 1 })))
                .await
                .map_err(|e| ActivityError::retryable(e.to_string()))?;
            debug!(%image_key, "image processed");
        }

        let count = gallery.images.len();
        self.repository
            .mark_processed(&gallery_id, count)
            .await
            .map_err(service_error)?;

        info!(%gallery_id, count, "gallery images processed");
        Ok(count)
    }
}

// =============================================================================
// Send notification email
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationInput {
    pub gallery_name: String,
    pub user_email: String,
}

/// Tells the owner that processing of their gallery is taking long
pub struct SendNotificationEmailActivity {
    mailer: Arc<dyn Mailer>,
}

impl SendNotificationEmailActivity {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    /// Idempotency key for a notification
    ///
    /// Stable across attempts of one scheduled call and changes with the
    /// message content.
    pub fn notification_key(call_key: &str, input: &NotificationInput) -> String {
        let mut hasher = Sha256::new();
        hasher.update(call_key.as_bytes());
        hasher.update([0]);
        hasher.update(input.gallery_name.as_bytes());
        hasher.update([0]);
        hasher.update(input.user_email.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn message(input: &NotificationInput) -> EmailMessage {
        EmailMessage {
            to: input.user_email.clone(),
            subject: format!("Your gallery \"{}\" is still processing", input.gallery_name),
            body: format!(
                "Processing of your gallery \"{}\" is taking longer than expected. \
                 It will appear once every image is ready.",
                input.gallery_name
            ),
        }
    }
}

#[async_trait]
impl Activity for SendNotificationEmailActivity {
    const TYPE: &'static str = "send_notification_email";
    type Input = NotificationInput;
    type Output = String;

    #[instrument(skip(self, ctx, input), fields(attempt = ctx.attempt))]
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: NotificationInput,
    ) -> Result<String, ActivityError> {
        let email = input.user_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ActivityError::non_retryable(format!(
                "invalid recipient {:?}",
                input.user_email
            ))
            .with_type(error_types::INVALID_EMAIL));
        }

        let key = Self::notification_key(&ctx.idempotency_key(), &input);
        let message_id = self
            .mailer
            .send(&key, Self::message(&input))
            .await
            .map_err(service_error)?;

        info!(gallery_name = %input.gallery_name, %message_id, "notification sent");
        Ok(message_id)
    }
}
