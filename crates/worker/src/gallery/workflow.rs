//! Gallery post-processing workflow
//!
//! ```text
//! process_images(gallery_id) ──► count
//!          │
//!          ▼
//!   select ─┬─ signal "processing_complete" ──► cancel timer ──► done
//!           └─ timer (default timeout) ──► send_notification_email ──► done
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use photoflow_durable::reliability::RetryPolicy;
use photoflow_durable::workflow::{
    ActivityOptions, Awaitable, Resolution, Workflow, WorkflowContext, WorkflowError,
    WorkflowResult,
};

use super::activities::{NotificationInput, ProcessImagesActivity, SendNotificationEmailActivity};

/// Signal sent by the upload layer once processing output is visible
pub const PROCESSING_COMPLETE_SIGNAL: &str = "processing_complete";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryProcessingInput {
    pub gallery_id: String,
    pub gallery_name: String,
    pub user_email: String,
    /// Overrides the worker's default signal wait, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl GalleryProcessingInput {
    pub fn new(
        gallery_id: impl Into<String>,
        gallery_name: impl Into<String>,
        user_email: impl Into<String>,
    ) -> Self {
        Self {
            gallery_id: gallery_id.into(),
            gallery_name: gallery_name.into(),
            user_email: user_email.into(),
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryProcessingOutput {
    pub gallery_id: String,
    pub processed_count: usize,
    /// Whether the owner was emailed because the signal did not arrive in time
    pub notified: bool,
}

#[derive(Debug, Clone)]
pub struct GalleryProcessingWorkflow {
    default_timeout: Duration,
}

impl GalleryProcessingWorkflow {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Retry policy for image processing: 3 attempts, 5s then 10s apart
    pub fn process_images_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(5), 2.0)
    }
}

impl Default for GalleryProcessingWorkflow {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl Workflow for GalleryProcessingWorkflow {
    const TYPE: &'static str = "gallery_processing";
    type Input = GalleryProcessingInput;
    type Output = GalleryProcessingOutput;

    fn run(
        &self,
        ctx: &mut WorkflowContext,
        input: GalleryProcessingInput,
    ) -> WorkflowResult<GalleryProcessingOutput> {
        if !ctx.is_replaying() {
            info!(gallery_id = %input.gallery_id, gallery_name = %input.gallery_name, "starting gallery processing");
        }

        let processed_count = ctx
            .execute_activity::<ProcessImagesActivity>(
                &input.gallery_id,
                ActivityOptions::default().with_retry(Self::process_images_retry()),
            )?
            .map_err(|e| {
                WorkflowError::new(format!("failed to process gallery images: {e}"))
                    .with_code("process_images_failed")
            })?;

        let timeout = input
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let deadline = ctx.start_timer(timeout)?;
        let selected = ctx.select(&[
            Awaitable::signal(PROCESSING_COMPLETE_SIGNAL),
            Awaitable::from(&deadline),
        ])?;

        let notified = match selected.resolution {
            Resolution::Signal(signal) => {
                if !ctx.is_replaying() {
                    info!(payload = %signal.payload, "received processing completion signal");
                }
                ctx.cancel_timer(&deadline)?;
                false
            }
            _ => {
                ctx.execute_activity::<SendNotificationEmailActivity>(
                    &NotificationInput {
                        gallery_name: input.gallery_name.clone(),
                        user_email: input.user_email.clone(),
                    },
                    ActivityOptions::default(),
                )?
                .map_err(|e| {
                    WorkflowError::new(format!("failed to send notification email: {e}"))
                        .with_code("notification_failed")
                })?;
                if !ctx.is_replaying() {
                    info!(gallery_id = %input.gallery_id, "notification email sent after processing timeout");
                }
                true
            }
        };

        Ok(GalleryProcessingOutput {
            gallery_id: input.gallery_id,
            processed_count,
            notified,
        })
    }
}
