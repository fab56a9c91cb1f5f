//! The bot's use of the job runtime: inbound messages in, replies out.

pub mod jobs;
pub mod processor;

pub use jobs::{MessageProcessingJob, ResponseSendingJob};
pub use processor::{AcknowledgingProcessor, MessageProcessor};

use crate::error::Result;
use crate::jobs::Job;
use tracing::{error, info};

/// Starts and stops a fixed set of jobs, in order.
pub struct WorkerProcessor {
    jobs: Vec<Job>,
}

impl WorkerProcessor {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Start every job. Stops at the first failure and returns it; jobs
    /// started before it keep running.
    pub async fn start_workers(&self) -> Result<()> {
        info!(count = self.jobs.len(), "starting workers");
        for job in &self.jobs {
            if let Err(e) = job.start().await {
                error!(queue = %job.name(), error = %e, "failed to start worker");
                return Err(e);
            }
        }
        info!("workers started");
        Ok(())
    }

    pub async fn stop_workers(&self) {
        info!("stopping workers");
        for job in &self.jobs {
            job.stop().await;
        }
        info!("all workers stopped");
    }
}
