//! State carried from receipt of a request to its response.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use batchexec_core::{ComponentJob, DataType, JobId, JobType};
use batchexec_messaging::Destination;

/// Reply routing copied from the request's broker headers.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqMetadata {
    pub job_id: JobId,
    pub reply_to: Destination,
    pub priority: u8,
    pub correlation_id: String,
    pub breadcrumb_id: Option<String>,
    pub split_size: Option<i32>,
}

/// Envelope fields echoed back in the response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtobufMetadata {
    pub request_id: i64,
    pub media_id: i64,
    pub task_index: i32,
    pub task_name: String,
    pub action_index: i32,
    pub action_name: String,
    pub data_type: DataType,
}

/// A received job.
///
/// Built in one step by the job receiver and only mutated to stamp the
/// execution start.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    job_name: String,
    job: ComponentJob,
    amq_meta: AmqMetadata,
    protobuf_meta: ProtobufMetadata,
    started: Option<(DateTime<Utc>, Instant)>,
}

impl JobContext {
    pub fn new(
        job: ComponentJob,
        amq_meta: AmqMetadata,
        protobuf_meta: ProtobufMetadata,
    ) -> Self {
        Self {
            job_id: amq_meta.job_id,
            job_name: job.job_name().to_string(),
            job,
            amq_meta,
            protobuf_meta,
            started: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn job(&self) -> &ComponentJob {
        &self.job
    }

    pub fn job_type(&self) -> JobType {
        self.job.job_type()
    }

    pub fn amq_meta(&self) -> &AmqMetadata {
        &self.amq_meta
    }

    pub fn protobuf_meta(&self) -> &ProtobufMetadata {
        &self.protobuf_meta
    }

    /// Record that the component is about to be invoked.
    pub fn mark_started(&mut self) {
        self.started = Some((Utc::now(), Instant::now()));
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started.map(|(at, _)| at)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|(_, instant)| instant.elapsed())
    }
}

/// `Job <id>:<file name>` with a `(<start>-<stop>)` suffix for segmented
/// media.
pub fn job_name(job_id: JobId, media_path: &str, range: Option<(i32, i32)>) -> String {
    let file_name = media_path
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(media_path);
    match range {
        Some((start, stop)) => format!("Job {job_id}:{file_name}({start}-{stop})"),
        None => format!("Job {job_id}:{file_name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchexec_core::{ImageJob, JobSpec};

    #[test]
    fn job_name_uses_file_name_and_range() {
        assert_eq!(
            job_name(JobId::new(12), "/data/media/clip.mp4", Some((0, 99))),
            "Job 12:clip.mp4(0-99)"
        );
        assert_eq!(
            job_name(JobId::new(3), "photo.jpg", None),
            "Job 3:photo.jpg"
        );
    }

    #[test]
    fn start_stamp_is_set_once_marked() {
        let job = ComponentJob::Image(ImageJob {
            spec: JobSpec::new("Job 1:a.png", "/a.png"),
            feed_forward_location: None,
        });
        let mut ctx = JobContext::new(
            job,
            AmqMetadata {
                job_id: JobId::new(1),
                reply_to: Destination::queue("replies"),
                priority: 4,
                correlation_id: "c".to_string(),
                breadcrumb_id: None,
                split_size: None,
            },
            ProtobufMetadata {
                request_id: 1,
                media_id: 2,
                task_index: 0,
                task_name: "t".to_string(),
                action_index: 0,
                action_name: "a".to_string(),
                data_type: DataType::Image,
            },
        );
        assert!(ctx.started_at().is_none());
        ctx.mark_started();
        assert!(ctx.started_at().is_some());
        assert!(ctx.elapsed().is_some());
        assert_eq!(ctx.job_name(), "Job 1:a.png");
    }
}
