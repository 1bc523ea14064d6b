//! Turns broker messages into jobs and jobs back into responses.

use prost::Message;
use tracing::{error, info, warn};

use batchexec_core::{
    AllAudioTracksJob, AllVideoTracksJob, AudioJob, ComponentJob, DataType, DetectionResults,
    ErrorCode, GenericJob, ImageJob, JobId, JobSpec, Properties, VideoJob,
};
use batchexec_messaging::envelope::{DetectionRequest, MediaDataType};
use batchexec_messaging::{
    BrokerConnection, BrokerMessage, EnvelopeError, PropertyValue, RequestPayload,
};

use crate::job_context::{AmqMetadata, JobContext, ProtobufMetadata, job_name};
use crate::messenger::{Messenger, MessengerError};
use crate::response_packer::ResponsePacker;

pub const JOB_ID_PROPERTY: &str = "JobId";
pub const CORRELATION_ID_PROPERTY: &str = "CorrelationId";
pub const BREADCRUMB_ID_PROPERTY: &str = "breadcrumbId";
pub const SPLIT_SIZE_PROPERTY: &str = "SplitSize";

/// Why a request could not be turned into a job.
#[derive(Debug, thiserror::Error)]
pub enum JobReceiveError {
    #[error(transparent)]
    Messenger(#[from] MessengerError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("request is missing the \"{0}\" property")]
    MissingProperty(&'static str),

    #[error("request has no reply-to destination")]
    MissingReplyTo,
}

impl JobReceiveError {
    /// Problems with the message itself, as opposed to the broker.
    pub fn is_malformed_request(&self) -> bool {
        !matches!(self, JobReceiveError::Messenger(_))
    }
}

pub struct JobReceiver<C: BrokerConnection> {
    messenger: Messenger<C>,
    packer: ResponsePacker,
    /// Defaults applied to every job before per-request properties.
    environment_job_properties: Properties,
    detection_type: String,
}

impl<C: BrokerConnection> JobReceiver<C> {
    pub fn new(
        messenger: Messenger<C>,
        packer: ResponsePacker,
        environment_job_properties: Properties,
        detection_type: impl Into<String>,
    ) -> Self {
        Self {
            messenger,
            packer,
            environment_job_properties,
            detection_type: detection_type.into(),
        }
    }

    pub fn messenger(&self) -> &Messenger<C> {
        &self.messenger
    }

    /// Wait for the next well-formed job.
    ///
    /// Malformed requests are logged and rolled back, then the next message
    /// is awaited. Broker failures and cancellation are returned as is.
    pub fn get_job(&mut self) -> Result<JobContext, MessengerError> {
        loop {
            match self.try_get_job() {
                Ok(ctx) => return Ok(ctx),
                Err(JobReceiveError::Messenger(e)) => return Err(e),
                Err(e) => {
                    error!(error = %e, "discarding malformed request");
                    self.messenger.rollback()?;
                }
            }
        }
    }

    /// Receive and decode exactly one message.
    pub fn try_get_job(&mut self) -> Result<JobContext, JobReceiveError> {
        let message = self.messenger.receive_message()?;
        let body = message.body_bytes().cloned().unwrap_or_default();

        let job_id = message
            .long_property(JOB_ID_PROPERTY)
            .map(JobId::new)
            .ok_or(JobReceiveError::MissingProperty(JOB_ID_PROPERTY))?;
        let request = DetectionRequest::decode(body).map_err(EnvelopeError::from)?;
        let amq_meta = amq_metadata(&message, job_id)?;

        let mut job_properties = self.environment_job_properties.clone();
        job_properties.extend(
            request
                .algorithm_property
                .iter()
                .map(|p| (p.property_name.clone(), p.property_value.clone())),
        );
        let media_properties = request.media_metadata.clone();

        let spec = |range: Option<(i32, i32)>| {
            JobSpec::new(job_name(job_id, &request.media_path, range), &request.media_path)
                .with_job_properties(job_properties.clone())
                .with_media_properties(media_properties.clone())
        };

        let job = match request.payload()? {
            RequestPayload::Video(v) => {
                let range = Some((v.start_frame, v.stop_frame));
                if v.feed_forward_all_tracks {
                    ComponentJob::AllVideoTracks(AllVideoTracksJob {
                        spec: spec(range),
                        start_frame: v.start_frame,
                        stop_frame: v.stop_frame,
                        feed_forward_tracks: v
                            .feed_forward_tracks
                            .iter()
                            .cloned()
                            .map(Into::into)
                            .collect(),
                    })
                } else {
                    ComponentJob::Video(VideoJob {
                        spec: spec(range),
                        start_frame: v.start_frame,
                        stop_frame: v.stop_frame,
                        feed_forward_track: v.feed_forward_track.clone().map(Into::into),
                    })
                }
            }
            RequestPayload::Image(i) => ComponentJob::Image(ImageJob {
                spec: spec(None),
                feed_forward_location: i.feed_forward_location.clone().map(Into::into),
            }),
            RequestPayload::Audio(a) => {
                let range = Some((a.start_time, a.stop_time));
                if a.feed_forward_all_tracks {
                    ComponentJob::AllAudioTracks(AllAudioTracksJob {
                        spec: spec(range),
                        start_time: a.start_time,
                        stop_time: a.stop_time,
                        feed_forward_tracks: a
                            .feed_forward_tracks
                            .iter()
                            .cloned()
                            .map(Into::into)
                            .collect(),
                    })
                } else {
                    ComponentJob::Audio(AudioJob {
                        spec: spec(range),
                        start_time: a.start_time,
                        stop_time: a.stop_time,
                        feed_forward_track: a.feed_forward_track.clone().map(Into::into),
                    })
                }
            }
            RequestPayload::Generic(g) => ComponentJob::Generic(GenericJob {
                spec: spec(None),
                feed_forward_track: g.feed_forward_track.clone().map(Into::into),
            }),
        };

        let protobuf_meta = ProtobufMetadata {
            request_id: request.request_id,
            media_id: request.media_id,
            task_index: request.task_index,
            task_name: request.task_name.clone(),
            action_index: request.action_index,
            action_name: request.action_name.clone(),
            data_type: MediaDataType::try_from(request.data_type)
                .map(DataType::from)
                .unwrap_or_else(|_| job.data_type()),
        };

        let ctx = JobContext::new(job, amq_meta, protobuf_meta);
        info!(
            job = %ctx.job_name(),
            correlation_id = %ctx.amq_meta().correlation_id,
            "received job"
        );
        Ok(ctx)
    }

    /// Send the results of `ctx` and commit.
    ///
    /// A response that cannot be packed is replaced by an error response.
    pub fn complete_job(
        &mut self,
        ctx: &JobContext,
        results: &DetectionResults,
    ) -> Result<(), MessengerError> {
        match self.packer.pack_response(ctx, &self.detection_type, results) {
            Ok(body) => {
                self.send(ctx, body)?;
                info!(
                    job = %ctx.job_name(),
                    detections = results.len(),
                    elapsed_ms = ctx.elapsed().map(|d| d.as_millis() as u64),
                    "completed job"
                );
                Ok(())
            }
            Err(e) => {
                error!(job = %ctx.job_name(), error = %e, "failed to pack response");
                self.report_job_error(
                    ctx,
                    ErrorCode::OtherDetectionErrorType,
                    &format!("Failed to create response: {e}"),
                )
            }
        }
    }

    /// Send an error response for `ctx` and commit.
    pub fn report_job_error(
        &mut self,
        ctx: &JobContext,
        code: ErrorCode,
        explanation: &str,
    ) -> Result<(), MessengerError> {
        warn!(job = %ctx.job_name(), code = %code, explanation, "reporting job error");
        match self
            .packer
            .pack_error_response(ctx, &self.detection_type, code, explanation)
        {
            Ok(body) => self.send(ctx, body),
            Err(e) => {
                error!(job = %ctx.job_name(), error = %e, "failed to pack error response; rolling back");
                self.messenger.rollback()
            }
        }
    }

    /// Report that the component cannot handle the job's media type.
    pub fn report_unsupported_data_type(&mut self, ctx: &JobContext) -> Result<(), MessengerError> {
        let data_type = ctx.job().data_type();
        if data_type == DataType::Unknown {
            self.report_job_error(
                ctx,
                ErrorCode::UnrecognizedDataType,
                "The detection component does not support jobs with an unknown media type.",
            )
        } else {
            self.report_job_error(
                ctx,
                ErrorCode::UnsupportedDataType,
                &format!("The detection component does not support {data_type} jobs."),
            )
        }
    }

    /// Return the current request for redelivery.
    pub fn reject_job(&mut self) -> Result<(), MessengerError> {
        self.messenger.rollback()
    }

    fn send(&mut self, ctx: &JobContext, body: Vec<u8>) -> Result<(), MessengerError> {
        let meta = ctx.amq_meta();
        let mut message = BrokerMessage::bytes(body)
            .with_string_property(CORRELATION_ID_PROPERTY, meta.correlation_id.clone())
            .with_property(JOB_ID_PROPERTY, PropertyValue::Long(meta.job_id.get()));
        if let Some(breadcrumb) = &meta.breadcrumb_id {
            message = message.with_string_property(BREADCRUMB_ID_PROPERTY, breadcrumb.clone());
        }
        if let Some(split_size) = meta.split_size {
            message = message.with_property(SPLIT_SIZE_PROPERTY, PropertyValue::Int(split_size));
        }

        match self
            .messenger
            .send_response(&meta.reply_to, message, meta.priority)
        {
            Ok(()) => Ok(()),
            Err(MessengerError::Quit) => Err(MessengerError::Quit),
            Err(e) => {
                error!(
                    job = %ctx.job_name(),
                    reply_to = %meta.reply_to,
                    error = %e,
                    "failed to send response; rolling back"
                );
                self.messenger.rollback()
            }
        }
    }
}

fn amq_metadata(message: &BrokerMessage, job_id: JobId) -> Result<AmqMetadata, JobReceiveError> {
    let reply_to = message
        .reply_to
        .clone()
        .ok_or(JobReceiveError::MissingReplyTo)?;
    let correlation_id = message
        .string_property(CORRELATION_ID_PROPERTY)
        .ok_or(JobReceiveError::MissingProperty(CORRELATION_ID_PROPERTY))?;
    Ok(AmqMetadata {
        job_id,
        reply_to,
        priority: message.priority,
        correlation_id,
        breadcrumb_id: message.string_property(BREADCRUMB_ID_PROPERTY),
        split_size: message.int_property(SPLIT_SIZE_PROPERTY),
    })
}
