//! Integration tests for the full job pipeline.
//!
//! Tests: Broker → Messenger → JobReceiver → Component → ResponsePacker → Broker
//!
//! Verifies:
//! - Each response goes to its own request's reply-to with its correlation id
//! - Component errors and panics become error responses
//! - Failed health checks hand the request back for redelivery
//! - Shutdown stops the loop cleanly

#[cfg(test)]
mod tests {
    use std::path::Path;

    use prost::Message;

    use batchexec_core::{
        ComponentJob, DataType, DetectionComponent, DetectionError, DetectionOutcome, ErrorCode,
        ImageJob, ImageLocation, JobSpec, Properties,
    };
    use batchexec_messaging::envelope::{
        AudioRequest, DetectionRequest, DetectionResponse, ImageRequest, MediaDataType,
    };
    use batchexec_messaging::{
        BrokerMessage, Destination, InMemoryBroker, InMemoryConnection, MediaTypeFilter,
        PropertyValue,
    };

    use crate::executor::{ExecutionLoop, ExecutorError, JobOutcome};
    use crate::health_check::{HealthCheck, HealthCheckError, HealthCheckJob};
    use crate::job_receiver::{CORRELATION_ID_PROPERTY, JOB_ID_PROPERTY, JobReceiver};
    use crate::messenger::Messenger;
    use crate::response_packer::ResponsePacker;
    use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

    const REQUESTS: &str = "MPF.DETECTION_TEST_REQUEST";
    const HEALTH_MEDIA: &str = "/media/health.png";

    /// Finds two faces in anything, except for a few magic file names.
    #[derive(Default)]
    struct FaceFinder {
        healthy: bool,
        jobs_seen: usize,
    }

    impl DetectionComponent for FaceFinder {
        fn set_run_directory(&mut self, _dir: &Path) {}

        fn init(&mut self) -> bool {
            true
        }

        fn close(&mut self) -> bool {
            true
        }

        fn detection_type(&self) -> String {
            "FACE".to_string()
        }

        fn supports(&self, data_type: DataType) -> bool {
            data_type == DataType::Image
        }

        fn get_image_detections(&mut self, job: &ImageJob) -> DetectionOutcome<ImageLocation> {
            self.jobs_seen += 1;
            match job.spec.data_uri.as_str() {
                HEALTH_MEDIA if !self.healthy => Ok(Vec::new()),
                "/media/corrupt.png" => Err(DetectionError::new(
                    ErrorCode::CouldNotReadDatafile,
                    "could not decode image",
                )
                .into()),
                "/media/explode.png" => panic!("model weights missing"),
                _ => Ok(vec![
                    ImageLocation::new(0, 0, 10, 10).with_confidence(0.9),
                    ImageLocation::new(20, 20, 10, 10).with_confidence(0.7),
                ]),
            }
        }
    }

    fn image_request(media_path: &str) -> BrokerMessage {
        let request = DetectionRequest {
            request_id: 1,
            media_path: media_path.to_string(),
            data_type: MediaDataType::Image as i32,
            image_request: Some(ImageRequest::default()),
            ..Default::default()
        };
        BrokerMessage::bytes(request.encode_to_vec())
    }

    fn audio_request(media_path: &str) -> BrokerMessage {
        let request = DetectionRequest {
            request_id: 2,
            media_path: media_path.to_string(),
            data_type: MediaDataType::Audio as i32,
            audio_request: Some(AudioRequest {
                start_time: 0,
                stop_time: 5000,
                ..Default::default()
            }),
            ..Default::default()
        };
        BrokerMessage::bytes(request.encode_to_vec())
    }

    fn publish(broker: &InMemoryBroker, job_id: i64, correlation: &str, body: BrokerMessage) {
        let message = body
            .with_property(JOB_ID_PROPERTY, PropertyValue::Long(job_id))
            .with_string_property(CORRELATION_ID_PROPERTY, correlation)
            .with_reply_to(Destination::queue(format!("replies-{correlation}")));
        broker.publish(REQUESTS, message).unwrap();
    }

    fn executor(
        broker: &InMemoryBroker,
        component: FaceFinder,
        health_check: HealthCheck,
    ) -> (ExecutionLoop<InMemoryConnection, FaceFinder>, ShutdownCoordinator) {
        let shutdown = ShutdownCoordinator::new();
        let messenger =
            Messenger::connect(broker, REQUESTS, &MediaTypeFilter::any(), &shutdown).unwrap();
        let detection_type = component.detection_type();
        let receiver = JobReceiver::new(
            messenger,
            ResponsePacker::default(),
            Properties::new(),
            detection_type,
        );
        (ExecutionLoop::new(receiver, component, health_check), shutdown)
    }

    fn response(broker: &InMemoryBroker, correlation: &str) -> (BrokerMessage, DetectionResponse) {
        let mut messages = broker.drain(&format!("replies-{correlation}"));
        assert_eq!(messages.len(), 1, "exactly one response for {correlation}");
        let message = messages.remove(0);
        let decoded = DetectionResponse::decode(message.body_bytes().unwrap().clone()).unwrap();
        (message, decoded)
    }

    fn health_check(max_attempts: u32) -> HealthCheck {
        let job = HealthCheckJob {
            job: ComponentJob::Image(ImageJob {
                spec: JobSpec::new("HealthCheck", HEALTH_MEDIA),
                feed_forward_location: None,
            }),
            min_num_tracks: 1,
        };
        HealthCheck::enabled(job, None, Some(max_attempts)).with_sleeper(|_| {})
    }

    #[test]
    fn each_job_is_answered_on_its_own_reply_queue() {
        let broker = InMemoryBroker::new();
        publish(&broker, 1, "first", image_request("/media/a.png"));
        publish(&broker, 2, "second", image_request("/media/b.png"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), HealthCheck::Disabled);

        assert_eq!(executor.run_once().unwrap(), JobOutcome::Completed);
        assert_eq!(executor.run_once().unwrap(), JobOutcome::Completed);

        let (message, first) = response(&broker, "first");
        assert_eq!(message.string_property("CorrelationId").as_deref(), Some("first"));
        assert_eq!(message.long_property("JobId"), Some(1));
        assert_eq!(first.error, ErrorCode::DetectionSuccess.as_i32());
        assert_eq!(first.image_responses[0].detection_type, "FACE");
        assert_eq!(first.image_responses[0].image_locations.len(), 2);

        let (message, _) = response(&broker, "second");
        assert_eq!(message.long_property("JobId"), Some(2));
        assert_eq!(broker.queue_len(REQUESTS), 0);
        assert_eq!(executor.stats().jobs_completed, 2);
    }

    #[test]
    fn unsupported_media_is_reported_without_calling_component() {
        let broker = InMemoryBroker::new();
        publish(&broker, 3, "audio", audio_request("/media/talk.wav"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), HealthCheck::Disabled);

        assert_eq!(executor.run_once().unwrap(), JobOutcome::Unsupported);
        let (_, decoded) = response(&broker, "audio");
        assert_eq!(decoded.error, ErrorCode::UnsupportedDataType.as_i32());
        assert_eq!(executor.component_mut().jobs_seen, 0);
    }

    #[test]
    fn component_errors_become_error_responses() {
        let broker = InMemoryBroker::new();
        publish(&broker, 4, "corrupt", image_request("/media/corrupt.png"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), HealthCheck::Disabled);

        assert_eq!(
            executor.run_once().unwrap(),
            JobOutcome::Failed(ErrorCode::CouldNotReadDatafile)
        );
        let (_, decoded) = response(&broker, "corrupt");
        assert_eq!(decoded.error, ErrorCode::CouldNotReadDatafile.as_i32());
        assert_eq!(decoded.error_message, "could not decode image");
    }

    #[test]
    fn component_panic_is_reported_and_loop_continues() {
        let broker = InMemoryBroker::new();
        publish(&broker, 5, "boom", image_request("/media/explode.png"));
        publish(&broker, 6, "after", image_request("/media/fine.png"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), HealthCheck::Disabled);

        assert_eq!(
            executor.run_once().unwrap(),
            JobOutcome::Failed(ErrorCode::OtherDetectionErrorType)
        );
        let (_, decoded) = response(&broker, "boom");
        assert_eq!(decoded.error, ErrorCode::OtherDetectionErrorType.as_i32());
        assert!(decoded.error_message.contains("model weights missing"));

        assert_eq!(executor.run_once().unwrap(), JobOutcome::Completed);
        response(&broker, "after");
    }

    #[test]
    fn malformed_request_is_skipped() {
        let broker = InMemoryBroker::with_max_redeliveries(0);
        publish(&broker, 7, "garbage", BrokerMessage::bytes(vec![0xff, 0xff, 0xff]));
        publish(&broker, 8, "valid", image_request("/media/a.png"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), HealthCheck::Disabled);

        assert_eq!(executor.run_once().unwrap(), JobOutcome::Completed);
        response(&broker, "valid");
        assert_eq!(broker.queue_len("replies-garbage"), 0);
        assert_eq!(broker.queue_len("DLQ"), 1);
    }

    #[test]
    fn failed_send_redelivers_the_request() {
        let broker = InMemoryBroker::new();
        publish(&broker, 9, "retry", image_request("/media/a.png"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), HealthCheck::Disabled);

        broker.fail_next_sends(1);
        executor.run_once().unwrap();
        assert_eq!(broker.queue_len("replies-retry"), 0);
        assert_eq!(broker.queue_len(REQUESTS), 1);

        assert_eq!(executor.run_once().unwrap(), JobOutcome::Completed);
        let (message, _) = response(&broker, "retry");
        assert_eq!(message.long_property("JobId"), Some(9));
    }

    #[test]
    fn failing_health_check_rejects_jobs_until_fatal() {
        let broker = InMemoryBroker::new();
        publish(&broker, 10, "held", image_request("/media/a.png"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), health_check(2));

        assert_eq!(executor.run_once().unwrap(), JobOutcome::Rejected);
        assert_eq!(broker.queue_len(REQUESTS), 1);

        let err = executor.run_once().unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::HealthCheck(HealthCheckError::Fatal { attempts: 2, .. })
        ));
        assert_eq!(err.exit_code(), crate::executor::exit_code::HEALTH_CHECK_FAILURE);
        assert_eq!(broker.queue_len(REQUESTS), 1);
        assert_eq!(broker.queue_len("replies-held"), 0);
    }

    #[test]
    fn passing_health_check_lets_jobs_through() {
        let broker = InMemoryBroker::new();
        publish(&broker, 11, "ok", image_request("/media/a.png"));
        let component = FaceFinder {
            healthy: true,
            ..Default::default()
        };
        let (mut executor, _shutdown) = executor(&broker, component, health_check(1));

        assert_eq!(executor.run_once().unwrap(), JobOutcome::Completed);
        response(&broker, "ok");
        // Health check job plus the real one.
        assert_eq!(executor.component_mut().jobs_seen, 2);
    }

    #[test]
    fn shutdown_stops_the_loop_cleanly() {
        let broker = InMemoryBroker::new();
        publish(&broker, 12, "never", image_request("/media/a.png"));
        let (mut executor, shutdown) = executor(&broker, FaceFinder::default(), HealthCheck::Disabled);

        shutdown.request_shutdown(ShutdownSignal::Terminate);
        let err = executor.run().unwrap_err();
        assert!(matches!(err, ExecutorError::Quit));
        assert_eq!(err.exit_code(), crate::executor::exit_code::SUCCESS);
        assert_eq!(broker.queue_len(REQUESTS), 1);
    }

    #[test]
    fn fatal_health_check_ends_the_loop_with_its_error() {
        let broker = InMemoryBroker::new();
        publish(&broker, 13, "doomed", image_request("/media/a.png"));
        let (mut executor, _shutdown) = executor(&broker, FaceFinder::default(), health_check(1));

        let err = executor.run().unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::HealthCheck(HealthCheckError::Fatal { attempts: 1, .. })
        ));
        assert_eq!(err.exit_code(), crate::executor::exit_code::HEALTH_CHECK_FAILURE);
        assert_eq!(broker.queue_len("replies-doomed"), 0);
    }
}
