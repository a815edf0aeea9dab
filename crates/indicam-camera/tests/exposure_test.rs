//! Exposure acquisition against the simulated property server

mod common;

use common::{open_camera, open_camera_with};
use indicam_bus::ExposureResponse;
use indicam_camera::{
    CameraError, ControllerConfig, ErrorPolicy, ExposureCancel, ExposureOutcome, ExposureRequest,
};
use indicam_core::{HeaderValue, Image, InboundEvent};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_image_arrives_before_deadline() {
    let mut cam = open_camera("sim").await;
    cam.sim
        .set_exposure_response(ExposureResponse::After(Duration::from_secs(2)));

    let start = Instant::now();
    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(5.0))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "finished early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "finished late: {:?}", elapsed);

    match outcome {
        ExposureOutcome::Image { image, applied } => {
            assert_eq!(applied, vec!["FILTER".to_string(), "CAMERA".to_string()]);
            assert_eq!(image.header("FILTER").and_then(HeaderValue::as_text), Some("U"));
            assert_eq!(image.header("CAMERA").and_then(HeaderValue::as_text), Some("SimCam"));
            assert_eq!(image.header("EXPTIME").and_then(HeaderValue::as_f64), Some(5.0));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_times_out_after_grace_without_abort() {
    let mut cam = open_camera("sim").await;
    cam.sim.set_exposure_response(ExposureResponse::Silent);

    let start = Instant::now();
    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(1.0))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, ExposureOutcome::TimedOut);
    assert!(elapsed >= Duration::from_secs(11), "timed out early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(11200), "timed out late: {:?}", elapsed);
    assert!(cam.sim.writes_to("CCD_ABORT_EXPOSURE").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_issue_no_writes() {
    let mut cam = open_camera("sim").await;

    for duration in [0.0, -0.5, 3600.01, 1e9, f64::NAN, f64::INFINITY] {
        let result = cam.controller.expose(&ExposureRequest::light(duration)).await;
        assert!(
            matches!(result, Err(CameraError::InvalidDuration { .. })),
            "duration {} accepted",
            duration
        );
    }
    for frame_type in ["Dusk", "light", ""] {
        let result = cam
            .controller
            .expose(&ExposureRequest::new(1.0, frame_type))
            .await;
        assert!(
            matches!(result, Err(CameraError::InvalidFrameType { .. })),
            "frame type {:?} accepted",
            frame_type
        );
    }
    assert!(cam.sim.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_single_frame_type_model() {
    let mut cam = open_camera("ratcam").await;
    let result = cam
        .controller
        .expose(&ExposureRequest::new(1.0, "Dark"))
        .await;
    assert!(matches!(result, Err(CameraError::InvalidFrameType { .. })));
    assert!(cam.sim.writes().is_empty());

    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(1.0))
        .await
        .unwrap();
    let image = outcome.image().unwrap();
    assert_eq!(image.header("FILTER").and_then(HeaderValue::as_text), Some("N/A"));
    assert_eq!(image.header("CAMERA").and_then(HeaderValue::as_text), Some("RATcam"));
}

#[tokio::test(start_paused = true)]
async fn test_frame_type_and_duration_written_in_order() {
    let mut cam = open_camera("sim").await;
    cam.controller
        .expose(&ExposureRequest::new(0.5, "Flat"))
        .await
        .unwrap();

    let writes = cam.sim.writes();
    let vectors: Vec<&str> = writes.iter().map(|w| w.vector.as_str()).collect();
    assert_eq!(vectors, vec!["CCD_FRAME_TYPE", "CCD_EXPOSURE"]);
    assert_eq!(
        writes[1].value("CCD_EXPOSURE_VALUE").and_then(|v| v.as_number()),
        Some(0.5)
    );
    let frame_type = cam.sim.vector("CCD Simulator", "CCD_FRAME_TYPE").unwrap();
    assert!(frame_type.switch("Flat").unwrap().is_on());
}

#[tokio::test(start_paused = true)]
async fn test_error_messages_do_not_end_exposure() {
    let mut cam = open_camera("sim").await;
    cam.sim
        .set_exposure_response(ExposureResponse::After(Duration::from_secs(3)));
    cam.sim.message(
        "CCD Simulator",
        "ERROR: shutter did not open",
        Duration::from_millis(500),
    );
    cam.sim
        .message("CCD Simulator", "Exposure in progress", Duration::from_secs(1));

    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(3.0))
        .await
        .unwrap();

    assert!(outcome.image().is_some());
    assert_eq!(cam.observer.errors(), vec!["ERROR: shutter did not open".to_string()]);
    assert_eq!(cam.observer.messages().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_policy_ends_on_server_error() {
    let config = ControllerConfig {
        error_policy: ErrorPolicy::FailFast,
        ..ControllerConfig::default()
    };
    let mut cam = open_camera_with("sim", config).await;
    cam.sim.set_exposure_response(ExposureResponse::Silent);
    cam.sim
        .message("CCD Simulator", "Exposure in progress", Duration::from_millis(200));
    cam.sim
        .message("CCD Simulator", "ERROR: readout failed", Duration::from_secs(1));

    let start = Instant::now();
    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(30.0))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ExposureOutcome::ServerError("ERROR: readout failed".to_string())
    );
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_image_during_confirmation_is_kept() {
    let mut cam = open_camera("sim").await;
    // Image is queued ahead of the exposure echo
    cam.sim
        .set_exposure_response(ExposureResponse::After(Duration::ZERO));

    let start = Instant::now();
    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(10.0))
        .await
        .unwrap();
    assert!(outcome.image().is_some());
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_non_image_payload_is_ignored() {
    let mut cam = open_camera("sim").await;
    cam.sim
        .set_exposure_response(ExposureResponse::After(Duration::from_secs(2)));
    cam.sim.schedule(
        InboundEvent::BinaryPayload {
            device: "CCD Simulator".to_string(),
            vector: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".stream".to_string(),
            data: vec![0; 64],
        },
        Duration::from_secs(1),
    );

    let start = Instant::now();
    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(2.0))
        .await
        .unwrap();
    assert_eq!(outcome.image().map(|i| i.format.as_str()), Some(".fits"));
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_image_is_an_error() {
    let mut cam = open_camera("sim").await;
    cam.sim.set_exposure_response(ExposureResponse::Silent);
    cam.sim.schedule(
        InboundEvent::BinaryPayload {
            device: "CCD Simulator".to_string(),
            vector: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            data: b"not a fits file".to_vec(),
        },
        Duration::from_secs(1),
    );

    let result = cam.controller.expose(&ExposureRequest::light(2.0)).await;
    assert!(matches!(result, Err(CameraError::Decode(_))));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_sends_abort() {
    let mut cam = open_camera("sim").await;
    cam.sim.set_exposure_response(ExposureResponse::Silent);
    let cancel = ExposureCancel::new();
    let canceller = cancel.clone();

    let start = Instant::now();
    let request = ExposureRequest::light(60.0);
    let (outcome, _) = tokio::join!(
        cam.controller.expose_with_cancel(&request, &cancel),
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        }
    );

    assert_eq!(outcome.unwrap(), ExposureOutcome::Aborted);
    assert!(start.elapsed() < Duration::from_secs(2));
    let aborts = cam.sim.writes_to("CCD_ABORT_EXPOSURE");
    assert_eq!(aborts.len(), 1);
    assert!(aborts[0]
        .value("ABORT")
        .and_then(|v| v.as_switch())
        .unwrap()
        .is_on());
}

#[tokio::test(start_paused = true)]
async fn test_connection_lost_is_not_a_timeout() {
    let mut cam = open_camera("sim").await;
    cam.sim.set_exposure_response(ExposureResponse::Silent);
    let sim = cam.sim.clone();

    let request = ExposureRequest::light(5.0);
    let (result, _) = tokio::join!(
        cam.controller.expose(&request),
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sim.close();
        }
    );
    assert!(matches!(result, Err(CameraError::ConnectionLost)));
}

#[tokio::test(start_paused = true)]
async fn test_leftover_image_does_not_complete_exposure() {
    let mut cam = open_camera("sim").await;
    cam.sim.set_exposure_response(ExposureResponse::Silent);

    let mut leftover = Image::blank(2, 2);
    leftover.set("EXPTIME", 99.0);
    cam.sim.push(InboundEvent::BinaryPayload {
        device: "CCD Simulator".to_string(),
        vector: "CCD1".to_string(),
        element: "CCD1".to_string(),
        format: ".fits".to_string(),
        data: leftover.to_bytes(),
    });

    let start = Instant::now();
    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(5.0))
        .await
        .unwrap();

    assert_eq!(outcome, ExposureOutcome::TimedOut);
    assert!(start.elapsed() >= Duration::from_secs(15), "ended early: {:?}", start.elapsed());
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_ignores_other_devices() {
    let config = ControllerConfig {
        error_policy: ErrorPolicy::FailFast,
        ..ControllerConfig::default()
    };
    let mut cam = open_camera_with("sim", config).await;
    cam.sim
        .set_exposure_response(ExposureResponse::After(Duration::from_secs(2)));
    cam.sim
        .message("Telescope Simulator", "ERROR: slew limit", Duration::from_millis(500));

    let outcome = cam
        .controller
        .expose(&ExposureRequest::light(2.0))
        .await
        .unwrap();

    assert!(outcome.image().is_some());
    assert_eq!(cam.observer.errors(), vec!["ERROR: slew limit".to_string()]);
}
