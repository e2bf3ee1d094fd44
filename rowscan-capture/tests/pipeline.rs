//! End-to-end runs: synthetic or recorded cameras through alignment, fusion
//! and export.

use glam::Vec3;
use rowscan_capture::{
    DepthSource, FrameClock, SyntheticCamera, SyntheticScene, open_sources, save_recording,
};
use rowscan_data::{load_points_from_ply, read_ply_comments};
use rowscan_fusion::config::{CalibrationConfig, CameraSourceConfig, SourceKind};
use rowscan_fusion::export::ExportMetadata;
use rowscan_fusion::ingest::PointCloud;
use rowscan_fusion::{
    CameraId, CaptureSession, FusionConfig, FusionError, FusionService, RigidTransform,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn synthetic(id: &str, x: f32) -> CameraSourceConfig {
    CameraSourceConfig {
        id: CameraId::from(id),
        ignored: false,
        source: SourceKind::Synthetic {
            position: [x, 0.0, 1200.0],
            target: [x, 0.0, 0.0],
            width: 96,
            height: 72,
            focal_px: 72.0,
            fps: 30.0,
        },
    }
}

fn config(dir: &TempDir, cameras: Vec<CameraSourceConfig>) -> FusionConfig {
    let mut config = FusionConfig::default();
    config.calibration = CalibrationConfig {
        directory: Some(dir.path().join("calibration")),
        keep_history: true,
    };
    config.export.directory = dir.path().join("pointclouds");
    config.alignment.reference_camera = Some(CameraId::from("a"));
    config.alignment.collect_sets = 2;
    config.cameras = cameras;
    config
}

fn start(config: FusionConfig) -> FusionService {
    let sources = open_sources(&config, FrameClock::realtime()).unwrap();
    let service = FusionService::new(config).unwrap();
    for source in sources {
        service.attach_source(source).unwrap();
    }
    service
}

#[test]
fn test_align_fuse_export_synthetic_rig() {
    let dir = TempDir::new().unwrap();
    let service = start(config(&dir, vec![synthetic("a", 0.0), synthetic("b", 30.0)]));

    let summary = service.align_cameras().unwrap();
    assert_eq!(summary.reference_camera, CameraId::from("a"));
    assert!(summary.failed.is_empty());

    let icp = summary
        .registered()
        .find(|a| a.camera_id == CameraId::from("b"))
        .and_then(|a| a.icp.as_ref())
        .unwrap();
    assert!(icp.final_residual <= icp.initial_residual);

    // b sits 30 mm along a's x axis
    let b = service.calibration().get(&CameraId::from("b")).unwrap();
    let error = (b.transform.translation - Vec3::new(30.0, 0.0, 0.0)).length();
    assert!(error < 3.0, "translation {:?}", b.transform.translation);
    assert!(b.transform.rotation_angle() < 0.05);
    assert!(b.quality.is_some());

    let session = CaptureSession::new("line_7", 3);
    let first = service.export_current_fusion(&session).unwrap();
    let second = service.export_current_fusion(&session).unwrap();
    assert_eq!(first.sequence_number, 1);
    assert_eq!(second.sequence_number, 2);
    assert!(first.directory.ends_with("line_7/row_3/capture_1"));

    let points = load_points_from_ply(&first.fused_path).unwrap();
    assert!(!points.is_empty());
    let comments = read_ply_comments(&first.fused_path).unwrap();
    assert!(comments.iter().any(|c| c == "cameras a,b"));
    assert!(comments.iter().any(|c| c == "line line_7"));
    assert!(comments.iter().any(|c| c == "sequence 1"));

    let metadata: ExportMetadata =
        serde_json::from_slice(&std::fs::read(&first.metadata_path).unwrap()).unwrap();
    assert_eq!(metadata.provenance.point_count, points.len());
    assert_eq!(metadata.provenance.sequence_number, Some(1));
    assert_eq!(metadata.camera_files.len(), 2);
    for name in metadata.camera_files.values().chain(metadata.color_files.values()) {
        assert!(first.directory.join(name).is_file(), "missing {}", name);
    }

    let status = service.fusion_status();
    assert_eq!(status.calibrated_camera_ids.len(), 2);
    assert_eq!(
        status.last_fusion_provenance.unwrap().sequence_number,
        Some(2)
    );
    service.shutdown();
}

/// Centroid of the points rising above the soil in the three central plant
/// rows. The soil lies 1200 mm from the cameras; the outer rows at
/// x = +-600 mm are left out.
fn plant_centroid(cloud: &PointCloud) -> Vec3 {
    let plants: Vec<Vec3> = cloud
        .points
        .iter()
        .map(|p| p.position)
        .filter(|p| p.z < 1190.0 && p.x.abs() < 440.0)
        .collect();
    assert!(plants.len() > 100, "only {} plant points", plants.len());
    plants.iter().sum::<Vec3>() / plants.len() as f32
}

fn plant_offset(service: &FusionService) -> f32 {
    let fused = service.current_fusion().unwrap();
    let a = plant_centroid(&fused.camera_clouds[&CameraId::from("a")]);
    let b = plant_centroid(&fused.camera_clouds[&CameraId::from("b")]);
    (b - a).length()
}

#[test]
fn test_alignment_brings_rig_views_together() {
    let dir = TempDir::new().unwrap();
    let service = start(config(&dir, vec![synthetic("a", 0.0), synthetic("b", 30.0)]));
    for id in ["a", "b"] {
        service
            .calibration()
            .put(&CameraId::from(id), RigidTransform::IDENTITY, None);
    }
    let before = plant_offset(&service);
    assert!(before > 20.0, "views already agree: {}", before);

    service.align_cameras().unwrap();
    let b = service.calibration().get(&CameraId::from("b")).unwrap();
    let error = (b.transform.translation - Vec3::new(30.0, 0.0, 0.0)).length();
    assert!(error < 3.0, "translation {:?}", b.transform.translation);
    assert!(b.transform.rotation_angle() < 0.01);

    let after = plant_offset(&service);
    assert!(after < 5.0, "views {} mm apart after alignment", after);
    assert!(after < before);
}

#[test]
fn test_uncalibrated_camera_is_excluded_from_live_fusion() {
    let dir = TempDir::new().unwrap();
    let service = start(config(
        &dir,
        vec![synthetic("a", 0.0), synthetic("b", 20.0), synthetic("c", -20.0)],
    ));

    service.align_cameras().unwrap();
    assert_eq!(service.reset_calibration(Some(&CameraId::from("c"))).unwrap(), 1);

    let fused = service.current_fusion().unwrap();
    let provenance = &fused.provenance;
    assert_eq!(
        provenance.contributing_camera_ids,
        vec![CameraId::from("a"), CameraId::from("b")]
    );
    assert_eq!(provenance.excluded_camera_ids, vec![CameraId::from("c")]);
    assert!(!fused.is_empty());
}

#[test]
fn test_calibration_survives_restart() {
    let dir = TempDir::new().unwrap();
    let cameras = vec![synthetic("a", 0.0), synthetic("b", 30.0)];

    let before = {
        let service = start(config(&dir, cameras.clone()));
        service.align_cameras().unwrap();
        service.calibration().get(&CameraId::from("b")).unwrap()
    };

    let restarted = FusionService::new(config(&dir, cameras)).unwrap();
    let after = restarted.calibration().get(&CameraId::from("b")).unwrap();
    assert!(after.transform.approx_eq(&before.transform, 1e-3, 1e-3));
    assert_eq!(after.version, before.version);
}

#[test]
fn test_reset_cancels_running_alignment() {
    let dir = TempDir::new().unwrap();
    // no sources attached: alignment waits for frames that never come
    let service = Arc::new(FusionService::new(config(&dir, Vec::new())).unwrap());

    let aligning = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.align_cameras())
    };
    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    service.reset_calibration(None).unwrap();

    let result = aligning.join().unwrap();
    assert!(matches!(result, Err(FusionError::AlignmentCancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
    let status = service.fusion_status();
    assert!(status.calibrated_camera_ids.is_empty());
    assert!(status.alignment.is_none());
}

#[test]
fn test_recorded_frames_replay_through_fusion() {
    let dir = TempDir::new().unwrap();
    let scene = SyntheticScene::crop_bed();
    let intrinsics = SyntheticCamera::pinhole(64, 48, 48.0);

    let mut cameras = Vec::new();
    for (id, x) in [("a", 0.0), ("b", 25.0)] {
        let mut camera = SyntheticCamera::new(
            &scene,
            Vec3::new(x, 0.0, 1000.0),
            Vec3::new(x, 0.0, 0.0),
            intrinsics,
            30.0,
            FrameClock::simulated(),
        )
        .unwrap()
        .with_max_frames(4);
        let frames: Vec<_> = std::iter::from_fn(|| camera.next_frame().unwrap()).collect();
        let recording = dir.path().join("recordings").join(id);
        save_recording(&recording, &intrinsics, &frames).unwrap();
        cameras.push(CameraSourceConfig {
            id: CameraId::from(id),
            ignored: false,
            source: SourceKind::Playback {
                directory: recording,
                fps: 30.0,
                looping: false,
            },
        });
    }

    let config = config(&dir, cameras);
    let sources = open_sources(&config, FrameClock::simulated()).unwrap();
    let service = FusionService::new(config).unwrap();
    for source in sources {
        service.attach_source(source).unwrap();
    }

    // replay is unpaced, wait for both recordings to be fully queued
    let deadline = Instant::now() + Duration::from_secs(5);
    while ["a", "b"]
        .iter()
        .any(|id| service.queue().buffered(&CameraId::from(*id)) < 4)
    {
        assert!(Instant::now() < deadline, "recordings were not queued");
        std::thread::sleep(Duration::from_millis(5));
    }

    // both recordings end on the same frame time, so one set holds everything
    let set = service.queue().poll_synced_set(config_tolerance()).unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(set.max_spread(), 0.0);

    let summary = service.align_with_sets(std::slice::from_ref(&set)).unwrap();
    assert_eq!(summary.registered().count(), 1);

    let fused = service.fuse_set(&set).unwrap();
    assert_eq!(fused.provenance.contributing_camera_ids.len(), 2);
    assert!((fused.provenance.reference_timestamp - 4.0 / 30.0).abs() < 1e-9);
}

fn config_tolerance() -> f64 {
    FusionConfig::default().sync.tolerance_secs()
}
