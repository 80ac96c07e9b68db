//! End-to-end print runs against the simulated SMC100 and light engine.

mod common;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use common::{exposure_settings, image_dir, sec_images, RecordingSurface};
use rust_sla::error::SlaError;
use rust_sla::hardware::mock::{MockSmc100, SimulatedLightEngine};
use rust_sla::logging::LogSink;
use rust_sla::print::{FrameSlot, LayerSettingsTable, RunOutcome, SyncEngine};
use tokio::sync::Mutex;

fn engine(mock: &MockSmc100, surface: &RecordingSurface) -> SyncEngine {
    SyncEngine::new(
        Arc::new(Mutex::new(mock.controller())),
        Box::new(surface.clone()),
        exposure_settings(),
    )
}

fn names(prefix: &str, counts: &[usize]) -> Vec<(String, usize)> {
    counts
        .iter()
        .enumerate()
        .map(|(i, &n)| (format!("{prefix}{}.PNG", i + 1), n))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_static_run_uses_initial_then_nominal_exposure() {
    let dir = sec_images(5);
    let mock = MockSmc100::with_move_latency(2);
    let surface = RecordingSurface::new();

    let report = engine(&mock, &surface).run_static(dir.path()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.images_total, 5);
    assert_eq!(
        report.layers.iter().map(|l| l.frames).collect::<Vec<_>>(),
        vec![3, 3, 5, 5, 5]
    );
    assert_eq!(surface.exposures(), names("SEC_", &[3, 3, 5, 5, 5]));

    // one clip-mode move per layer
    assert_eq!(report.stage_moves, 5);
    assert_eq!(mock.commands_with_code("PR").len(), 5);

    // dark time is honored before every swap
    for record in &report.layers[..4] {
        assert!(record.dark_duration.unwrap() >= Duration::from_millis(100));
        assert!(record.light_duration.is_some());
    }

    // double buffering alternates slots
    let slots: Vec<FrameSlot> = surface.loads().into_iter().map(|(_, slot)| slot).collect();
    assert_eq!(
        slots,
        vec![FrameSlot::A, FrameSlot::B, FrameSlot::A, FrameSlot::B, FrameSlot::A]
    );

    // shutdown: final position, home, close
    let commands = mock.commands();
    assert_eq!(commands[commands.len() - 2], "1TP?");
    assert_eq!(commands[commands.len() - 1], "1OR");
    assert!(mock.is_closed());
    assert!(surface.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_pumping_moves_surround_each_step() {
    let dir = sec_images(2);
    let mock = MockSmc100::with_move_latency(1);
    let surface = RecordingSurface::new();
    let mut settings = exposure_settings();
    settings.move_plan.clip_mode = false;

    let report = SyncEngine::new(
        Arc::new(Mutex::new(mock.controller())),
        Box::new(surface.clone()),
        settings,
    )
    .run_static(dir.path())
    .await
    .unwrap();

    assert_eq!(report.stage_moves, 2);
    assert_eq!(
        mock.commands_with_code("PR"),
        vec![
            "1PR-1.000000",
            "1PR0.050000",
            "1PR1.000000",
            "1PR-1.000000",
            "1PR0.050000",
            "1PR1.000000",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_third_layer_stops_moving_and_homes() {
    let dir = sec_images(5);
    let mock = MockSmc100::with_move_latency(2);
    let surface = RecordingSurface::new();
    let engine = engine(&mock, &surface);
    surface.abort_when_shown("SEC_3.PNG", engine.abort_flag());

    let report = engine.run_static(dir.path()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.layers.len(), 2);
    assert_eq!(report.stage_moves, 2);
    assert_eq!(mock.commands_with_code("PR").len(), 2);
    assert_eq!(surface.exposures(), names("SEC_", &[3, 3, 1]));

    assert_eq!(mock.commands().last().map(String::as_str), Some("1OR"));
    assert!(mock.is_closed());
    assert!(surface.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_dynamic_run_applies_groups_in_order() {
    let dir = sec_images(5);
    let mock = MockSmc100::with_move_latency(2);
    let surface = RecordingSurface::new();
    let light = SimulatedLightEngine::ready_after(0);
    let table = LayerSettingsTable::load(
        "layer,intensity,exposure_time,dark_time\n\
         1,10,5,100\n2,10,5,100\n3,10,5,100\n4,20,8,150\n5,20,8,150\n"
            .as_bytes(),
    )
    .unwrap();

    let report = engine(&mock, &surface)
        .with_light_engine(Box::new(light.clone()))
        .run_dynamic(dir.path(), &table)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(light.intensity_log(), vec![10, 20, 0]);
    assert_eq!(surface.exposures(), names("SEC_", &[5, 5, 5, 8, 8]));
    assert_eq!(
        report
            .layers
            .iter()
            .map(|l| (l.intensity, l.dark_time.as_millis()))
            .collect::<Vec<_>>(),
        vec![
            (Some(10), 100),
            (Some(10), 100),
            (Some(10), 100),
            (Some(20), 150),
            (Some(20), 150),
        ]
    );
    assert!(report.layers[3].dark_duration.unwrap() >= Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn test_dynamic_run_stops_when_settings_run_out() {
    let dir = sec_images(4);
    let mock = MockSmc100::new();
    let surface = RecordingSurface::new();
    let table =
        LayerSettingsTable::load("layer,i,e,d\n1,30,2,50\n2,30,2,50\n".as_bytes()).unwrap();

    let report = engine(&mock, &surface)
        .run_dynamic(dir.path(), &table)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.layers.len(), 2);
    assert_eq!(surface.exposures(), names("SEC_", &[2, 2]));
    assert!(mock.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_surface_close_ends_run() {
    let dir = sec_images(5);
    let mock = MockSmc100::new();
    let surface = RecordingSurface::new();
    surface.close_after_frames(4);

    let report = engine(&mock, &surface).run_static(dir.path()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::SurfaceClosed);
    assert_eq!(surface.frames().len(), 4);
    assert_eq!(mock.commands().last().map(String::as_str), Some("1OR"));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_stage_fails_run_after_shutdown() {
    let dir = sec_images(3);
    let mock = MockSmc100::with_move_latency(1);
    mock.freeze(true);
    let surface = RecordingSurface::new();

    let err = engine(&mock, &surface)
        .run_static(dir.path())
        .await
        .unwrap_err();

    assert!(matches!(err, SlaError::Timeout { .. }));
    // no second layer is exposed on a stage that never settled
    assert_eq!(surface.exposures(), names("SEC_", &[3]));
    assert_eq!(mock.commands().last().map(String::as_str), Some("1OR"));
    assert!(mock.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_directory_fails_without_moving() {
    let mock = MockSmc100::new();
    let surface = RecordingSurface::new();

    let err = engine(&mock, &surface)
        .run_static(std::path::Path::new("/nonexistent/slices"))
        .await
        .unwrap_err();

    assert!(matches!(err, SlaError::Filesystem { .. }));
    assert!(mock.commands().is_empty());
    assert!(surface.is_closed());
}

#[test]
fn test_out_of_range_settings_file_is_rejected_before_printing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.csv");
    std::fs::write(
        &path,
        "layer,intensity,exposure_time,dark_time\n1,10,5,100\n2,10,5,100\n3,300,5,100\n4,20,-4,-50\n",
    )
    .unwrap();

    let err = LayerSettingsTable::from_path(&path).unwrap_err();
    assert!(matches!(err, SlaError::SettingsParse { line: 4, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_operator_log_reports_progress() {
    let dir = image_dir(&["layer_1.png", "layer_2.png"]);
    let mock = MockSmc100::new();
    let surface = RecordingSurface::new();
    let messages = Arc::new(StdMutex::new(Vec::<String>::new()));
    let captured = Arc::clone(&messages);
    let sink: LogSink = Arc::new(move |message: &str| {
        captured.lock().unwrap().push(message.to_string());
    });

    engine(&mock, &surface)
        .with_log_sink(sink)
        .run_static(dir.path())
        .await
        .unwrap();

    let messages = messages.lock().unwrap();
    assert!(messages.iter().any(|m| m == "Displaying layer_1.png (layer 1)"));
    assert!(messages.iter().any(|m| m == "Displaying layer_2.png (layer 2)"));
    assert!(messages.iter().any(|m| m == "All images shown"));
    assert!(messages.iter().any(|m| m.starts_with("Final position:")));
}
