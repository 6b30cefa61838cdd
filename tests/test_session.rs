mod common;

use common::{init_logging, read_raster, write_raster};
use ndarray::Array2;
use pca4cd::{DetectionRange, MergeMethod, PcaOutcome, PcaSession};

fn two_date_rasters(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let before: Vec<Array2<f64>> = (0..2)
        .map(|b| Array2::from_shape_fn((6, 4), |(r, c)| (r * 4 + c) as f64 + b as f64 * 0.5 + 1.0))
        .collect();
    let after: Vec<Array2<f64>> = (0..2)
        .map(|b| {
            Array2::from_shape_fn((6, 4), |(r, c)| {
                let base = (r * 4 + c) as f64 + b as f64 * 0.5 + 1.0;
                // a changed patch in the lower right corner
                if r >= 4 && c >= 2 { base * 3.0 } else { base + ((r + c) % 3) as f64 * 0.1 }
            })
        })
        .collect();
    (
        write_raster(&dir.join("before.tif"), &before, None),
        write_raster(&dir.join("after.tif"), &after, None),
    )
}

#[test]
fn test_session_workflow() {
    init_logging();
    let data = tempfile::tempdir().expect("Failed to create temp dir");
    let (before, after) = two_date_rasters(data.path());

    let mut session = PcaSession::new().expect("Failed to create session");
    let workspace = session.workspace().to_path_buf();

    let mut params = session.params(&before, 2);
    params.second_raster = Some(after);
    params.worker_count = 2;
    params.build_pyramids = false;

    let outcome = session.run_pca(params).expect("PCA failed");
    assert!(outcome.is_completed());
    assert!(!session.is_busy());
    assert_eq!(session.components().len(), 2);
    assert!(session.stats().unwrap().eigenvalue_summary(1).starts_with("Eigenvalue: "));
    assert_ne!(session.stats().unwrap().eigenvalue_summary(1), "Eigenvalue: --");
    assert!(workspace.join("pc_1.tif").exists());

    for pc_id in 1..=2 {
        let component = read_raster(&workspace.join(format!("pc_{}.tif", pc_id)));
        let min = component.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = component.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        session
            .component_analysis(pc_id)
            .expect("Missing component")
            .set_range(DetectionRange::new(min, max).unwrap());
        let path = session.generate_detection(pc_id).expect("Detection failed");
        assert_eq!(path, session.detection_path(pc_id));
    }

    let merged = session
        .merge_detections(MergeMethod::Union, &workspace.join("union.tif"))
        .expect("Merge failed");
    assert!(read_raster(&merged).iter().all(|&v| v == 0.0 || v == 1.0));

    session.close().expect("Failed to close session");
    assert!(!workspace.exists());
}

#[test]
fn test_spawned_run_reports_on_channel() {
    init_logging();
    let data = tempfile::tempdir().expect("Failed to create temp dir");
    let (before, _) = two_date_rasters(data.path());

    let session = PcaSession::new().expect("Failed to create session");
    let mut params = session.params(&before, 1);
    params.build_pyramids = false;

    let rx = session.spawn_run(params.clone()).expect("Failed to spawn run");
    let outcome = rx.recv().expect("No result received").expect("PCA failed");
    match outcome {
        PcaOutcome::Completed { component_paths, .. } => {
            assert_eq!(component_paths, vec![session.workspace().join("pc_1.tif")]);
        }
        PcaOutcome::NoValidData => panic!("Expected components"),
    }

    // The flag is released once the result has been produced
    let rx = session.spawn_run(params).expect("Session stayed busy");
    assert!(rx.recv().expect("No result received").is_ok());
}
