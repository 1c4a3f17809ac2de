//! End-to-end tests: metadata log and data directory in, work set and batch
//! report out, with a fake runner standing in for the external programs.

use capture_batch::naming::replace_extension;
use capture_batch::{
    Batch, BatchMode, BatchRequest, Config, ExecContext, Job, JobRunner, JobStatus, JobTask,
    RunError,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const HEADER: &str = "File,Description,frames,Dark Correction ,data analysis,Injector distance\n";

/// Writes the output file the real converter would produce.
struct FakeConverter {
    fail: Option<&'static str>,
}

impl JobRunner for FakeConverter {
    fn run(&self, job: &Job, _ctx: &ExecContext) -> Result<(), RunError> {
        if self.fail == Some(job.file_name.as_str()) {
            return Err(RunError::Failed {
                program: "cxd2cxi".into(),
                code: 1,
                stderr: format!("Traceback: cannot decode {}", job.file_name),
            });
        }
        fs::write(&job.output_path, b"\x89HDF\r\n\x1a\nconverted")?;
        Ok(())
    }
}

fn write_dir(root: &Path, log_rows: &str, files: &[&str]) {
    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("log.csv"), format!("{}{}", HEADER, log_rows)).unwrap();
    for name in files {
        fs::write(root.join("data").join(name), b"raw frames").unwrap();
    }
}

fn convert_batch(root: &Path) -> Batch {
    let mut request = BatchRequest::new(BatchMode::Convert, root.join("data"), root.join("log.csv"));
    request.flatfield = Some("_flatfield01624.cxd".into());
    let mut config = Config::default();
    config.dispatch.workers = 2;
    Batch::new(config, request)
}

#[test]
fn test_sample_with_background_reference() {
    let temp = TempDir::new().unwrap();
    write_dir(
        temp.path(),
        "data00001.cxd,sample,300,00002,,\n\
         data00002.cxd,background,50,,,\n",
        &["_flatfield01624.cxd", "data00001.cxd", "data00002.cxd"],
    );

    let plan = convert_batch(temp.path()).plan().unwrap();

    assert_eq!(plan.work_set.len(), 1);
    let job = &plan.work_set.jobs[0];
    assert_eq!(job.file_name, "data00001.cxd");
    let background = job.background().unwrap();
    assert_eq!(background.path, temp.path().join("data/data00002.cxd"));
    assert_eq!(background.frame_budget, 50);
    assert!(plan.work_set.unresolved.is_empty());
    assert!(plan
        .work_set
        .jobs
        .iter()
        .all(|j| j.file_name != "data00002.cxd"));
}

#[tokio::test]
async fn test_second_run_has_nothing_to_do() {
    let temp = TempDir::new().unwrap();
    write_dir(
        temp.path(),
        "data00001.cxd,sample,300,2,,\n\
         data00002.cxd,background,50,,,\n\
         data00003.cxd,sample,300,2.0,,\n",
        &["_flatfield01624.cxd", "data00001.cxd", "data00002.cxd", "data00003.cxd"],
    );
    let batch = convert_batch(temp.path());

    let report = batch.run(Arc::new(FakeConverter { fail: None })).await.unwrap();
    assert_eq!(report.succeeded, 2);
    for name in ["data00001.cxd", "data00003.cxd"] {
        assert!(temp
            .path()
            .join("data")
            .join(replace_extension(name, "cxi"))
            .exists());
    }

    let second = batch.plan().unwrap();
    assert!(second.work_set.is_empty());
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_batch() {
    let temp = TempDir::new().unwrap();
    write_dir(
        temp.path(),
        "data00001.cxd,sample,300,9,,\n\
         data00002.cxd,sample,300,9,,\n\
         data00003.cxd,sample,300,9,,\n\
         data00009.cxd,background,20,,,\n",
        &[
            "_flatfield01624.cxd",
            "data00001.cxd",
            "data00002.cxd",
            "data00003.cxd",
            "data00009.cxd",
        ],
    );

    let report = convert_batch(temp.path())
        .run(Arc::new(FakeConverter {
            fail: Some("data00002.cxd"),
        }))
        .await
        .unwrap();

    assert_eq!((report.succeeded, report.failed, report.skipped), (2, 1, 0));
    assert_eq!(report.status_of("data00001.cxd"), Some(JobStatus::Succeeded));
    assert_eq!(report.status_of("data00002.cxd"), Some(JobStatus::Failed));
    assert_eq!(report.status_of("data00003.cxd"), Some(JobStatus::Succeeded));
    assert!(report.any_failed());
}

#[tokio::test]
async fn test_failed_conversion_is_retried_next_run() {
    /// Leaves a truncated artifact behind, then fails.
    struct CrashingConverter;
    impl JobRunner for CrashingConverter {
        fn run(&self, job: &Job, _ctx: &ExecContext) -> Result<(), RunError> {
            fs::write(&job.output_path, b"\x89HDF\r\n\x1a\ntrunc")?;
            Err(RunError::Failed {
                program: "cxd2cxi".into(),
                code: 1,
                stderr: "Traceback: out of memory".into(),
            })
        }
    }

    let temp = TempDir::new().unwrap();
    write_dir(
        temp.path(),
        "data00001.cxd,sample,300,2,,\n\
         data00002.cxd,background,50,,,\n",
        &["_flatfield01624.cxd", "data00001.cxd", "data00002.cxd"],
    );
    let batch = convert_batch(temp.path());

    let report = batch.run(Arc::new(CrashingConverter)).await.unwrap();
    assert_eq!((report.succeeded, report.failed, report.skipped), (0, 1, 0));
    assert!(!temp.path().join("data/data00001.cxi").exists());

    let second = batch.plan().unwrap();
    let names: Vec<&str> = second
        .work_set
        .jobs
        .iter()
        .map(|j| j.file_name.as_str())
        .collect();
    assert_eq!(names, vec!["data00001.cxd"]);
}

#[tokio::test]
async fn test_unresolved_candidates_are_reported() {
    let temp = TempDir::new().unwrap();
    write_dir(
        temp.path(),
        "data00001.cxd,sample,300,2,,\n\
         data00002.cxd,background,50,,,\n\
         data00004.cxd,sample,300,77,,\n",
        &[
            "_flatfield01624.cxd",
            "data00001.cxd",
            "data00002.cxd",
            "data00004.cxd",
            "data00005.cxd",
        ],
    );

    let report = convert_batch(temp.path())
        .run(Arc::new(FakeConverter { fail: None }))
        .await
        .unwrap();

    assert_eq!(report.total_jobs, 1);
    assert_eq!(report.succeeded, 1);
    let unresolved: Vec<&str> = report
        .unresolved
        .iter()
        .map(|u| u.file_name.as_str())
        .collect();
    assert_eq!(unresolved, vec!["data00004.cxd", "data00005.cxd"]);
}

#[tokio::test]
async fn test_analysis_batch_writes_snapshots() {
    /// Writes the snapshot and a stand-in artifact.
    struct FakeAnalyzer;
    impl JobRunner for FakeAnalyzer {
        fn run(&self, job: &Job, _ctx: &ExecContext) -> Result<(), RunError> {
            let JobTask::Analyze(task) = &job.task else {
                return Err(RunError::Cancelled);
            };
            capture_batch::output::write_config_snapshot(job, task)?;
            fs::write(&job.output_path, b"\x89HDF\r\n\x1a\nanalysis")?;
            Ok(())
        }
    }

    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("data")).unwrap();
    fs::write(
        temp.path().join("log.csv"),
        format!("{}data00001.cxd,sample,1200,,,3.5\n", HEADER),
    )
    .unwrap();
    fs::write(temp.path().join("data/data00001.cxi"), b"\x89HDF\r\n\x1a\nframes").unwrap();

    let save_dir = temp.path().join("out");
    let mut request = BatchRequest::new(
        BatchMode::Analyze,
        temp.path().join("data"),
        temp.path().join("log.csv"),
    );
    request.save_dir = Some(save_dir.clone());
    let batch = Batch::new(Config::default(), request);

    let report = batch.run(Arc::new(FakeAnalyzer)).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(save_dir.join("data00001_ana_w05.cxi").exists());

    let snapshot: toml::Table =
        toml::from_str(&fs::read_to_string(save_dir.join("conf/data00001_ana_w05.toml")).unwrap())
            .unwrap();
    assert_eq!(snapshot["general"]["n_images"].as_integer(), Some(1200));

    // Outputs live outside the data directory, so the rerun is skipped per job.
    let rerun = batch.run(Arc::new(FakeAnalyzer)).await.unwrap();
    assert_eq!((rerun.succeeded, rerun.skipped), (0, 1));
}
