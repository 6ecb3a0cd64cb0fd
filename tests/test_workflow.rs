mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::fs;

use common::TestEngine;
use soma_flow::ErrorKind;
use soma_flow::domain::transfer::transfer_action::TransferStatus;
use soma_flow::domain::workflow::status::{ExitStatus, JobStatus, WorkflowStatus};
use soma_flow::domain::workflow::workflow::Workflow;
use soma_flow::domain::workflow::workflow_node::{FileTransfer, Job, JobArg, SharedResourcePath, TransferRef};

const WAIT_SECS: i64 = 20;

#[tokio::test]
async fn test_echo_workflow_runs_in_dependency_order() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("echo"));
    let output = workflow.declare_transfer(FileTransfer::new(test.client_dir.path().join("out.txt")));
    let a = workflow.add_job(Job::new("A", ["echo", "hi"]).with_output(TransferRef::Node(output)));
    let b = workflow.add_job(Job::new("B", ["echo", "after"]));
    workflow.add_dependency(a, b);

    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let dependencies = submitted.full_dependencies.clone().unwrap();
    assert!(dependencies.contains(&(a, b)));
    assert!(dependencies.contains(&(a, output)));

    let a_id = submitted.job(a).unwrap().job_id.unwrap();
    let b_id = submitted.job(b).unwrap().job_id.unwrap();
    controller.wait(&[a_id, b_id], WAIT_SECS).await.unwrap();

    let a_exit = controller.exit_information(a_id).await.unwrap().unwrap();
    assert_eq!(a_exit.exit_status, ExitStatus::FinishedRegularly);
    assert_eq!(controller.job_status(b_id).await.unwrap(), JobStatus::Done);
    assert_eq!(test.scheduler.submitted(), vec!["A".to_string(), "B".to_string()]);

    let report = controller.workflow_status(submitted.id.unwrap()).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Done);
    assert_eq!(report.transfers.len(), 1);
    assert_eq!(report.transfers[0].status, TransferStatus::Complete);

    let stdout = test.client_dir.path().join("a.stdout");
    controller.retrieve_stdout(a_id, &stdout).await.unwrap();
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "hi\n");
}

#[tokio::test]
async fn test_failed_job_aborts_its_branch_and_restarts() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("failing"));
    let a = workflow.add_job(Job::new("A", ["sh", "-c", "exit 3"]));
    let b = workflow.add_job(Job::new("B", ["echo", "never"]));
    workflow.add_dependency(a, b);

    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let workflow_id = submitted.id.unwrap();
    let a_id = submitted.job(a).unwrap().job_id.unwrap();
    let b_id = submitted.job(b).unwrap().job_id.unwrap();
    controller.wait(&[a_id, b_id], WAIT_SECS).await.unwrap();

    assert_eq!(controller.exit_information(a_id).await.unwrap().unwrap().exit_value, Some(3));
    assert_eq!(controller.job_status(b_id).await.unwrap(), JobStatus::Failed);
    assert_eq!(controller.exit_information(b_id).await.unwrap().unwrap().exit_status, ExitStatus::ExitNotRun);
    assert_eq!(test.scheduler.submitted(), vec!["A".to_string()]);

    assert_eq!(controller.restart_workflow(workflow_id).await.unwrap(), 2);
    controller.wait(&[a_id, b_id], WAIT_SECS).await.unwrap();
    assert_eq!(test.scheduler.submitted(), vec!["A".to_string(), "A".to_string()]);
    assert_eq!(controller.workflow_status(workflow_id).await.unwrap().status, WorkflowStatus::Done);
}

#[tokio::test]
async fn test_job_waits_for_its_input_transfer() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let input_path = test.client_dir.path().join("in.txt");
    fs::write(&input_path, "payload\n").unwrap();

    let mut workflow = Workflow::new(Some("input"));
    let input = workflow.add_transfer(FileTransfer::new(&input_path));
    let reader = workflow.add_job(
        Job::new("reader", [JobArg::from("cat"), JobArg::from(TransferRef::Node(input))]).with_input(TransferRef::Node(input)),
    );

    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let job_id = submitted.job(reader).unwrap().job_id.unwrap();
    let transfer_id = submitted.transfer(input).unwrap().transfer_id.unwrap();

    controller.wait(&[job_id], 0).await.unwrap();
    assert_eq!(controller.job_status(job_id).await.unwrap(), JobStatus::NotSubmitted);
    let report = controller.workflow_status(submitted.id.unwrap()).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::NotStarted);

    controller.transfers().send(transfer_id).await.unwrap();
    controller.wait(&[job_id], WAIT_SECS).await.unwrap();
    assert_eq!(controller.job_status(job_id).await.unwrap(), JobStatus::Done);

    let stdout = test.client_dir.path().join("reader.stdout");
    controller.retrieve_stdout(job_id, &stdout).await.unwrap();
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "payload\n");
}

#[tokio::test]
async fn test_workflow_job_waits_for_registered_input() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let input_path = test.client_dir.path().join("registered.txt");
    fs::write(&input_path, "registered\n").unwrap();
    let info = controller.transfers().register(&input_path, 1, None).await.unwrap();

    let reference = TransferRef::Registered(info.id);
    let mut workflow = Workflow::new(Some("registered-input"));
    let reader = workflow.add_job(Job::new("reader", [JobArg::from("cat"), JobArg::from(reference)]).with_input(reference));
    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let job_id = submitted.job(reader).unwrap().job_id.unwrap();

    controller.wait(&[job_id], 0).await.unwrap();
    assert_eq!(controller.transfers().status(info.id).await.unwrap(), TransferStatus::Registered);
    assert_eq!(controller.job_status(job_id).await.unwrap(), JobStatus::NotSubmitted);
    assert!(test.scheduler.submitted().is_empty());

    controller.transfers().send(info.id).await.unwrap();
    controller.wait(&[job_id], WAIT_SECS).await.unwrap();
    assert_eq!(controller.job_status(job_id).await.unwrap(), JobStatus::Done);
    assert_eq!(test.scheduler.submitted(), vec!["reader".to_string()]);

    let stdout = test.client_dir.path().join("registered.stdout");
    controller.retrieve_stdout(job_id, &stdout).await.unwrap();
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "registered\n");
}

#[tokio::test]
async fn test_workflow_status_is_one_round_trip() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("wide"));
    for i in 0..20 {
        workflow.add_job(Job::new(format!("job-{i}"), ["true"]));
    }
    for i in 0..10 {
        workflow.add_transfer(FileTransfer::new(test.client_dir.path().join(format!("file-{i}.txt"))));
    }
    let workflow_id = controller.submit_workflow(workflow, None, None).await.unwrap().id.unwrap();

    let before = controller.proxy().requests_sent();
    let report = controller.workflow_status(workflow_id).await.unwrap();
    assert_eq!(controller.proxy().requests_sent() - before, 1);
    assert_eq!(report.jobs.len(), 20);
    assert_eq!(report.transfers.len(), 10);
}

#[tokio::test]
async fn test_cyclic_workflow_is_rejected() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("cycle"));
    let a = workflow.add_job(Job::new("A", ["true"]));
    let b = workflow.add_job(Job::new("B", ["true"]));
    workflow.add_dependency(a, b);
    workflow.add_dependency(b, a);

    let err = controller.submit_workflow(workflow, None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(controller.workflows().await.unwrap().is_empty());
    assert!(controller.jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_untranslated_shared_path_fails_submission() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let shared = SharedResourcePath::new("brainvisa", "0c3f", "subjects/s1.nii");
    let err = controller.submit_job(Job::new("shared", [JobArg::from("cat"), JobArg::from(shared)])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(controller.jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_referenced_transfer_outlives_its_disposal_request() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let source = test.client_dir.path().join("shared.txt");
    fs::write(&source, "shared").unwrap();
    let info = controller.transfers().register(&source, 1, None).await.unwrap();
    controller.transfers().send(info.id).await.unwrap();

    let reference = TransferRef::Registered(info.id);
    let job = Job::new("reader", [JobArg::from("cat"), JobArg::from(reference)]).with_input(reference);
    let job_id = controller.submit_job(job).await.unwrap();
    controller.wait(&[job_id], WAIT_SECS).await.unwrap();

    assert!(!controller.transfers().dispose(info.id).await.unwrap());
    assert_eq!(controller.transfers().status(info.id).await.unwrap(), TransferStatus::Cancelled);

    assert!(controller.dispose_job(job_id).await.unwrap());
    let err = controller.transfers().status(info.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_job_disposal_waits_for_stdout_retrieval() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let job_id = controller.submit_job(Job::new("talker", ["echo", "hello"])).await.unwrap();
    controller.wait(&[job_id], WAIT_SECS).await.unwrap();
    let stdout_id = controller.stdout_transfer(job_id).await.unwrap();

    // Another client started retrieving the output and has not finished.
    test.engine.transfers().initialize_retrieving(stdout_id).await.unwrap();
    assert!(!controller.dispose_job(job_id).await.unwrap());
    assert_eq!(controller.jobs().await.unwrap(), vec![job_id]);

    let stdout = test.client_dir.path().join("talker.stdout");
    controller.retrieve_stdout(job_id, &stdout).await.unwrap();
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "hello\n");

    test.engine.housekeeping(Utc::now()).await;
    assert!(controller.jobs().await.unwrap().is_empty());
    let err = controller.transfers().status(stdout_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_killed_job_reports_user_killed() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let job_id = controller.submit_job(Job::new("sleeper", ["sleep", "30"]).joining_stderrout()).await.unwrap();
    assert_eq!(controller.stderr_transfer(job_id).await.unwrap(), None);

    controller.kill_job(job_id).await.unwrap();
    controller.wait(&[job_id], WAIT_SECS).await.unwrap();

    assert_eq!(controller.job_status(job_id).await.unwrap(), JobStatus::Failed);
    assert_eq!(controller.exit_information(job_id).await.unwrap().unwrap().exit_status, ExitStatus::UserKilled);
}

#[tokio::test]
async fn test_stop_workflow_kills_and_skips() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("long"));
    let a = workflow.add_job(Job::new("A", ["sleep", "30"]));
    let b = workflow.add_job(Job::new("B", ["echo", "late"]));
    workflow.add_dependency(a, b);

    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let workflow_id = submitted.id.unwrap();
    let a_id = submitted.job(a).unwrap().job_id.unwrap();
    let b_id = submitted.job(b).unwrap().job_id.unwrap();

    let err = controller.restart_workflow(workflow_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    controller.stop_workflow(workflow_id).await.unwrap();
    controller.wait(&[a_id, b_id], WAIT_SECS).await.unwrap();

    assert_eq!(controller.exit_information(a_id).await.unwrap().unwrap().exit_status, ExitStatus::UserKilled);
    assert_eq!(controller.exit_information(b_id).await.unwrap().unwrap().exit_status, ExitStatus::ExitNotRun);
    assert_eq!(controller.workflow_status(workflow_id).await.unwrap().status, WorkflowStatus::Done);
}

#[tokio::test]
async fn test_expired_workflow_is_disposed_by_housekeeping() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("short-lived"));
    let input = workflow.add_transfer(FileTransfer::new(test.client_dir.path().join("never-sent.txt")));
    workflow.add_job(Job::new("consumer", ["true"]).with_input(TransferRef::Node(input)));
    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let workflow_id = submitted.id.unwrap();
    let transfer_id = submitted.transfer(input).unwrap().transfer_id.unwrap();

    let err = controller.change_workflow_expiration(workflow_id, Utc::now() - ChronoDuration::hours(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let extended = Utc::now() + ChronoDuration::days(10);
    controller.change_workflow_expiration(workflow_id, extended).await.unwrap();
    let summaries = controller.workflows().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].expiration_date, extended);
    assert_eq!(summaries[0].name.as_deref(), Some("short-lived"));

    test.engine.housekeeping(Utc::now() + ChronoDuration::days(5)).await;
    assert_eq!(controller.workflows().await.unwrap().len(), 1);

    test.engine.housekeeping(Utc::now() + ChronoDuration::days(11)).await;
    assert!(controller.workflows().await.unwrap().is_empty());
    assert!(controller.jobs().await.unwrap().is_empty());
    let err = controller.transfers().status(transfer_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_temporary_path_links_jobs_and_goes_with_workflow() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("scratch"));
    let scratch = workflow.declare_transfer(FileTransfer::temporary("scratch", false, ".txt"));
    let scratch_arg = JobArg::from(TransferRef::Node(scratch));
    let writer = workflow.add_job(
        Job::new("writer", [JobArg::from("sh"), JobArg::from("-c"), JobArg::from("echo scratch > \"$0\""), scratch_arg.clone()])
            .with_output(TransferRef::Node(scratch)),
    );
    let reader =
        workflow.add_job(Job::new("reader", [JobArg::from("cat"), scratch_arg]).with_input(TransferRef::Node(scratch)));
    workflow.add_dependency(writer, reader);

    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let scratch_id = submitted.transfer(scratch).unwrap().transfer_id.unwrap();
    let writer_id = submitted.job(writer).unwrap().job_id.unwrap();
    let reader_id = submitted.job(reader).unwrap().job_id.unwrap();

    let info = controller.transfers().information(scratch_id).await.unwrap();
    assert!(info.temporary);
    assert!(info.local_path.starts_with(test.staging.path()));
    assert!(info.local_path.to_string_lossy().ends_with(".txt"));

    controller.wait(&[writer_id, reader_id], WAIT_SECS).await.unwrap();
    assert_eq!(controller.job_status(reader_id).await.unwrap(), JobStatus::Done);
    let stdout = test.client_dir.path().join("reader.stdout");
    controller.retrieve_stdout(reader_id, &stdout).await.unwrap();
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "scratch\n");

    let err = controller.transfers().send(scratch_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = controller.transfers().retrieve_as(scratch_id, test.client_dir.path().join("copy.txt")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    controller.dispose_workflow(submitted.id.unwrap()).await.unwrap();
    assert!(!info.local_path.exists());
}

#[tokio::test]
async fn test_dispose_workflow_removes_every_node() {
    let test = TestEngine::start().await;
    let controller = test.controller();

    let mut workflow = Workflow::new(Some("disposable"));
    let output = workflow.declare_transfer(FileTransfer::new(test.client_dir.path().join("result.txt")));
    let job = workflow.add_job(Job::new("producer", ["true"]).with_output(TransferRef::Node(output)));
    let submitted = controller.submit_workflow(workflow, None, None).await.unwrap();
    let job_id = submitted.job(job).unwrap().job_id.unwrap();
    controller.wait(&[job_id], WAIT_SECS).await.unwrap();

    controller.dispose_workflow(submitted.id.unwrap()).await.unwrap();
    assert!(controller.workflows().await.unwrap().is_empty());
    assert!(controller.jobs().await.unwrap().is_empty());
    assert!(controller.registered_transfers().await.unwrap().is_empty());
}
