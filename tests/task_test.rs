//! Tests for async task continuations posted from background workers.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{RecordingHost, Value, engine_of, run_in_local, test_config, test_runtime};
use panel_script_runtime::{ContainerStatus, ScriptContainer};

#[tokio::test(flavor = "current_thread")]
async fn test_task_continuation_runs_on_script_thread() {
    run_in_local(|| async {
        let (runtime, _clock) = test_runtime(test_config(1 << 20, 1 << 16));
        let container = ScriptContainer::new(runtime.clone(), RecordingHost::new());
        assert!(container.initialize());

        let received: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        engine_of(&runtime).add_hook("record", move |args| {
            sink.borrow_mut().extend_from_slice(args);
            None
        });
        container.execute_script("fn on_art_loaded calls record");

        let task = container
            .spawn_task("on_art_loaded", Value::Text("track-7".into()))
            .unwrap();
        assert_eq!(container.pending_task_count(), 1);
        assert_eq!(runtime.registry().len(), 1);
        assert!(container.heap_usage() >= 7);

        let poster = container.task_poster();
        let posted = tokio::task::spawn_blocking(move || {
            poster.complete(task, vec![Value::Bytes(bytes::Bytes::from_static(b"\x89PNG"))])
        })
        .await
        .unwrap();
        assert!(posted);

        // Nothing runs until the script thread drains the mailbox
        assert!(received.borrow().is_empty());
        container.run_pending_jobs();

        assert_eq!(
            *received.borrow(),
            vec![
                Value::Text("track-7".into()),
                Value::Bytes(bytes::Bytes::from_static(b"\x89PNG")),
            ]
        );
        assert_eq!(container.pending_task_count(), 0);
        assert!(runtime.registry().is_empty());
        assert_eq!(container.heap_usage(), 0);
        assert_eq!(engine_of(&runtime).jobs_run(), 1);
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_finalize_cancels_pending_tasks() {
    run_in_local(|| async {
        let (runtime, _clock) = test_runtime(test_config(1 << 20, 1 << 16));
        let container = ScriptContainer::new(runtime.clone(), RecordingHost::new());
        container.initialize();
        container.execute_script("fn done = 1");

        let task = container.spawn_task("done", Value::Int(1)).unwrap();
        let poster = container.task_poster();

        container.finalize();
        assert_eq!(container.pending_task_count(), 0);
        assert!(runtime.registry().is_empty());
        assert_eq!(runtime.registry().user_count(), 0);

        // A late result for a cancelled task is dropped
        tokio::spawn(async move { poster.complete(task, vec![]) })
            .await
            .unwrap();

        assert!(container.initialize());
        container.run_pending_jobs();
        assert_eq!(container.status(), ContainerStatus::Working);
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_abandoned_task_releases_context() {
    let (runtime, _clock) = test_runtime(test_config(1 << 20, 1 << 16));
    let container = ScriptContainer::new(runtime.clone(), RecordingHost::new());
    container.initialize();

    let task = container.spawn_task("never", Value::Int(5)).unwrap();
    assert!(container.task_poster().abandon(task));
    container.run_pending_jobs();

    assert_eq!(container.pending_task_count(), 0);
    assert!(runtime.registry().is_empty());
    assert_eq!(container.status(), ContainerStatus::Working);
}

#[tokio::test(flavor = "current_thread")]
async fn test_poster_reports_closed_container() {
    let (runtime, _clock) = test_runtime(test_config(1 << 20, 1 << 16));
    let container = ScriptContainer::new(runtime.clone(), RecordingHost::new());
    container.initialize();
    let poster = container.task_poster();

    drop(container);

    assert!(poster.is_closed());
    assert!(!poster.complete(1, vec![Value::Undefined]));
}

#[test]
fn test_spawn_task_requires_working_container() {
    let (runtime, _clock) = test_runtime(test_config(1 << 20, 1 << 16));
    let container = ScriptContainer::new(runtime, RecordingHost::new());

    assert_eq!(container.spawn_task("cb", Value::Undefined), None);
}
