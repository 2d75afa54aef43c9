//! Cancellation, shared-job lifetimes, error surfacing, and pipeline
//! invalidation.

mod support;

use std::sync::Arc;

use lumina::{
    ImagePipeline, ImagePipelineError, ImageRequest, Priority, TaskEvent, TaskState,
};
use support::*;

#[tokio::test]
async fn cancelling_the_only_task_tears_down_the_chain() {
    let loader = ScriptedLoader::new();
    let _feed = loader.push_channel();
    let pipeline = basic_pipeline(&loader);
    let request = ImageRequest::new(url("https://example.com/slow.jpg"));

    let task = pipeline.load_image(request.clone());
    let events = task.events();
    assert_eq!(loader.calls(), 1);

    task.cancel();
    assert_eq!(task.state(), TaskState::Cancelled);
    let error = task.await_response().await.expect_err("cancelled");
    assert!(matches!(error, ImagePipelineError::Cancelled));

    let collected = collect_events(events).await;
    assert!(matches!(collected.last(), Some(TaskEvent::Cancelled)));

    // The shared job died with its last subscriber: an identical request
    // needs a fresh download.
    loader.push_immediate(vec![Ok(chunk(b"fresh"))]);
    let retry = pipeline.load_image(request);
    retry.await_response().await.expect("retry succeeds");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn cancelling_one_of_many_subscribers_keeps_the_job_alive() {
    let loader = ScriptedLoader::new();
    let feed = loader.push_channel();
    let pipeline = basic_pipeline(&loader);
    let request = ImageRequest::new(url("https://example.com/shared.jpg"));

    let first = pipeline.load_image(request.clone());
    let second = pipeline.load_image(request);
    let _first_events = first.events();
    let _second_events = second.events();
    assert_eq!(loader.calls(), 1, "identical requests share one job");

    first.cancel();

    feed.send(Ok(chunk(b"still-running"))).expect("job alive");
    drop(feed);

    second
        .await_response()
        .await
        .expect("survivor still completes");
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let loader = ScriptedLoader::new();
    let _feed = loader.push_channel();
    let pipeline = basic_pipeline(&loader);

    let task = pipeline.load_image(ImageRequest::new(url("https://example.com/twice.jpg")));
    let events = task.events();

    task.cancel();
    task.cancel();

    let collected = collect_events(events).await;
    let cancellations = collected
        .iter()
        .filter(|event| matches!(event, TaskEvent::Cancelled))
        .count();
    assert_eq!(cancellations, 1, "exactly one terminal event");

    // A late subscriber sees just the terminal event.
    let late = collect_events(task.events()).await;
    assert!(matches!(late.as_slice(), [TaskEvent::Cancelled]));
}

#[tokio::test]
async fn set_priority_after_completion_is_a_no_op() {
    let loader = ScriptedLoader::new();
    loader.push_immediate(vec![Ok(chunk(b"quick"))]);
    let pipeline = basic_pipeline(&loader);

    let task = pipeline.load_image(ImageRequest::new(url("https://example.com/quick.jpg")));
    task.await_response().await.expect("load succeeds");

    let before = task.current_priority();
    task.set_priority(Priority::VeryHigh);
    assert_eq!(task.current_priority(), before);
}

#[tokio::test]
async fn repeated_set_priority_matches_single_call() {
    let loader = ScriptedLoader::new();
    let feed = loader.push_channel();
    let pipeline = basic_pipeline(&loader);

    let task = pipeline.load_image(ImageRequest::new(url("https://example.com/prio.jpg")));
    let _events = task.events();

    task.set_priority(Priority::High);
    task.set_priority(Priority::High);
    assert_eq!(task.current_priority(), Priority::High);

    feed.send(Ok(chunk(b"data"))).expect("pump alive");
    drop(feed);
    task.await_response().await.expect("load succeeds");
}

#[tokio::test]
async fn dropping_a_running_task_cancels_it() {
    let loader = ScriptedLoader::new();
    let _feed = loader.push_channel();
    let pipeline = basic_pipeline(&loader);
    let request = ImageRequest::new(url("https://example.com/dropped.jpg"));

    {
        let task = pipeline.load_image(request.clone());
        let _ = task.events();
        assert_eq!(loader.calls(), 1);
    }

    // The dropped task released its subscription; a new load re-fetches.
    loader.push_immediate(vec![Ok(chunk(b"second"))]);
    let retry = pipeline.load_image(request);
    retry.await_response().await.expect("retry succeeds");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn invalidation_fails_running_and_future_tasks() {
    let loader = ScriptedLoader::new();
    let _feed = loader.push_channel();
    let pipeline = basic_pipeline(&loader);

    let running = pipeline.load_image(ImageRequest::new(url("https://example.com/inflight.jpg")));
    let events = running.events();

    pipeline.invalidate();

    let error = running.await_response().await.expect_err("invalidated");
    assert!(matches!(error, ImagePipelineError::PipelineInvalidated));
    let collected = collect_events(events).await;
    assert!(matches!(
        collected.last(),
        Some(TaskEvent::Finished(Err(ImagePipelineError::PipelineInvalidated)))
    ));

    let late = pipeline.load_image(ImageRequest::new(url("https://example.com/late.jpg")));
    let error = late.await_response().await.expect_err("refused");
    assert!(matches!(error, ImagePipelineError::PipelineInvalidated));
    assert_eq!(loader.calls(), 1, "no loads after invalidation");
}

#[tokio::test]
async fn missing_decoder_fails_terminal_decodes() {
    let loader = ScriptedLoader::new();
    loader.push_immediate(vec![Ok(chunk(b"mystery-bytes"))]);
    // Default registry has no decoders at all.
    let pipeline = ImagePipeline::builder(test_config())
        .data_loader(loader.clone())
        .build();

    let task = pipeline.load_image(ImageRequest::new(url("https://example.com/unknown.bin")));
    let error = task.await_response().await.expect_err("no decoder");
    assert!(matches!(error, ImagePipelineError::DecoderNotRegistered));
}

#[tokio::test]
async fn decoder_failure_names_the_decoder() {
    let loader = ScriptedLoader::new();
    loader.push_immediate(vec![Ok(chunk(b"corrupt"))]);
    let pipeline = ImagePipeline::builder(test_config())
        .data_loader(loader.clone())
        .decoders(TestDecoders::failing())
        .build();

    let task = pipeline.load_image(ImageRequest::new(url("https://example.com/corrupt.jpg")));
    let error = task.await_response().await.expect_err("decode fails");
    match error {
        ImagePipelineError::DecodingFailed { decoder, .. } => {
            assert_eq!(decoder, "test-decoder");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn processor_failure_names_the_processor() {
    let loader = ScriptedLoader::new();
    loader.push_immediate(vec![Ok(chunk(b"fine-bytes"))]);
    let pipeline = basic_pipeline(&loader);

    let request = ImageRequest::new(url("https://example.com/processed.jpg")).with_processors(
        vec![Arc::new(FailingProcessor {
            id: "broken-filter".into(),
        })],
    );
    let task = pipeline.load_image(request);
    let error = task.await_response().await.expect_err("processing fails");
    match error {
        ImagePipelineError::ProcessingFailed { processor, .. } => {
            assert_eq!(processor, "broken-filter");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn coalescing_can_be_disabled() {
    let loader = ScriptedLoader::new();
    let feed_a = loader.push_channel();
    let feed_b = loader.push_channel();
    let mut config = test_config();
    config.is_task_coalescing_enabled = false;
    let pipeline = ImagePipeline::builder(config)
        .data_loader(loader.clone())
        .decoders(TestDecoders::new())
        .build();
    let request = ImageRequest::new(url("https://example.com/uncoalesced.jpg"));

    let first = pipeline.load_image(request.clone());
    let second = pipeline.load_image(request);
    let _ = first.events();
    let _ = second.events();
    assert_eq!(loader.calls(), 2, "every task gets a private download");

    for feed in [feed_a, feed_b] {
        feed.send(Ok(chunk(b"bytes"))).expect("pump alive");
        drop(feed);
    }
    first.await_response().await.expect("first completes");
    second.await_response().await.expect("second completes");
}

#[tokio::test]
async fn await_response_is_idempotent() {
    let loader = ScriptedLoader::new();
    loader.push_immediate(vec![Ok(chunk(b"kept"))]);
    let pipeline = basic_pipeline(&loader);

    let task = pipeline.load_image(ImageRequest::new(url("https://example.com/kept.jpg")));
    let first = task.await_response().await.expect("load succeeds");
    let second = task.await_response().await.expect("result retained");
    assert_eq!(first.image().width(), second.image().width());
    assert_eq!(task.state(), TaskState::Completed);
}
