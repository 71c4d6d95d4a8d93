use core::time::Duration;
use netflow::{
    model::{Notification, ObjectRef},
    pool::WorkerPool,
    processor::{Handler, MessageState, Processor, ProcessorConfig},
    storage::{BlobStore, MemoryQueue, MemoryStore, Queue},
    Error,
};
use std::sync::{Arc, Mutex};

const QUEUE: &str = "inbox";
const BUCKET: &str = "raw";

fn notification(bucket: &str, key: &str) -> String {
    records(bucket, &[key])
}

fn records(bucket: &str, keys: &[&str]) -> String {
    let records: Vec<_> = keys
        .iter()
        .map(|key| serde_json::json!({ "s3": { "bucket": { "name": bucket }, "object": { "key": key } } }))
        .collect();
    serde_json::json!({ "Records": records }).to_string()
}

/// Records what it saw and fails on bodies starting with `fail`.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Handler for Recorder {
    async fn handle(&self, object: ObjectRef, body: Vec<u8>) -> netflow::Result<Vec<ObjectRef>> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if body.starts_with(b"fail") {
            return Err(Error::Parse(format!("cannot handle {object}")));
        }
        self.seen.lock().unwrap().push((object.key.clone(), body));
        Ok(vec![ObjectRef { bucket: "out".into(), key: format!("{}.out", object.key) }])
    }
}

fn config(concurrency: usize) -> ProcessorConfig {
    ProcessorConfig {
        queue: QUEUE.into(),
        max_messages: 10,
        wait: Duration::from_millis(50),
        concurrency,
        next_queue: None,
    }
}

type Harness = (Arc<MemoryQueue>, Arc<MemoryStore>, Arc<Recorder>, Processor<MemoryQueue, MemoryStore, Recorder>);

fn setup(concurrency: usize) -> Harness {
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(Recorder::default());
    let processor = Processor::new(queue.clone(), store.clone(), handler.clone(), config(concurrency));
    (queue, store, handler, processor)
}

#[tokio::test]
async fn one_failure_leaves_only_its_message() -> anyhow::Result<()> {
    let (queue, store, handler, processor) = setup(2);
    store.put(BUCKET, "one.csv", b"first".to_vec()).await?;
    store.put(BUCKET, "two.csv", b"fail here".to_vec()).await?;
    store.put(BUCKET, "three.csv", b"third".to_vec()).await?;
    for key in ["one.csv", "two.csv", "three.csv"] {
        queue.send(QUEUE, notification(BUCKET, key)).await?;
    }

    let pool = WorkerPool::new(2);
    let report = processor.poll_once(&pool).await?;
    pool.shutdown().await;

    let states: Vec<_> = report.outcomes.iter().map(|outcome| outcome.state).collect();
    assert_eq!(states, [MessageState::Acknowledged, MessageState::LeftForRedelivery, MessageState::Acknowledged]);
    assert_eq!(report.count(MessageState::Acknowledged), 2);

    // only the failed message is still queued, hidden until its visibility timeout lapses
    assert_eq!(queue.len(QUEUE).await, 1);
    assert!(queue.receive(QUEUE, 10, Duration::ZERO).await?.is_empty());

    let mut seen: Vec<_> = handler.seen.lock().unwrap().iter().map(|(key, _)| key.clone()).collect();
    seen.sort();
    assert_eq!(seen, ["one.csv", "three.csv"]);
    Ok(())
}

#[tokio::test]
async fn unusable_messages() -> anyhow::Result<()> {
    let (queue, store, handler, processor) = setup(3);
    store.put(BUCKET, "present.csv", b"data".to_vec()).await?;

    queue.send(QUEUE, r#"{"Event":"s3:TestEvent"}"#.into()).await?;
    queue.send(QUEUE, "definitely not json".into()).await?;
    queue.send(QUEUE, notification(BUCKET, "absent.csv")).await?;
    queue.send(QUEUE, r#"{"Records":[]}"#.into()).await?;
    queue.send(QUEUE, notification(BUCKET, "present.csv")).await?;

    let pool = WorkerPool::new(3);
    let report = processor.poll_once(&pool).await?;
    pool.shutdown().await;

    let states: Vec<_> = report.outcomes.iter().map(|outcome| outcome.state).collect();
    assert_eq!(
        states,
        [
            MessageState::Acknowledged,      // test event
            MessageState::LeftForRedelivery, // malformed body
            MessageState::LeftForRedelivery, // missing object
            MessageState::LeftForRedelivery, // no records
            MessageState::Acknowledged,
        ]
    );
    assert_eq!(queue.len(QUEUE).await, 3);
    assert_eq!(handler.seen.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn keys_are_decoded_before_download() -> anyhow::Result<()> {
    let (queue, store, handler, processor) = setup(1);
    store.put(BUCKET, "day one/capture 1.csv", b"data".to_vec()).await?;
    queue.send(QUEUE, notification(BUCKET, "day+one%2Fcapture+1.csv")).await?;

    // wrapped in a notification topic envelope
    let inner = notification(BUCKET, "day+one%2Fcapture+1.csv");
    queue.send(QUEUE, serde_json::json!({ "Type": "Notification", "Message": inner }).to_string()).await?;

    let pool = WorkerPool::new(1);
    let report = processor.poll_once(&pool).await?;
    pool.shutdown().await;

    assert_eq!(report.count(MessageState::Acknowledged), 2);
    let seen = handler.seen.lock().unwrap();
    assert!(seen.iter().all(|(key, body)| key == "day one/capture 1.csv" && body == b"data"));
    Ok(())
}

#[tokio::test]
async fn every_record_of_a_message_is_handled() -> anyhow::Result<()> {
    let (queue, store, handler, processor) = setup(2);
    store.put(BUCKET, "a.csv", b"first".to_vec()).await?;
    store.put(BUCKET, "b.csv", b"second".to_vec()).await?;
    queue.send(QUEUE, records(BUCKET, &["a.csv", "b.csv"])).await?;

    let pool = WorkerPool::new(2);
    let report = processor.poll_once(&pool).await?;
    pool.shutdown().await;

    let states: Vec<_> = report.outcomes.iter().map(|outcome| outcome.state).collect();
    assert_eq!(states, [MessageState::Acknowledged]);
    assert_eq!(queue.len(QUEUE).await, 0);

    let mut seen: Vec<_> = handler.seen.lock().unwrap().iter().map(|(key, _)| key.clone()).collect();
    seen.sort();
    assert_eq!(seen, ["a.csv", "b.csv"]);
    Ok(())
}

#[tokio::test]
async fn one_bad_record_holds_back_its_whole_message() -> anyhow::Result<()> {
    let (queue, store, handler, processor) = setup(2);
    store.put(BUCKET, "a.csv", b"first".to_vec()).await?;
    store.put(BUCKET, "b.csv", b"fail here".to_vec()).await?;
    store.put(BUCKET, "c.csv", b"third".to_vec()).await?;
    queue.send(QUEUE, records(BUCKET, &["a.csv", "b.csv"])).await?;
    queue.send(QUEUE, records(BUCKET, &["c.csv", "absent.csv"])).await?;
    queue.send(QUEUE, records(BUCKET, &["c.csv"])).await?;

    let pool = WorkerPool::new(2);
    let report = processor.poll_once(&pool).await?;
    pool.shutdown().await;

    let states: Vec<_> = report.outcomes.iter().map(|outcome| outcome.state).collect();
    assert_eq!(
        states,
        [
            MessageState::LeftForRedelivery, // handler failed on b.csv
            MessageState::LeftForRedelivery, // absent.csv is missing
            MessageState::Acknowledged,
        ]
    );
    assert_eq!(queue.len(QUEUE).await, 2);

    // c.csv of the second message is never handled once its sibling is missing
    let mut seen: Vec<_> = handler.seen.lock().unwrap().iter().map(|(key, _)| key.clone()).collect();
    seen.sort();
    assert_eq!(seen, ["a.csv", "c.csv"]);
    Ok(())
}

#[tokio::test]
async fn outputs_are_announced_on_the_next_queue() -> anyhow::Result<()> {
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(Recorder::default());
    let chained = ProcessorConfig { next_queue: Some("next".into()), ..config(2) };
    let processor = Processor::new(queue.clone(), store.clone(), handler.clone(), chained);

    store.put(BUCKET, "a.csv", b"first".to_vec()).await?;
    store.put(BUCKET, "b.csv", b"fail here".to_vec()).await?;
    queue.send(QUEUE, notification(BUCKET, "a.csv")).await?;
    queue.send(QUEUE, notification(BUCKET, "b.csv")).await?;

    let pool = WorkerPool::new(2);
    let report = processor.poll_once(&pool).await?;
    pool.shutdown().await;
    assert_eq!(report.count(MessageState::Acknowledged), 1);

    let announced = queue.receive("next", 10, Duration::ZERO).await?;
    assert_eq!(announced.len(), 1);
    let expected = Notification::Objects(vec![ObjectRef { bucket: "out".into(), key: "a.csv.out".into() }]);
    assert_eq!(Notification::parse(&announced[0].body)?, expected);
    Ok(())
}

#[tokio::test]
async fn run_until_stopped() -> anyhow::Result<()> {
    let (queue, store, handler, processor) = setup(4);
    for i in 0..25 {
        let key = format!("file-{i:02}.csv");
        store.put(BUCKET, &key, key.clone().into_bytes()).await?;
        queue.send(QUEUE, notification(BUCKET, &key)).await?;
    }

    processor.run(tokio::time::sleep(Duration::from_millis(500))).await;

    assert_eq!(queue.len(QUEUE).await, 0);
    assert_eq!(handler.seen.lock().unwrap().len(), 25);
    Ok(())
}

#[tokio::test]
async fn redelivered_after_visibility_timeout() -> anyhow::Result<()> {
    let queue = MemoryQueue::new(Duration::from_millis(50));
    queue.send(QUEUE, "hello".into()).await?;

    let first = queue.receive(QUEUE, 10, Duration::ZERO).await?;
    assert_eq!(first.len(), 1);
    assert!(queue.receive(QUEUE, 10, Duration::ZERO).await?.is_empty());

    let second = queue.receive(QUEUE, 10, Duration::from_millis(500)).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].body, "hello");
    assert_ne!(first[0].receipt, second[0].receipt);

    // the stale receipt no longer acknowledges anything
    queue.ack(QUEUE, &first[0].receipt).await?;
    assert_eq!(queue.len(QUEUE).await, 1);
    queue.ack(QUEUE, &second[0].receipt).await?;
    assert_eq!(queue.len(QUEUE).await, 0);
    Ok(())
}

#[tokio::test]
async fn pool_runs_jobs_and_survives_panics() {
    let pool = WorkerPool::new(2);
    assert_eq!(pool.size(), 2);

    let tickets = [pool.submit(async { 1 }).await, pool.submit(async { 2 }).await];
    let crashed = pool.submit(async { panic!("job exploded"); }).await;
    let after = pool.submit(async { 3 }).await;

    let mut total = 0;
    for ticket in tickets {
        total += ticket.join().await.unwrap();
    }
    assert_eq!(total, 3);
    assert_eq!(crashed.join().await, None::<()>);
    assert_eq!(after.join().await, Some(3));

    pool.shutdown().await;
    assert_eq!(WorkerPool::new(0).size(), 1);
}
