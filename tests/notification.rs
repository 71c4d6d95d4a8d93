use netflow::{
    model::{Notification, ObjectRef},
    Error,
};

fn object(bucket: &str, key: &str) -> ObjectRef {
    ObjectRef { bucket: bucket.into(), key: key.into() }
}

fn objects(list: &[(&str, &str)]) -> Notification {
    Notification::Objects(list.iter().map(|&(bucket, key)| object(bucket, key)).collect())
}

#[test]
fn plain_event() {
    let body = r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"raw"},"object":{"key":"a.csv","size":12}}}]}"#;
    assert_eq!(Notification::parse(body).unwrap(), objects(&[("raw", "a.csv")]));
}

#[test]
fn every_record_counts() {
    let body = r#"{"Records":[
        {"s3":{"bucket":{"name":"raw"},"object":{"key":"first.csv"}}},
        {"s3":{"bucket":{"name":"other"},"object":{"key":"second%2Ecsv"}}}
    ]}"#;
    assert_eq!(Notification::parse(body).unwrap(), objects(&[("raw", "first.csv"), ("other", "second.csv")]));

    // one unusable record spoils the message
    let body = r#"{"Records":[
        {"s3":{"bucket":{"name":"raw"},"object":{"key":"first.csv"}}},
        {"s3":{"bucket":{"name":"raw"},"object":{"key":""}}}
    ]}"#;
    assert!(matches!(Notification::parse(body), Err(Error::Parse(_))));
}

#[test]
fn created_events_read_back() {
    let written = [object("summaries", "daily_summary_2025-01-01_day one/a+b.csv"), object("aggregate", "x.bin")];
    let body = Notification::created(&written);
    assert_eq!(Notification::parse(&body).unwrap(), Notification::Objects(written.to_vec()));
    assert!(body.contains("ObjectCreated:Put"));
}

#[test]
fn topic_envelope() {
    let inner = r#"{"Records":[{"s3":{"bucket":{"name":"raw"},"object":{"key":"nested%2Fkey.csv"}}}]}"#;
    let body = serde_json::json!({ "Type": "Notification", "Message": inner }).to_string();
    assert_eq!(Notification::parse(&body).unwrap(), objects(&[("raw", "nested/key.csv")]));
}

#[test]
fn test_events() {
    assert_eq!(Notification::parse(r#"{"Event":"s3:TestEvent","Bucket":"raw"}"#).unwrap(), Notification::Test);

    let body = serde_json::json!({ "Message": r#"{"Event":"s3:TestEvent"}"# }).to_string();
    assert_eq!(Notification::parse(&body).unwrap(), Notification::Test);
}

#[test]
fn keys_are_form_decoded() {
    let body = r#"{"Records":[{"s3":{"bucket":{"name":"raw"},"object":{"key":"my+capture%2B1%20(copy).csv"}}}]}"#;
    assert_eq!(Notification::parse(body).unwrap(), objects(&[("raw", "my capture+1 (copy).csv")]));
}

#[test]
fn rejected_bodies() {
    for body in [
        "",
        "not json",
        "{}",
        r#"{"Records":[]}"#,
        r#"{"Records":[{"s3":{"bucket":{"name":""},"object":{"key":"a.csv"}}}]}"#,
        r#"{"Records":[{"s3":{"bucket":{"name":"raw"},"object":{}}}]}"#,
        r#"{"Message":"not json either"}"#,
    ] {
        assert!(Notification::parse(body).is_err(), "{body}");
    }

    assert!(matches!(Notification::parse("[1, 2]"), Err(Error::Notification(_))));
    assert!(matches!(Notification::parse(r#"{"Records":[]}"#), Err(Error::Parse(_))));
}
