//! Worker line codec and wire envelopes.

use bytes::BytesMut;
use sdk_sandbox_broker::sandbox::WorkerErrorCode;
use sdk_sandbox_broker::worker::codec::{WorkerCodec, MAX_LINE_BYTES};
use sdk_sandbox_broker::worker::protocol::{
    encode_request, parse_response_line, METHOD_LOAD, METHOD_SURFACE, METHOD_SYNC, METHOD_UNLOAD,
};
use sdk_sandbox_broker::AppError;
use serde_json::{json, Value};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn codec_splits_lines() {
    let mut codec = WorkerCodec::new();
    let mut buf = BytesMut::from("{\"id\":\"1\"}\n{\"id\":\"2\"}\npartial");

    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"id\":\"1\"}"));
    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"id\":\"2\"}"));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("partial"));
}

#[test]
fn codec_rejects_oversized_line() {
    let mut codec = WorkerCodec::default();
    let mut buf = BytesMut::from("x".repeat(MAX_LINE_BYTES + 1).as_str());

    let err = codec.decode(&mut buf).expect_err("too long");
    assert!(matches!(err, AppError::Protocol(msg) if msg.contains("line too long")));
}

#[test]
fn codec_encodes_with_newline() {
    let mut codec = WorkerCodec::new();
    let mut dst = BytesMut::new();
    codec.encode("{}".to_owned(), &mut dst).unwrap();
    assert_eq!(&dst[..], b"{}\n");
}

#[test]
fn codec_skips_blank_lines() {
    let mut codec = WorkerCodec::new();
    let mut buf = BytesMut::from("\n  \r\n{\"id\":\"1\"}\n\n");

    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"id\":\"1\"}"));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
}

#[test]
fn codec_refuses_request_with_line_break() {
    let mut codec = WorkerCodec::new();
    let mut dst = BytesMut::new();

    let err = codec
        .encode("{\"a\":1}\n{\"b\":2}".to_owned(), &mut dst)
        .expect_err("two frames");
    assert!(matches!(err, AppError::Protocol(msg) if msg.contains("line break")));
    assert!(dst.is_empty());
}

#[test]
fn request_envelope_shape() {
    let line = encode_request("req-1", METHOD_UNLOAD, &json!({"sdk_name": "sdk.alpha"})).unwrap();
    let value: Value = serde_json::from_str(&line).unwrap();

    assert_eq!(
        value,
        json!({"id": "req-1", "method": "sdk/unload", "params": {"sdk_name": "sdk.alpha"}})
    );
    assert!(!line.contains('\n'));
}

#[test]
fn method_names() {
    assert_eq!(METHOD_LOAD, "sdk/load");
    assert_eq!(METHOD_UNLOAD, "sdk/unload");
    assert_eq!(METHOD_SURFACE, "surface/request");
    assert_eq!(METHOD_SYNC, "data/sync");
}

#[test]
fn success_response_yields_result() {
    let response = parse_response_line(r#"{"id":"a","result":{"ok":true}}"#)
        .unwrap()
        .expect("response");
    assert_eq!(response.id, "a");
    assert_eq!(response.into_outcome(), Ok(json!({"ok": true})));
}

#[test]
fn error_wins_over_result() {
    let response = parse_response_line(
        r#"{"id":"b","result":1,"error":{"code":"already_loaded","message":"dup"}}"#,
    )
    .unwrap()
    .expect("response");
    let err = response.into_outcome().expect_err("error wins");
    assert_eq!(err.code, WorkerErrorCode::AlreadyLoaded);
    assert_eq!(err.message, "dup");
}

#[test]
fn empty_response_is_null() {
    let response = parse_response_line(r#"{"id":"c"}"#).unwrap().expect("response");
    assert_eq!(response.into_outcome(), Ok(Value::Null));
}

#[test]
fn blank_lines_are_skipped() {
    assert_eq!(parse_response_line("   ").unwrap(), None);
}

#[test]
fn malformed_lines_are_protocol_errors() {
    for line in ["not json", r#"{"result":1}"#, "[1,2]"] {
        let err = parse_response_line(line).expect_err("malformed");
        assert!(
            matches!(&err, AppError::Protocol(msg) if msg.starts_with("malformed response")),
            "{err}"
        );
    }
}
