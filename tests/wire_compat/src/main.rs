fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use uplink_protocol::messages::{
        AttachTransferRequest, BatchCreatedResponse, BatchStatusResponse, CancelAckResponse,
        CreateBatchRequest, OperationResult, TransferAcceptedResponse,
    };
    use uplink_protocol::{
        BatchState, CancelStatus, ChunkHeader, FileDescriptor, FileState, Message, MessageType,
        TransferEvent, encode_chunk_frame, parse_chunk_frame,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// Clients written in other languages may send `65` where serde emits
    /// `65.0`.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Parses a fixture into `T`, re-serializes it and compares the JSON
    /// values (order-independent, float-normalized). Returns the parsed value.
    ///
    /// Parsing goes through the raw text so envelope payloads, which stay
    /// `RawValue`s, deserialize the same way they do off the socket.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let text = read_fixture(name);
        let fixture: serde_json::Value = serde_json::from_str(&text)
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"));
        let parsed: T = serde_json::from_str(&text)
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Envelopes ---

    #[test]
    fn fixture_message_init_transfer() {
        let msg = roundtrip_test::<Message>("message_init_transfer.json");
        assert_eq!(msg.msg_type, MessageType::InitTransfer);
        assert!(msg.msg_type.opens_transfer_channel());

        let file: FileDescriptor = msg.require_payload().unwrap();
        assert_eq!(file.declared_size, 100 * 1024 * 1024);
        assert_eq!(file.filename, "clip.mp4");
    }

    #[test]
    fn fixture_message_error() {
        let msg = roundtrip_test::<Message>("message_error.json");
        assert_eq!(msg.msg_type, MessageType::Error);
        assert!(msg.payload.is_none());
        let err = msg.error.unwrap();
        assert_eq!(err.code, 503);
        assert!(err.message.starts_with("insufficient memory"));
    }

    #[test]
    fn fixture_message_end_of_stream() {
        let msg = roundtrip_test::<Message>("message_end_of_stream.json");
        assert_eq!(msg.msg_type, MessageType::EndOfStream);
        assert!(msg.payload.is_none() && msg.error.is_none());
    }

    // --- Transfer channel ---

    #[test]
    fn fixture_transfer_accepted_response() {
        let resp = roundtrip_test::<TransferAcceptedResponse>("transfer_accepted_response.json");
        assert_eq!(resp.chunk_size, 1024 * 1024);
        assert!(resp.max_chunk_size >= resp.chunk_size);
    }

    #[test]
    fn fixture_chunk_header() {
        let header = roundtrip_test::<ChunkHeader>("chunk_header.json");
        assert_eq!(header.seq, 41);

        let frame = encode_chunk_frame(&header, b"payload").unwrap();
        let header_json = serde_json::to_vec(&header).unwrap();
        assert_eq!(&frame[..4], &(header_json.len() as u32).to_be_bytes());

        let parsed = parse_chunk_frame(&frame).unwrap();
        assert_eq!(parsed.header, header);
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn attach_request_shape() {
        let req = AttachTransferRequest {
            transfer_id: "t-1".into(),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({ "transferId": "t-1" })
        );
    }

    // --- Transfer events ---

    #[test]
    fn fixture_event_progress() {
        let ev = roundtrip_test::<TransferEvent>("event_progress.json");
        assert_eq!(ev, TransferEvent::Progress(37.5));
        assert!(!ev.is_terminal());
    }

    #[test]
    fn integer_progress_is_accepted() {
        let ev: TransferEvent = serde_json::from_str(r#"{"type":"progress","value":100}"#).unwrap();
        assert_eq!(ev, TransferEvent::Progress(100.0));
    }

    #[test]
    fn fixture_event_success() {
        match roundtrip_test::<TransferEvent>("event_success.json") {
            TransferEvent::Success(reference) => assert!(reference.ends_with("clip.mp4")),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn fixture_event_error() {
        let ev = roundtrip_test::<TransferEvent>("event_error.json");
        assert!(matches!(ev, TransferEvent::Error(ref m) if m.starts_with("protocol violation")));
        assert!(ev.is_terminal());
    }

    #[test]
    fn fixture_event_cancelled() {
        let ev = roundtrip_test::<TransferEvent>("event_cancelled.json");
        assert_eq!(ev, TransferEvent::Cancelled);
    }

    // --- Control channel ---

    #[test]
    fn fixture_cancel_ack_response() {
        let ack = roundtrip_test::<CancelAckResponse>("cancel_ack_response.json");
        assert_eq!(ack.status, CancelStatus::AlreadyTerminal);
    }

    #[test]
    fn fixture_create_batch_request() {
        let req = roundtrip_test::<CreateBatchRequest>("create_batch_request.json");
        assert_eq!(req.files.len(), 2);
        assert_eq!(req.files[1].content_type, "application/zip");
    }

    #[test]
    fn missing_content_type_defaults_to_empty() {
        let file: FileDescriptor =
            serde_json::from_str(r#"{"declaredSize":1,"filename":"a"}"#).unwrap();
        assert!(file.content_type.is_empty());
    }

    #[test]
    fn fixture_batch_created_response() {
        let resp = roundtrip_test::<BatchCreatedResponse>("batch_created_response.json");
        let [admitted, rejected] = &resp.results[..] else {
            panic!("expected two results");
        };
        assert!(admitted.admitted && admitted.transfer_id.is_some() && admitted.reason.is_none());
        assert!(!rejected.admitted && rejected.transfer_id.is_none() && rejected.destination.is_none());
    }

    #[test]
    fn fixture_batch_status_response() {
        let resp = roundtrip_test::<BatchStatusResponse>("batch_status_response.json");
        assert_eq!(resp.state, BatchState::Running);
        let states: Vec<FileState> = resp.files.iter().map(|f| f.state).collect();
        assert_eq!(states, vec![FileState::Streaming, FileState::Rejected]);
        assert!(resp.files[1].transfer_id.is_none());
    }

    #[test]
    fn fixture_operation_result() {
        let res = roundtrip_test::<OperationResult>("operation_result.json");
        assert!(res.success);
    }

    #[test]
    fn operation_result_omits_empty_message() {
        let res = OperationResult {
            success: true,
            message: String::new(),
        };
        assert_eq!(serde_json::to_string(&res).unwrap(), r#"{"success":true}"#);
    }
}
