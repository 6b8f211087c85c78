use photodrop_cli::api::models::{
    CompleteMultipartRequest, CompletedPart, CreateMultipartResponse, FileSpec, ListPartsResponse,
    ListingResponse, PresignRequest, PresignResponse, SessionInfo,
};
use photodrop_cli::quota::{QuotaCheck, StorageQuota};
use photodrop_cli::PipelineSettings;
use serde_json::json;

#[test]
fn test_presign_request_uses_camel_case_fields() {
    let files = vec![FileSpec {
        key: "a.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        size: 2_048,
    }];

    let value = serde_json::to_value(PresignRequest { files: &files }).unwrap();

    assert_eq!(
        value,
        json!({ "files": [{ "key": "a.jpg", "contentType": "image/jpeg", "size": 2048 }] })
    );
}

#[test]
fn test_presign_response_tolerates_missing_headers_and_urls() {
    let response: PresignResponse = serde_json::from_str(
        r#"{"urls":[{"key":"a.jpg","url":"https://s3/a","objectKey":"g1/a.jpg"}]}"#,
    )
    .unwrap();
    assert_eq!(response.urls[0].object_key, "g1/a.jpg");
    assert!(response.urls[0].headers.is_empty());

    let empty: PresignResponse = serde_json::from_str("{}").unwrap();
    assert!(empty.urls.is_empty());
}

#[test]
fn test_multipart_upload_response_shape() {
    let response: CreateMultipartResponse = serde_json::from_value(json!({
        "uploads": [{
            "uploadId": "u-1",
            "objectKey": "g1/big.jpg",
            "key": "big.jpg",
            "parts": [
                { "partNumber": 2, "url": "https://s3/2" },
                { "partNumber": 1, "url": "https://s3/1" }
            ],
            "totalParts": 2,
            "partSize": 8388608
        }]
    }))
    .unwrap();

    let upload = &response.uploads[0];
    assert_eq!(upload.upload_id, "u-1");
    assert_eq!(upload.total_parts, 2);
    assert_eq!(upload.part_size, 8 * 1024 * 1024);
    assert_eq!(upload.parts[1].part_number, 1);
}

#[test]
fn test_list_parts_defaults_size() {
    let response: ListPartsResponse =
        serde_json::from_str(r#"{"parts":[{"partNumber":1,"etag":"e1"}]}"#).unwrap();
    assert_eq!(response.parts[0].etag, "e1");
    assert_eq!(response.parts[0].size, 0);
}

#[test]
fn test_complete_request_wire_format() {
    let request = CompleteMultipartRequest {
        upload_id: "u-1".to_string(),
        key: "g1/big.jpg".to_string(),
        parts: vec![
            CompletedPart {
                part_number: 1,
                etag: "e1".to_string(),
            },
            CompletedPart {
                part_number: 2,
                etag: "e2".to_string(),
            },
        ],
        file_size: 9_000_000,
    };

    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({
            "uploadId": "u-1",
            "key": "g1/big.jpg",
            "parts": [
                { "partNumber": 1, "etag": "e1" },
                { "partNumber": 2, "etag": "e2" }
            ],
            "fileSize": 9000000
        })
    );
}

#[test]
fn test_listing_items_are_processed_once_any_url_is_set() {
    let response: ListingResponse = serde_json::from_value(json!({
        "items": [
            { "key": "g1/a.jpg", "thumbUrl": "https://cdn/t/a.jpg" },
            { "key": "g1/b.jpg", "thumbUrl": "   " },
            { "filename": "c.jpg", "finalUrl": "https://cdn/f/c.jpg" },
            { "key": "", "url": "https://cdn/x.jpg" }
        ]
    }))
    .unwrap();

    let processed: Vec<bool> = response.items.iter().map(|item| item.is_processed()).collect();
    assert_eq!(processed, vec![true, false, true, true]);
    assert_eq!(response.items[2].identifier(), Some("c.jpg"));
    assert_eq!(response.items[3].identifier(), None);
}

#[test]
fn test_session_info_carries_storage_usage() {
    let info: SessionInfo = serde_json::from_value(json!({
        "user": { "id": "u1", "name": "Ada", "email": "ada@example.com" },
        "expires_at": "2026-12-01T00:00:00Z",
        "storage": { "used_bytes": 950000000, "limit_bytes": 1000000000 }
    }))
    .unwrap();

    let quota = StorageQuota::from(&info.storage.unwrap());
    assert_eq!(quota.to_string(), "950 MB of 1 GB");
}

#[test]
fn test_quota_check_serializes_camel_case() {
    let check = QuotaCheck {
        uploaded_size_bytes: 1_100_000_000,
        limit_bytes: 1_000_000_000,
        excess_bytes: 100_000_000,
    };
    assert_eq!(
        serde_json::to_value(check).unwrap(),
        json!({
            "uploadedSizeBytes": 1100000000u64,
            "limitBytes": 1000000000u64,
            "excessBytes": 100000000u64
        })
    );
}

#[test]
fn test_pipeline_settings_fill_missing_fields_with_defaults() {
    let settings: PipelineSettings =
        serde_json::from_value(json!({ "max_batch_size": 10, "poll_interval_ms": 500 })).unwrap();

    assert_eq!(settings.max_batch_size, 10);
    assert_eq!(settings.poll_interval_ms, 500);
    assert_eq!(settings.poll_max_attempts, PipelineSettings::default().poll_max_attempts);
    assert_eq!(settings.accepted_content_type, "image/");
}
