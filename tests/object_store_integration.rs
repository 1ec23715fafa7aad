//! Object storage backend against a wiremock S3-compatible endpoint.

mod support;

use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use filer_core::config::ObjectStoreConfig;
use filer_core::transport::object::checkpoint::{
    self, CheckpointKind, FileStamp, UploadCheckpoint, checkpoint_path,
};
use filer_core::transport::object::{ObjectFlavor, ObjectStoreTransport};
use filer_core::{RemoteUrl, TransferContext, TransferError, Transport};
use support::socket_guard::start_mock_server_or_skip;
use std::collections::BTreeMap;
use std::path::Path;

use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> ObjectStoreConfig {
    ObjectStoreConfig {
        endpoint: Some(server.uri()),
        region: "us-east-1".to_string(),
        max_retry_count: 1,
        ..ObjectStoreConfig::default()
    }
}

fn transport_with(config: &ObjectStoreConfig, flavor: ObjectFlavor) -> ObjectStoreTransport {
    let credentials = SharedCredentialsProvider::new(Credentials::new("AK", "SK", None, None, "test"));
    ObjectStoreTransport::new(config, credentials, flavor)
}

fn transport(server: &MockServer, flavor: ObjectFlavor) -> ObjectStoreTransport {
    transport_with(&config(server), flavor)
}

/// Generic transport splitting anything of `part_size` bytes or more into parts.
fn multipart_transport(server: &MockServer, part_size: u64) -> ObjectStoreTransport {
    let config = ObjectStoreConfig {
        part_size,
        ..config(server)
    };
    transport_with(&config, ObjectFlavor::Generic)
}

fn list_body(keys: &[&str], prefixes: &[&str]) -> String {
    let contents = keys
        .iter()
        .map(|key| format!("<Contents><Key>{key}</Key><Size>5</Size></Contents>"))
        .collect::<String>();
    let common = prefixes
        .iter()
        .map(|prefix| format!("<CommonPrefixes><Prefix>{prefix}</Prefix></CommonPrefixes>"))
        .collect::<String>();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Name>bucket</Name><KeyCount>{}</KeyCount><MaxKeys>1000</MaxKeys><IsTruncated>false</IsTruncated>{contents}{common}</ListBucketResult>"#,
        keys.len() + prefixes.len()
    )
}

async fn mount_object(server: &MockServer, key: &str, body: &str) {
    Mock::given(method("HEAD"))
        .and(path(format!("/bucket/{key}")))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"e1\""))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/bucket/{key}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_throttled_put_is_retried_in_place() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    Mock::given(method("PUT"))
        .and(path("/bucket/out/result.txt"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bucket/out/result.txt"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"e1\""))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("result.txt");
    std::fs::write(&local, "result").unwrap();

    transport(&server, ObjectFlavor::Generic)
        .upload_file(
            &TransferContext::new(),
            &local,
            &RemoteUrl::parse("s3://bucket/out/result.txt").unwrap(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_non_throttle_error_is_surfaced() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?><Error><Code>AccessDenied</Code><Message>denied</Message></Error>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("result.txt");
    std::fs::write(&local, "result").unwrap();

    let err = transport(&server, ObjectFlavor::Generic)
        .upload_file(
            &TransferContext::new(),
            &local,
            &RemoteUrl::parse("s3://bucket/result.txt").unwrap(),
        )
        .await
        .unwrap_err();
    let store = err.as_object_store().unwrap();
    assert_eq!(store.status, Some(403));
    assert_eq!(store.code.as_deref(), Some("AccessDenied"));
}

#[tokio::test]
async fn test_flat_prefix_download_mirrors_layout() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/bucket"))
        .and(query_param("list-type", "2"))
        .and(query_param("prefix", "dir/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(list_body(&["dir/a.txt", "dir/sub/", "dir/sub/b.txt"], &[])),
        )
        .mount(&server)
        .await;
    mount_object(&server, "dir/a.txt", "alpha").await;
    mount_object(&server, "dir/sub/b.txt", "bravo").await;

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("inputs");
    transport(&server, ObjectFlavor::Generic)
        .download_dir(
            &TransferContext::new(),
            &target,
            &RemoteUrl::parse("s3://bucket/dir").unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(target.join("a.txt")).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(target.join("sub/b.txt")).unwrap(), "bravo");
}

#[tokio::test]
async fn test_delimited_prefix_download_recurses_into_common_prefixes() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/bucket"))
        .and(query_param("prefix", "dir/"))
        .and(query_param("delimiter", "/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(list_body(&["dir/a.txt"], &["dir/sub/"])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bucket"))
        .and(query_param("prefix", "dir/sub/"))
        .and(query_param("delimiter", "/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(list_body(&["dir/sub/b.txt"], &[])))
        .mount(&server)
        .await;
    mount_object(&server, "dir/a.txt", "alpha").await;
    mount_object(&server, "dir/sub/b.txt", "bravo").await;

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("inputs");
    transport(&server, ObjectFlavor::Vendor)
        .download_dir(
            &TransferContext::new(),
            &target,
            &RemoteUrl::parse("tos://bucket/dir/").unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(target.join("a.txt")).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(target.join("sub/b.txt")).unwrap(), "bravo");
}

#[tokio::test]
async fn test_cancelled_context_aborts_before_request() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("x");
    std::fs::write(&local, "x").unwrap();
    let ctx = TransferContext::new();
    ctx.cancel();

    let err = transport(&server, ObjectFlavor::Generic)
        .upload_file(&ctx, &local, &RemoteUrl::parse("s3://bucket/x").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));
}

// ==================== Multipart Tests ====================

const UPLOAD_KEY: &str = "out/big.bin";

fn initiate_body(upload_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Bucket>bucket</Bucket><Key>{UPLOAD_KEY}</Key><UploadId>{upload_id}</UploadId></InitiateMultipartUploadResult>"#
    )
}

fn complete_body() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Bucket>bucket</Bucket><Key>{UPLOAD_KEY}</Key><ETag>"final"</ETag></CompleteMultipartUploadResult>"#
    )
}

async fn mount_create(server: &MockServer, upload_id: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/bucket/{UPLOAD_KEY}")))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(initiate_body(upload_id)))
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_parts(server: &MockServer, upload_id: &str) {
    Mock::given(method("PUT"))
        .and(path(format!("/bucket/{UPLOAD_KEY}")))
        .and(query_param("uploadId", upload_id))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part\""))
        .mount(server)
        .await;
}

async fn mount_complete(server: &MockServer, upload_id: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/bucket/{UPLOAD_KEY}")))
        .and(query_param("uploadId", upload_id))
        .respond_with(ResponseTemplate::new(200).set_body_string(complete_body()))
        .expect(times)
        .mount(server)
        .await;
}

/// Part numbers of every `UploadPart` request sent under `upload_id`, sorted.
async fn uploaded_parts(server: &MockServer, upload_id: &str) -> Vec<u32> {
    let mut parts = server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.method.as_str() == "PUT")
        .filter(|request| {
            request
                .url
                .query_pairs()
                .any(|(name, value)| name == "uploadId" && value == upload_id)
        })
        .filter_map(|request| {
            request
                .url
                .query_pairs()
                .find(|(name, _)| name == "partNumber")
                .and_then(|(_, value)| value.parse().ok())
        })
        .collect::<Vec<u32>>();
    parts.sort_unstable();
    parts
}

/// Writes a 25-byte file, three parts at a part size of 10.
fn write_upload_source(dir: &Path) -> std::path::PathBuf {
    let local = dir.join("big.bin");
    std::fs::write(&local, b"0123456789abcdefghijKLMNO").unwrap();
    local
}

async fn save_upload_checkpoint(local: &Path, upload_id: &str, done: &[i32]) -> std::path::PathBuf {
    let stamp = FileStamp::of(local).await.unwrap();
    let cp = UploadCheckpoint {
        bucket: "bucket".to_string(),
        key: UPLOAD_KEY.to_string(),
        file_size: stamp.size,
        modified_secs: stamp.modified_secs,
        part_size: 10,
        upload_id: upload_id.to_string(),
        parts: done.iter().map(|n| (*n, "\"part\"".to_string())).collect::<BTreeMap<_, _>>(),
    };
    let cp_path = checkpoint_path(local, "bucket", UPLOAD_KEY, CheckpointKind::Upload);
    checkpoint::save(&cp_path, &cp).await.unwrap();
    cp_path
}

fn upload_remote() -> RemoteUrl {
    RemoteUrl::parse(&format!("s3://bucket/{UPLOAD_KEY}")).unwrap()
}

#[tokio::test]
async fn test_multipart_upload_sends_every_part_then_completes() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    mount_create(&server, "u-1", 1).await;
    mount_parts(&server, "u-1").await;
    mount_complete(&server, "u-1", 1).await;

    let dir = tempfile::tempdir().unwrap();
    let local = write_upload_source(dir.path());

    multipart_transport(&server, 10)
        .upload_file(&TransferContext::new(), &local, &upload_remote())
        .await
        .unwrap();

    assert_eq!(uploaded_parts(&server, "u-1").await, vec![1, 2, 3]);
    let cp_path = checkpoint_path(&local, "bucket", UPLOAD_KEY, CheckpointKind::Upload);
    assert!(!cp_path.exists());
}

#[tokio::test]
async fn test_multipart_upload_resumes_from_checkpoint() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    mount_create(&server, "u-new", 0).await;
    mount_parts(&server, "u-old").await;
    mount_complete(&server, "u-old", 1).await;

    let dir = tempfile::tempdir().unwrap();
    let local = write_upload_source(dir.path());
    let cp_path = save_upload_checkpoint(&local, "u-old", &[1]).await;

    multipart_transport(&server, 10)
        .upload_file(&TransferContext::new(), &local, &upload_remote())
        .await
        .unwrap();

    assert_eq!(uploaded_parts(&server, "u-old").await, vec![2, 3]);
    assert!(!cp_path.exists());
}

#[tokio::test]
async fn test_expired_upload_id_drops_checkpoint_and_starts_over() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    Mock::given(method("PUT"))
        .and(path(format!("/bucket/{UPLOAD_KEY}")))
        .and(query_param("uploadId", "u-old"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?><Error><Code>NoSuchUpload</Code><Message>gone</Message></Error>"#,
        ))
        .mount(&server)
        .await;
    mount_complete(&server, "u-old", 0).await;
    mount_create(&server, "u-new", 1).await;
    mount_parts(&server, "u-new").await;
    mount_complete(&server, "u-new", 1).await;

    let dir = tempfile::tempdir().unwrap();
    let local = write_upload_source(dir.path());
    let cp_path = save_upload_checkpoint(&local, "u-old", &[1]).await;

    multipart_transport(&server, 10)
        .upload_file(&TransferContext::new(), &local, &upload_remote())
        .await
        .unwrap();

    assert_eq!(uploaded_parts(&server, "u-new").await, vec![1, 2, 3]);
    assert!(!cp_path.exists());
}

async fn mount_ranged_object(server: &MockServer, ranges: &[(&str, &str)]) {
    Mock::given(method("HEAD"))
        .and(path("/bucket/in/big.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"e1\"")
                .set_body_bytes(vec![0_u8; 25]),
        )
        .mount(server)
        .await;
    for (range, body) in ranges {
        Mock::given(method("GET"))
            .and(path("/bucket/in/big.bin"))
            .and(header("range", *range))
            .respond_with(ResponseTemplate::new(206).set_body_string(*body))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_multipart_download_assembles_ranges() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    mount_ranged_object(
        &server,
        &[
            ("bytes=0-9", "0123456789"),
            ("bytes=10-19", "abcdefghij"),
            ("bytes=20-24", "KLMNO"),
        ],
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("big.bin");
    multipart_transport(&server, 10)
        .download_file(
            &TransferContext::new(),
            &local,
            &RemoteUrl::parse("s3://bucket/in/big.bin").unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&local).unwrap(), "0123456789abcdefghijKLMNO");
}

#[tokio::test]
async fn test_short_range_fails_multipart_download() {
    let Some(server) = start_mock_server_or_skip("object store").await else {
        return;
    };
    mount_ranged_object(
        &server,
        &[
            ("bytes=0-9", "0123456789"),
            ("bytes=10-19", "abcd"),
            ("bytes=20-24", "KLMNO"),
        ],
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("big.bin");
    let err = multipart_transport(&server, 10)
        .download_file(
            &TransferContext::new(),
            &local,
            &RemoteUrl::parse("s3://bucket/in/big.bin").unwrap(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Integrity { .. }), "{err:?}");
    assert!(!local.exists());
}
