//! End-to-end exercise of `POST /generate` against a mocked record store:
//! the single-template happy path (scenario: merge, upload, link, succeed)
//! and the idempotent re-issue returning the first artifact with
//! `cacheHit = true`.

use std::io::Write;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path, query_param_contains};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_KEY: &str = include_str!("testdata/test_key.pem");

const TEMPLATE_ID: &str = "a01A1234567890AQAA";
const BINARY_ID: &str = "068A1234567890AQAA";
const ACCOUNT_ID: &str = "001A1234567890AQAA";
const TRACKING_ID: &str = "a00A1234567890AQAA";
const UPLOADED_VERSION: &str = "068Z1234567890AQAA";
const UPLOADED_DOCUMENT: &str = "069Z1234567890AQAA";

/// A minimal template package: one paragraph with a substitution.
fn template_docx() -> Vec<u8> {
    let document = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>Dear {{Account.Name}}</w:t></w:r></w:p><w:sectPr></w:sectPr></w:body></w:document>"#;
    let content_types = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default();
        writer.start_file("[Content_Types].xml", options).unwrap();
        writer.write_all(content_types.as_bytes()).unwrap();
        writer.start_file("word/document.xml", options).unwrap();
        writer.write_all(document.as_bytes()).unwrap();
    writer.finish().unwrap();
    }
    cursor.into_inner()
}

fn test_config(store_uri: &str) -> agent::Config {
    agent::Config::resolve(agent::config::Args {
        env: "development".to_string(),
        api_port: 0,
        allow_origin: Vec::new(),
        serve_poller: false,
        issuer: "https://issuer.example.com".to_string(),
        audience: "docgen".to_string(),
        jwks_uri: "https://issuer.example.com/jwks.json".parse().unwrap(),
        auth_bypass_development: true,
        sf_domain: store_uri.to_string(),
        sf_client_id: "consumer-key".to_string(),
        sf_username: "agent@example.com".to_string(),
        sf_private_key: Some(TEST_KEY.to_string()),
        sf_private_key_file: None,
        conversion_timeout_ms: 60_000,
        conversion_workdir: std::env::temp_dir(),
        conversion_max_concurrent: 2,
        converter_bin: "soffice".into(),
        template_cache_max_bytes: 10 * 1024 * 1024,
        poller_active_interval_ms: 15_000,
        poller_idle_interval_ms: 60_000,
        poller_batch_size: 20,
        poller_lock_ttl_ms: 120_000,
        poller_max_attempts: 3,
        image_allowlist: String::new(),
        idempotency_window_hours: 24,
        body_limit_bytes: 2 * 1024 * 1024,
    })
    .unwrap()
}

async fn mount_store(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok",
            "instance_url": server.uri(),
            "token_type": "Bearer",
        })))
        .mount(server)
        .await;

    // Template metadata.
    Mock::given(method("GET"))
        .and(path("/services/data/v59.0/query"))
        .and(query_param_contains("q", "DocumentTemplate__c"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "totalSize": 1, "done": true,
            "records": [{
                "Id": TEMPLATE_ID,
                "DataSource__c": "SOQL",
                "Query__c": "SELECT Name FROM Account WHERE Id = :recordId",
                "PrimaryParentType__c": "Account",
                "TemplateBinary__c": BINARY_ID,
            }],
        })))
        .mount(server)
        .await;

    // First idempotency lookup misses; later lookups hit.
    Mock::given(method("GET"))
        .and(path("/services/data/v59.0/query"))
        .and(query_param_contains("q", "RequestHash__c"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "totalSize": 0, "done": true, "records": [],
        })))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v59.0/query"))
        .and(query_param_contains("q", "RequestHash__c"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "totalSize": 1, "done": true,
            "records": [{
                "Id": TRACKING_ID,
                "Status__c": "SUCCEEDED",
                "RequestHash__c": "whatever",
                "Attempts__c": 0.0,
                "OutputFileId__c": UPLOADED_VERSION,
                "CreatedDate": "2026-08-01T10:00:00.000+0000",
            }],
        })))
        .mount(server)
        .await;

    // Supported-object configuration.
    Mock::given(method("GET"))
        .and(path("/services/data/v59.0/query"))
        .and(query_param_contains("q", "SupportedObject__mdt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "totalSize": 1, "done": true,
            "records": [{
                "ObjectType__c": "Account",
                "LookupField__c": "Account__c",
                "IsActive__c": true,
                "DisplayOrder__c": 1.0,
            }],
        })))
        .mount(server)
        .await;

    // Template binary download.
    Mock::given(method("GET"))
        .and(path(format!(
            "/services/data/v59.0/sobjects/ContentVersion/{BINARY_ID}/VersionData"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(template_docx()))
        .mount(server)
        .await;

    // Tracking-row creation.
    Mock::given(method("POST"))
        .and(path("/services/data/v59.0/sobjects/DocumentRequest__c"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": TRACKING_ID, "success": true, "errors": [],
        })))
        .mount(server)
        .await;

    // Artifact upload and its document id.
    Mock::given(method("POST"))
        .and(path("/services/data/v59.0/sobjects/ContentVersion"))
        .and(body_string_contains("VersionData"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": UPLOADED_VERSION, "success": true, "errors": [],
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/services/data/v59.0/sobjects/ContentVersion/{UPLOADED_VERSION}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ContentDocumentId": UPLOADED_DOCUMENT,
        })))
        .mount(server)
        .await;

    // Parent link.
    Mock::given(method("POST"))
        .and(path("/services/data/v59.0/sobjects/ContentDocumentLink"))
        .and(body_string_contains(ACCOUNT_ID))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "06AA1234567890AQAA", "success": true, "errors": [],
        })))
        .expect(1)
        .mount(server)
        .await;

    // Success transition.
    Mock::given(method("PATCH"))
        .and(path(format!(
            "/services/data/v59.0/sobjects/DocumentRequest__c/{TRACKING_ID}"
        )))
        .and(body_string_contains("SUCCEEDED"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(server)
        .await;
}

fn generate_request() -> axum::http::Request<axum::body::Body> {
    let envelope = serde_json::json!({
        "templateId": TEMPLATE_ID,
        "data": {"Account": {"Name": "Acme", "AnnualRevenue__formatted": "£5,000,000"}},
        "parents": {"AccountId": ACCOUNT_ID},
        "outputFormat": "DOCX",
        "locale": "en-GB",
        "timezone": "Europe/London",
        "correlationId": "8f2e8a3e-5a59-11ed-9b6a-0242ac120002",
    });
    axum::http::Request::builder()
        .method("POST")
        .uri("/generate")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(envelope.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_generate_happy_path_then_idempotent_reissue() {
    let server = MockServer::start().await;
    mount_store(&server).await;

    let app = Arc::new(agent::App::new(test_config(&server.uri())));
    let prometheus = agent::metrics::install_recorder();
    let router = agent::api::build_router(app, prometheus).unwrap();

    // First issue: full generation.
    let response = router.clone().oneshot(generate_request()).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK, "{response:?}");
    let body = body_json(response).await;
    assert_eq!(body["cacheHit"], serde_json::json!(false));
    assert_eq!(body["contentVersionId"], serde_json::json!(UPLOADED_VERSION));
    assert!(body["downloadUrl"]
        .as_str()
        .unwrap()
        .contains(UPLOADED_VERSION));
    assert_eq!(
        body["correlationId"],
        serde_json::json!("8f2e8a3e-5a59-11ed-9b6a-0242ac120002"),
    );

    // Second issue inside the window: served from the prior artifact, and
    // the `.expect(1)` mocks above prove no second upload/link happened.
    let response = router.clone().oneshot(generate_request()).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["cacheHit"], serde_json::json!(true));
    assert_eq!(body["contentVersionId"], serde_json::json!(UPLOADED_VERSION));
}

#[tokio::test]
async fn test_generate_rejects_malformed_envelope() {
    let server = MockServer::start().await;
    let app = Arc::new(agent::App::new(test_config(&server.uri())));
    let prometheus = agent::metrics::install_recorder();
    let router = agent::api::build_router(app, prometheus).unwrap();

    // Neither templateId nor compositeDocumentId.
    let envelope = serde_json::json!({
        "data": {},
        "outputFormat": "PDF",
        "locale": "en-GB",
        "timezone": "Europe/London",
        "correlationId": "8f2e8a3e-5a59-11ed-9b6a-0242ac120002",
    });
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/generate")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(envelope.to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], serde_json::json!("validationError"));
    assert_eq!(body["error"]["retryable"], serde_json::json!(false));
}
