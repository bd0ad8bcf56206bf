use crate::auth::{fetch_token, AuthConfig, TokenGrant};
use crate::error::{classify_response, ApiErrorBody};
use crate::Error;
use bytes::Bytes;
use models::RecordId;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;

const CALL_OPTIONS: &str = "client=docmill-agent";

/// Client is the process-wide handle to the record store. It owns the shared
/// HTTP connection pool and the cached token grant; per-request state (the
/// correlation id) lives in a [`Session`].
pub struct Client {
    http: reqwest::Client,
    auth: AuthConfig,
    api_version: String,
    token: tokio::sync::Mutex<Option<TokenGrant>>,
}

/// The identities of an uploaded file: the immutable content version and
/// the document which owns all of its versions.
#[derive(Debug, Clone)]
pub struct ContentVersionIds {
    pub content_version_id: RecordId,
    pub content_document_id: RecordId,
}

impl Client {
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
            api_version: "v59.0".to_string(),
            token: tokio::sync::Mutex::new(None),
        }
    }

    /// Binds a correlation id for one logical request or worker task.
    pub fn session(&self, correlation_id: uuid::Uuid) -> Session<'_> {
        Session {
            client: self,
            correlation_id,
        }
    }

    /// Returns a valid grant, acquiring or refreshing under a critical
    /// section so concurrent callers share one token exchange.
    async fn grant(&self, force_refresh: bool) -> Result<TokenGrant, Error> {
        let mut slot = self.token.lock().await;
        match &*slot {
            Some(grant) if !force_refresh && !grant.is_stale() => Ok(grant.clone()),
            _ => {
                let grant = fetch_token(&self.http, &self.auth).await?;
                *slot = Some(grant.clone());
                Ok(grant)
            }
        }
    }

    /// Probes outbound auth for the readiness check.
    pub async fn check_auth(&self) -> Result<(), Error> {
        self.grant(false).await.map(|_| ())
    }

    fn data_path(&self, tail: &str) -> String {
        format!("/services/data/{}/{tail}", self.api_version)
    }
}

pub struct Session<'a> {
    client: &'a Client,
    correlation_id: uuid::Uuid,
}

impl Session<'_> {
    /// Sends one request, re-acquiring the token and retrying exactly once
    /// if the store rejects the bearer. Any other failure is classified and
    /// returned; retry policy belongs to the caller.
    async fn send(
        &self,
        build: impl Fn(&reqwest::Client, &TokenGrant) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        let mut forced = false;
        loop {
            let grant = self.client.grant(forced).await?;
            let response = build(&self.client.http, &grant)
                .bearer_auth(&grant.access_token)
                .header("X-Correlation-Id", self.correlation_id.to_string())
                .header("Sforce-Call-Options", CALL_OPTIONS)
                .send()
                .await?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && !forced {
                tracing::debug!("bearer rejected; refreshing token");
                forced = true;
                continue;
            }
            if status.is_success() {
                return Ok(response);
            }

            let body: Vec<ApiErrorBody> = response.json().await.unwrap_or_default();
            return Err(classify_response(status.as_u16(), &body));
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: String) -> Result<T, Error> {
        let response = self
            .send(|http, grant| {
                http.get(grant.instance_url.join(&path).expect("paths always join"))
            })
            .await?;
        Ok(response.json().await?)
    }

    /// Runs a SOQL query, following `nextRecordsUrl` pagination, and returns
    /// every record as a raw JSON object.
    pub async fn query(&self, soql: &str) -> Result<Vec<serde_json::Value>, Error> {
        #[derive(serde::Deserialize)]
        struct Page {
            done: bool,
            #[serde(rename = "nextRecordsUrl")]
            next_records_url: Option<String>,
            records: Vec<serde_json::Value>,
        }

        let encoded = utf8_percent_encode(soql, NON_ALPHANUMERIC).to_string();
        let mut path = self.client.data_path(&format!("query?q={encoded}"));
        let mut records = Vec::new();
        loop {
            let page: Page = self.get_json(path).await?;
            records.extend(page.records);
            match (page.done, page.next_records_url) {
                (false, Some(next)) => path = next,
                _ => return Ok(records),
            }
        }
    }

    /// Runs a SOQL query and deserializes each record.
    pub async fn query_as<T: DeserializeOwned>(&self, soql: &str) -> Result<Vec<T>, Error> {
        self.query(soql)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(|e| Error::Decode(e.to_string())))
            .collect()
    }

    /// Runs a SOQL query expected to match at most one record.
    pub async fn query_one<T: DeserializeOwned>(&self, soql: &str) -> Result<Option<T>, Error> {
        Ok(self.query_as(soql).await?.into_iter().next())
    }

    /// Reads selected fields of a single record.
    pub async fn read_record<T: DeserializeOwned>(
        &self,
        object: &str,
        id: &RecordId,
        fields: &[&str],
    ) -> Result<T, Error> {
        let path = self
            .client
            .data_path(&format!("sobjects/{object}/{id}?fields={}", fields.join(",")));
        self.get_json(path).await
    }

    /// Creates a record, returning its new id.
    pub async fn create_record(
        &self,
        object: &str,
        fields: &serde_json::Value,
    ) -> Result<RecordId, Error> {
        #[derive(serde::Deserialize)]
        struct Created {
            id: RecordId,
        }

        let path = self.client.data_path(&format!("sobjects/{object}"));
        let fields = fields.clone();
        let response = self
            .send(move |http, grant| {
                http.post(grant.instance_url.join(&path).expect("paths always join"))
                    .json(&fields)
            })
            .await?;
        let created: Created = response.json().await?;
        Ok(created.id)
    }

    /// Partially updates a record. Used for all status and lock transitions;
    /// a losing conditional write surfaces as [`Error::Conflict`].
    pub async fn patch_record(
        &self,
        object: &str,
        id: &RecordId,
        fields: &serde_json::Value,
    ) -> Result<(), Error> {
        let path = self.client.data_path(&format!("sobjects/{object}/{id}"));
        let fields = fields.clone();
        self.send(move |http, grant| {
            http.patch(grant.instance_url.join(&path).expect("paths always join"))
                .json(&fields)
        })
        .await?;
        Ok(())
    }

    /// Downloads a template binary by content-version id.
    pub async fn download_binary(&self, content_version_id: &RecordId) -> Result<Bytes, Error> {
        let path = self
            .client
            .data_path(&format!("sobjects/ContentVersion/{content_version_id}/VersionData"));
        let response = self
            .send(|http, grant| {
                http.get(grant.instance_url.join(&path).expect("paths always join"))
            })
            .await?;
        Ok(response.bytes().await?)
    }

    /// Uploads a new file, returning both the content-version id and the
    /// owning content-document id.
    pub async fn upload_content_version(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<ContentVersionIds, Error> {
        let content_version_id = self
            .create_record(
                "ContentVersion",
                &serde_json::json!({
                    "Title": filename,
                    "PathOnClient": filename,
                    "VersionData": base64::encode(bytes),
                }),
            )
            .await?;

        #[derive(serde::Deserialize)]
        struct Version {
            #[serde(rename = "ContentDocumentId")]
            content_document_id: RecordId,
        }
        let version: Version = self
            .read_record("ContentVersion", &content_version_id, &["ContentDocumentId"])
            .await?;

        Ok(ContentVersionIds {
            content_version_id,
            content_document_id: version.content_document_id,
        })
    }

    /// Attaches an uploaded document to a parent record.
    pub async fn create_link(
        &self,
        content_document_id: &RecordId,
        parent_id: &RecordId,
    ) -> Result<RecordId, Error> {
        self.create_record(
            "ContentDocumentLink",
            &serde_json::json!({
                "ContentDocumentId": content_document_id,
                "LinkedEntityId": parent_id,
                "ShareType": "V",
                "Visibility": "AllUsers",
            }),
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // A PKCS#8 RSA test key. Generated for these tests; grants nothing.
    const TEST_KEY: &str = include_str!("testdata/test_key.pem");

    async fn mock_client(server: &MockServer) -> Client {
        Client::new(AuthConfig {
            login_url: server.uri().parse().unwrap(),
            client_id: "consumer-key".to_string(),
            username: "agent@example.com".to_string(),
            private_key_pem: TEST_KEY.to_string(),
        })
    }

    fn token_response(server: &MockServer, token: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": token,
            "instance_url": server.uri(),
            "token_type": "Bearer",
        }))
    }

    #[tokio::test]
    async fn test_query_carries_auth_and_correlation() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("jwt-bearer"))
            .respond_with(token_response(&server, "tok-1"))
            .expect(1)
            .mount(&server)
            .await;

        let correlation_id = uuid::Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/services/data/v59.0/query"))
            .and(query_param_contains("q", "SELECT"))
            .and(header("Authorization", "Bearer tok-1"))
            .and(header("X-Correlation-Id", correlation_id.to_string().as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 1,
                "done": true,
                "records": [{"Name": "Acme"}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = mock_client(&server).await;
        let records = client
            .session(correlation_id)
            .query("SELECT Name FROM Account")
            .await
            .unwrap();
        assert_eq!(records, vec![serde_json::json!({"Name": "Acme"})]);
    }

    #[tokio::test]
    async fn test_stale_bearer_is_refreshed_once() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(token_response(&server, "tok"))
            .expect(2)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/services/data/v59.0/query"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!([
                {"message": "Session expired", "errorCode": "INVALID_SESSION_ID"},
            ])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v59.0/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 0, "done": true, "records": [],
            })))
            .mount(&server)
            .await;

        let client = mock_client(&server).await;
        let records = client
            .session(uuid::Uuid::new_v4())
            .query("SELECT Id FROM Account")
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_lock_contention_classifies_as_conflict() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(token_response(&server, "tok"))
            .mount(&server)
            .await;

        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!([
                {"message": "unable to obtain exclusive access to this record",
                 "errorCode": "UNABLE_TO_LOCK_ROW"},
            ])))
            .mount(&server)
            .await;

        let client = mock_client(&server).await;
        let err = client
            .session(uuid::Uuid::new_v4())
            .patch_record(
                "DocumentRequest__c",
                &"a00A1234567890AQAA".parse().unwrap(),
                &serde_json::json!({"Status__c": "PROCESSING"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_upload_resolves_document_id() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(token_response(&server, "tok"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/data/v59.0/sobjects/ContentVersion"))
            .and(body_string_contains("VersionData"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "068A1234567890AQAA", "success": true, "errors": [],
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(
                "/services/data/v59.0/sobjects/ContentVersion/068A1234567890AQAA",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ContentDocumentId": "069A1234567890AQAA",
            })))
            .mount(&server)
            .await;

        let client = mock_client(&server).await;
        let ids = client
            .session(uuid::Uuid::new_v4())
            .upload_content_version("out.pdf", b"%PDF-1.7")
            .await
            .unwrap();
        assert_eq!(ids.content_version_id.as_str(), "068A1234567890AQAA");
        assert_eq!(ids.content_document_id.as_str(), "069A1234567890AQAA");
    }
}
