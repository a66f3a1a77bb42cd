//! Google Cloud Storage object store.
//!
//! Talks to the GCS JSON API directly with `reqwest`:
//!   List:   `GET  {endpoint}/storage/v1/b/{bucket}/o` (paginated)
//!   Read:   `GET  {endpoint}/storage/v1/b/{bucket}/o/{name}?alt=media`
//!   Write:  `POST {endpoint}/upload/storage/v1/b/{bucket}/o?uploadType=media`
//!
//! Credentials are resolved in this order:
//!   - the configured credentials file (service account or authorized user)
//!   - `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable (raw bearer token)
//!   - `GOOGLE_APPLICATION_CREDENTIALS` environment variable
//!   - gcloud CLI auth (`gcloud auth application-default login`)
//!   - GCE metadata server (when running on Google Cloud)

use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::backend::ObjectStore;
use crate::config::GcsStorageConfig;
use crate::errors::ObjectNotFound;

/// OAuth2 scope needed to read and replace objects.
const GCS_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Default token endpoint for refresh-token and JWT exchanges.
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Lifetime requested for service account assertions.
const JWT_LIFETIME_SECS: u64 = 3600;

// -- GCS JSON API response types -----------------------------------------------

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsListResponse {
    items: Option<Vec<GcsObject>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

/// Claims of the service account assertion exchanged for an access token.
#[derive(Debug, Serialize)]
struct ServiceAccountClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

// -- Token management ---------------------------------------------------------

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// Object store backed by Google Cloud Storage.
pub struct GcsStore {
    /// HTTP client for GCS JSON API calls.  Carries the request timeout.
    client: reqwest::Client,
    /// API endpoint without trailing slash.
    endpoint: String,
    /// Explicit credentials file, if configured.
    credentials_file: Option<String>,
    /// Cached OAuth2 access token.
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcsStore {
    /// Create a new GCS store.
    ///
    /// Credentials are resolved lazily on the first API call.
    pub fn new(config: &GcsStorageConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        info!(endpoint = %endpoint, "GCS object store initialized");

        Ok(Self {
            client,
            endpoint,
            credentials_file: config.credentials_file.clone(),
            token_cache: Mutex::new(None),
        })
    }

    fn list_url(&self, bucket: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o",
            self.endpoint,
            url_encode_object_name(bucket)
        )
    }

    fn download_url(&self, bucket: &str, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint,
            url_encode_object_name(bucket),
            url_encode_object_name(name)
        )
    }

    fn upload_url(&self, bucket: &str, name: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            url_encode_object_name(bucket),
            url_encode_object_name(name)
        )
    }

    /// Get an OAuth2 access token, reusing the cached one until 60s before
    /// it expires.
    async fn get_access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self
                .token_cache
                .lock()
                .map_err(|_| anyhow::anyhow!("token cache mutex poisoned"))?;
            if let Some(ref cached) = *cache {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_access_token().await?;
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));

        {
            let mut cache = self
                .token_cache
                .lock()
                .map_err(|_| anyhow::anyhow!("token cache mutex poisoned"))?;
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expiry,
            });
        }

        Ok(token)
    }

    /// Fetch a fresh access token from the first available credential source.
    async fn fetch_access_token(&self) -> anyhow::Result<(String, u64)> {
        if let Some(ref path) = self.credentials_file {
            return self.token_from_credentials_file(path).await;
        }

        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok((token, 3600));
        }

        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return self.token_from_credentials_file(&path).await;
        }

        let adc_path = application_default_credentials_path();
        if let Ok(true) = tokio::fs::try_exists(&adc_path).await {
            return self.token_from_credentials_file(&adc_path).await;
        }

        self.token_from_metadata_server().await
    }

    /// Obtain an access token from a service account or authorized-user
    /// JSON file.
    async fn token_from_credentials_file(&self, path: &str) -> anyhow::Result<(String, u64)> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read credentials file {path}: {e}"))?;

        let creds: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse credentials file {path}: {e}"))?;

        let field = |name: &str| creds.get(name).and_then(|v| v.as_str()).unwrap_or("");

        match field("type") {
            "service_account" => {
                let client_email = field("client_email");
                let private_key = field("private_key");
                if client_email.is_empty() || private_key.is_empty() {
                    anyhow::bail!("Missing client_email or private_key in {path}");
                }
                let token_uri = match field("token_uri") {
                    "" => DEFAULT_TOKEN_URI,
                    uri => uri,
                };
                self.exchange_jwt_for_token(client_email, private_key, token_uri)
                    .await
            }
            "authorized_user" => {
                self.token_from_refresh(
                    field("client_id"),
                    field("client_secret"),
                    field("refresh_token"),
                )
                .await
            }
            other => Err(anyhow::anyhow!(
                "Unsupported credential type in {path}: {other}"
            )),
        }
    }

    /// Exchange a refresh token for an access token.
    async fn token_from_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .post(DEFAULT_TOKEN_URI)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token refresh request failed: {e}"))?;

        parse_token_response("Token refresh", resp).await
    }

    /// Sign a service account assertion and exchange it for an access token.
    async fn exchange_jwt_for_token(
        &self,
        client_email: &str,
        private_key_pem: &str,
        token_uri: &str,
    ) -> anyhow::Result<(String, u64)> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let assertion = sign_assertion(client_email, private_key_pem, token_uri, now)?;

        let resp = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("JWT token exchange request failed: {e}"))?;

        parse_token_response("JWT token exchange", resp).await
    }

    /// Obtain an access token from the GCE metadata server.
    async fn token_from_metadata_server(&self) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Metadata server request failed: {e}. \
                Set GOOGLE_APPLICATION_CREDENTIALS, run 'gcloud auth application-default login', \
                or set GOOGLE_OAUTH_ACCESS_TOKEN env var."))?;

        parse_token_response("Metadata server", resp).await
    }

    /// Build authorization headers for GCS API calls.
    async fn auth_headers(&self) -> anyhow::Result<HeaderMap> {
        let token = self.get_access_token().await?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| anyhow::anyhow!("Invalid auth header value: {e}"))?,
        );
        Ok(headers)
    }

    // -- GCS API operations ---------------------------------------------------

    async fn gcs_list_objects(&self, bucket: &str) -> anyhow::Result<Vec<String>> {
        let url = self.list_url(bucket);
        let mut all_names: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            // Long listings can outlive a token; the cache makes this cheap.
            let auth = self.auth_headers().await?;
            let mut req = self
                .client
                .get(&url)
                .headers(auth)
                .query(&[("fields", "items(name),nextPageToken")]);

            if let Some(ref token) = page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS list request failed: {e}"))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(map_gcs_error("list", status, &body));
            }

            let list_resp: GcsListResponse = resp.json().await?;
            if let Some(items) = list_resp.items {
                all_names.extend(items.into_iter().filter_map(|item| item.name));
            }

            debug!(bucket, listed = all_names.len(), "GCS list page");

            match list_resp.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_names)
    }

    async fn gcs_download(&self, bucket: &str, name: &str) -> anyhow::Result<Bytes> {
        let auth = self.auth_headers().await?;
        let resp = self
            .client
            .get(self.download_url(bucket, name))
            .headers(auth)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(ObjectNotFound {
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                }
                .into());
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(map_gcs_error("download", status, &body));
        }

        resp.bytes()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download body read failed: {e}"))
    }

    async fn gcs_upload(&self, bucket: &str, name: &str, data: Bytes) -> anyhow::Result<()> {
        let auth = self.auth_headers().await?;
        let resp = self
            .client
            .post(self.upload_url(bucket, name))
            .headers(auth)
            .header(CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS upload request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_gcs_error("upload", status, &body));
        }

        Ok(())
    }
}

impl ObjectStore for GcsStore {
    fn list(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            debug!("GCS list: bucket={}", bucket);
            self.gcs_list_objects(&bucket).await
        })
    }

    fn read(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            debug!("GCS read: bucket={} name={}", bucket, name);
            self.gcs_download(&bucket, &name).await
        })
    }

    fn write(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            debug!("GCS write: bucket={} name={} bytes={}", bucket, name, data.len());
            self.gcs_upload(&bucket, &name, data).await
        })
    }
}

// -- Helpers -------------------------------------------------------------------

/// URL-encode a bucket or object name for use in API paths.
fn url_encode_object_name(name: &str) -> String {
    percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Map a GCS HTTP error to an anyhow error with context.
fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
    if let Ok(err_resp) = serde_json::from_str::<GcsErrorResponse>(body) {
        if let Some(err) = err_resp.error {
            return anyhow::anyhow!(
                "GCS {}: {} (code {})",
                context,
                err.message.unwrap_or_default(),
                err.code.unwrap_or(status.as_u16())
            );
        }
    }
    anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
}

/// Get the path to gcloud application-default credentials.
fn application_default_credentials_path() -> String {
    if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
        return format!("{config_dir}/application_default_credentials.json");
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{home}/.config/gcloud/application_default_credentials.json");
    }
    ".config/gcloud/application_default_credentials.json".to_string()
}

/// Build the claims for a service account assertion issued at `now`.
fn assertion_claims(client_email: &str, token_uri: &str, now: u64) -> ServiceAccountClaims {
    ServiceAccountClaims {
        iss: client_email.to_string(),
        scope: GCS_SCOPE.to_string(),
        aud: token_uri.to_string(),
        iat: now,
        exp: now + JWT_LIFETIME_SECS,
    }
}

/// RS256-sign a service account assertion.
fn sign_assertion(
    client_email: &str,
    private_key_pem: &str,
    token_uri: &str,
    now: u64,
) -> anyhow::Result<String> {
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid service account private key: {e}"))?;
    let claims = assertion_claims(client_email, token_uri, now);
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| anyhow::anyhow!("Failed to sign service account assertion: {e}"))
}

/// Extract `(access_token, expires_in)` from an OAuth2 token response.
async fn parse_token_response(
    context: &str,
    resp: reqwest::Response,
) -> anyhow::Result<(String, u64)> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("{context} failed ({status}): {body}"));
    }

    let token_resp: serde_json::Value = resp.json().await?;
    token_from_json(context, &token_resp)
}

fn token_from_json(context: &str, token_resp: &serde_json::Value) -> anyhow::Result<(String, u64)> {
    let access_token = token_resp
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("No access_token in {context} response"))?
        .to_string();
    let expires_in = token_resp
        .get("expires_in")
        .and_then(|v| v.as_u64())
        .unwrap_or_else(|| {
            warn!("{context} response has no expires_in, assuming 3600s");
            3600
        });

    Ok((access_token, expires_in))
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> GcsStore {
        GcsStore::new(&GcsStorageConfig {
            endpoint: endpoint.to_string(),
            credentials_file: None,
            timeout_seconds: 30,
        })
        .unwrap()
    }

    fn seed_token(store: &GcsStore, token: &str) {
        *store.token_cache.lock().unwrap() = Some(CachedToken {
            access_token: token.to_string(),
            expiry: Instant::now() + Duration::from_secs(3600),
        });
    }

    #[tokio::test]
    async fn test_list_resolves_auth_per_page() {
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gcs = Arc::new(store(&format!("http://{addr}")));
        seed_token(&gcs, "first");

        let server_store = gcs.clone();
        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            for page in 0..2 {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = sock.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let request = String::from_utf8_lossy(&buf).to_lowercase();
                let auth = request
                    .lines()
                    .find_map(|l| l.strip_prefix("authorization: "))
                    .unwrap_or_default()
                    .to_string();
                seen.push(auth);

                let body = if page == 0 {
                    // Token rotates while the first page is in flight.
                    seed_token(&server_store, "second");
                    r#"{"items":[{"name":"01A/meta.json"}],"nextPageToken":"p2"}"#
                } else {
                    r#"{"items":[{"name":"01B/meta.json"}]}"#
                };
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
                let _ = sock.shutdown().await;
            }
            seen
        });

        let names = gcs.list("acme-thanos-lts-prod-east").await.unwrap();
        assert_eq!(names, vec!["01A/meta.json", "01B/meta.json"]);
        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["bearer first", "bearer second"]);
    }

    #[test]
    fn test_list_url() {
        let s = store("https://storage.googleapis.com");
        assert_eq!(
            s.list_url("acme-thanos-lts-prod-east"),
            "https://storage.googleapis.com/storage/v1/b/acme%2Dthanos%2Dlts%2Dprod%2Deast/o"
        );
    }

    #[test]
    fn test_download_url_encodes_slashes() {
        let s = store("http://localhost:4443/");
        assert_eq!(
            s.download_url("b", "01ABC/meta.json"),
            "http://localhost:4443/storage/v1/b/b/o/01ABC%2Fmeta%2Ejson?alt=media"
        );
    }

    #[test]
    fn test_upload_url() {
        let s = store("http://localhost:4443");
        assert_eq!(
            s.upload_url("b", "x/meta.json"),
            "http://localhost:4443/upload/storage/v1/b/b/o?uploadType=media&name=x%2Fmeta%2Ejson"
        );
    }

    #[test]
    fn test_url_encode_simple_name() {
        assert_eq!(url_encode_object_name("simple"), "simple");
    }

    #[test]
    fn test_gcs_error_parsing() {
        let err = map_gcs_error(
            "download",
            StatusCode::FORBIDDEN,
            r#"{"error":{"code":403,"message":"caller does not have storage.objects.get access"}}"#,
        );
        assert_eq!(
            err.to_string(),
            "GCS download: caller does not have storage.objects.get access (code 403)"
        );
    }

    #[test]
    fn test_gcs_error_non_json_body() {
        let err = map_gcs_error("upload", StatusCode::BAD_GATEWAY, "upstream reset");
        assert!(err.to_string().starts_with("GCS upload: HTTP 502"));
        assert!(err.to_string().ends_with("upstream reset"));
    }

    #[test]
    fn test_list_response_parsing() {
        let body = r#"{"items":[{"name":"a/meta.json"},{"name":"a/index"}],"nextPageToken":"tok"}"#;
        let parsed: GcsListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.items.unwrap().len(), 2);
        assert_eq!(parsed.next_page_token.as_deref(), Some("tok"));

        let last: GcsListResponse = serde_json::from_str("{}").unwrap();
        assert!(last.items.is_none());
        assert!(last.next_page_token.is_none());
    }

    #[test]
    fn test_token_from_json() {
        let body = serde_json::json!({"access_token": "ya29.x", "expires_in": 1799});
        assert_eq!(
            token_from_json("test", &body).unwrap(),
            ("ya29.x".to_string(), 1799)
        );

        let no_expiry = serde_json::json!({"access_token": "ya29.y"});
        assert_eq!(token_from_json("test", &no_expiry).unwrap().1, 3600);

        assert!(token_from_json("test", &serde_json::json!({})).is_err());
    }

    #[test]
    fn test_assertion_claims() {
        let claims = assertion_claims("svc@proj.iam.gserviceaccount.com", DEFAULT_TOKEN_URI, 1000);
        assert_eq!(claims.iss, "svc@proj.iam.gserviceaccount.com");
        assert_eq!(claims.aud, DEFAULT_TOKEN_URI);
        assert_eq!(claims.scope, GCS_SCOPE);
        assert_eq!(claims.exp - claims.iat, JWT_LIFETIME_SECS);
    }

    #[test]
    fn test_sign_assertion_rejects_bad_key() {
        let err = sign_assertion("svc@x", "not a pem", DEFAULT_TOKEN_URI, 0).unwrap_err();
        assert!(err.to_string().contains("Invalid service account private key"));
    }

    #[test]
    fn test_application_default_credentials_path() {
        let path = application_default_credentials_path();
        assert!(path.ends_with("application_default_credentials.json"));
    }

    #[tokio::test]
    async fn test_unsupported_credentials_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, r#"{"type":"external_account"}"#).unwrap();
        let s = store("http://localhost:4443");
        let err = s
            .token_from_credentials_file(path.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported credential type"));
    }
}
