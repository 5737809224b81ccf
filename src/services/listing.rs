// src/services/listing.rs

//! Paged student listing endpoint.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::error::{FetchError, Result};
use crate::models::{BearerToken, Config, ListingPayload, StudentRecord};
use crate::utils::http;

/// One page of students for one school.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetch the 1-based `page` of `school_id`. An empty vector means the
    /// listing is exhausted.
    async fn fetch_page(
        &self,
        token: &BearerToken,
        school_id: &str,
        page: u32,
    ) -> std::result::Result<Vec<StudentRecord>, FetchError>;
}

/// Listing endpoint over HTTP.
///
/// `GET <listing_url>?page=N&pageSize=S&anoLetivoId=<term>&escolaId=<school>`
/// with a bearer token.
pub struct HttpListingSource {
    client: Client,
    listing_url: String,
    academic_year_id: String,
    page_size: u32,
}

impl HttpListingSource {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: http::create_async_client(&config.portal)?,
            listing_url: config.portal.listing_url.clone(),
            academic_year_id: config.portal.academic_year_id.clone(),
            page_size: config.harvest.page_size,
        })
    }

    fn query(&self, school_id: &str, page: u32) -> [(&'static str, String); 4] {
        [
            ("page", page.to_string()),
            ("pageSize", self.page_size.to_string()),
            ("anoLetivoId", self.academic_year_id.clone()),
            ("escolaId", school_id.to_string()),
        ]
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_page(
        &self,
        token: &BearerToken,
        school_id: &str,
        page: u32,
    ) -> std::result::Result<Vec<StudentRecord>, FetchError> {
        let response = self
            .client
            .get(&self.listing_url)
            .query(&self.query(school_id, page))
            .bearer_auth(token.as_str())
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        Ok(ListingPayload::from_json(&body)?.into_records())
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Answer one request with a canned response; yields the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{addr}/api/alunos"), handle)
    }

    fn source_for(url: String) -> HttpListingSource {
        let mut config = Config::default();
        config.portal.listing_url = url;
        config.portal.academic_year_id = "term-1".to_string();
        config.portal.timeout_secs = 5;
        config.harvest.page_size = 100;
        HttpListingSource::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_nested_page_with_bearer_and_query() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"data":{"data":[{"matricula":"M1","nome":"Ana","turmaNome":"1A","turnoNome":"Tarde","dataNascimento":"2010-01-01"}],"total":1}}"#,
        )
        .await;
        let token = BearerToken::sanitize("tok-123").unwrap();

        let records = source_for(url).fetch_page(&token, "S9", 2).await.unwrap();
        let request = server.await.unwrap().to_lowercase();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].matriculation_id, "M1");
        assert_eq!(records[0].class, "1A");
        assert!(request.starts_with(
            "get /api/alunos?page=2&pagesize=100&anoletivoid=term-1&escolaid=s9 http/1.1"
        ));
        assert!(request.contains("authorization: bearer tok-123"));
    }

    #[tokio::test]
    async fn test_non_200_is_explicit_status_error() {
        let (url, server) = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let token = BearerToken::sanitize("t").unwrap();

        let err = source_for(url).fetch_page(&token, "1", 1).await.unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, FetchError::Status(503)));
        assert!(err.is_explicit());
    }

    #[tokio::test]
    async fn test_html_body_is_decode_error() {
        let (url, server) = serve_once("200 OK", "<html>login</html>").await;
        let token = BearerToken::sanitize("t").unwrap();

        let err = source_for(url).fetch_page(&token, "1", 1).await.unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, FetchError::Decode(_)));
        assert!(!err.is_explicit());
    }

    #[test]
    fn test_query_parameters() {
        let mut config = Config::default();
        config.harvest.page_size = 100;
        config.portal.academic_year_id = "term-1".to_string();
        let source = HttpListingSource::new(&config).unwrap();

        let query = source.query("school-9", 3);
        assert_eq!(query[0], ("page", "3".to_string()));
        assert_eq!(query[1], ("pageSize", "100".to_string()));
        assert_eq!(query[2], ("anoLetivoId", "term-1".to_string()));
        assert_eq!(query[3], ("escolaId", "school-9".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let mut config = Config::default();
        config.portal.listing_url = "http://127.0.0.1:1/api/".to_string();
        config.portal.timeout_secs = 2;
        let source = HttpListingSource::new(&config).unwrap();
        let token = BearerToken::sanitize("t").unwrap();

        let err = source.fetch_page(&token, "1", 1).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert!(!err.is_explicit());
    }
}
