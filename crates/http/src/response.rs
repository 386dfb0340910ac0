//! Serializable snapshot of an HTTP response

use axum::body::{Body, Bytes, HttpBody};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default limit on how much of a response body is buffered for caching
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// A fully buffered response that can be stored in a cache and replayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub body: Vec<u8>,
}

/// Result of buffering a response for storage
#[derive(Debug)]
pub enum Capture {
    Complete(CachedResponse),
    /// The body outgrew the limit; the response still streams in full but
    /// is not stored
    Oversized(Response),
}

fn to_base64<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(body))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64.decode(encoded).map_err(serde::de::Error::custom)
}

impl CachedResponse {
    /// Buffer a response body, keeping status and textual headers
    ///
    /// Framing headers are dropped; they are recomputed on replay. Bodies
    /// larger than `limit` come back as [`Capture::Oversized`] with the bytes
    /// read so far stitched back in front of the rest of the stream.
    pub async fn capture(response: Response, limit: usize) -> Result<Capture, axum::Error> {
        let (parts, body) = response.into_parts();
        if HttpBody::size_hint(&body).lower() > limit as u64 {
            return Ok(Capture::Oversized(Response::from_parts(parts, body)));
        }

        let mut stream = body.into_data_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total = total.saturating_add(chunk.len());
            chunks.push(chunk);
            if total > limit {
                let read = futures::stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                let body = Body::from_stream(read.chain(stream));
                return Ok(Capture::Oversized(Response::from_parts(parts, body)));
            }
        }
        let body = chunks.concat();

        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| {
                **name != header::CONTENT_LENGTH && **name != header::TRANSFER_ENCODING
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Ok(Capture::Complete(Self {
            status: parts.status.as_u16(),
            headers,
            body,
        }))
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn is_success(&self) -> bool {
        self.status_code().is_success()
    }

    /// Rebuild a response; headers that no longer parse are skipped
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status_code();
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn test_capture_and_replay() {
        let original = (
            StatusCode::CREATED,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"ok":true}"#,
        )
            .into_response();

        let Capture::Complete(cached) = CachedResponse::capture(original, MAX_BODY_SIZE)
            .await
            .unwrap()
        else {
            panic!("small body should be buffered");
        };
        assert_eq!(cached.status, 201);
        assert!(cached
            .headers
            .iter()
            .any(|(k, v)| k == "content-type" && v == "application/json"));
        assert!(!cached.headers.iter().any(|(k, _)| k == "content-length"));

        let stored = serde_json::to_string(&cached).unwrap();
        let restored: CachedResponse = serde_json::from_str(&stored).unwrap();
        assert_eq!(restored, cached);

        let replayed = restored.to_response();
        assert_eq!(replayed.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(replayed.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"ok":true}"#);
    }

    async fn oversized_body(response: Response) -> String {
        let Capture::Oversized(response) = CachedResponse::capture(response, 8).await.unwrap()
        else {
            panic!("body over the limit should not be buffered");
        };
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_capture_passes_oversized_bodies_through() {
        let sized = "x".repeat(64).into_response();
        assert_eq!(oversized_body(sized).await, "x".repeat(64));

        // No length hint, so the limit trips partway through the stream
        let chunks = ["abcd", "efgh", "ijkl", "mnop"]
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes())));
        let streamed = Response::new(Body::from_stream(futures::stream::iter(chunks)));
        assert_eq!(oversized_body(streamed).await, "abcdefghijklmnop");
    }
}
