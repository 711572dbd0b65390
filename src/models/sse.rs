use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::{AdapterError, AdapterResult};

/// One server-sent event: the optional `event:` name and its joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

type RawEvents = BoxStream<'static, Result<eventsource_stream::Event, EventStreamError<reqwest::Error>>>;

/// Incremental SSE reader over a streaming HTTP response body.
pub struct SseReader {
    provider: String,
    events: RawEvents,
}

impl SseReader {
    pub fn new(provider: impl Into<String>, response: reqwest::Response) -> Self {
        Self {
            provider: provider.into(),
            events: response.bytes_stream().eventsource().boxed(),
        }
    }

    /// Next complete event, or `None` at end of body.
    pub async fn next_event(&mut self) -> AdapterResult<Option<SseEvent>> {
        match self.events.next().await {
            None => Ok(None),
            Some(Ok(raw)) => {
                // Unnamed events surface as the default `message` type.
                let event = match raw.event.as_str() {
                    "" | "message" => None,
                    _ => Some(raw.event),
                };
                Ok(Some(SseEvent { event, data: raw.data }))
            }
            Some(Err(EventStreamError::Transport(e))) => Err(AdapterError::from_transport(&self.provider, &e)),
            Some(Err(e)) => Err(AdapterError::invalid_response(
                &self.provider,
                format!("Malformed event stream: {}", e),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn reader_for(body: &'static str) -> (MockServer, SseReader) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();
        (server, SseReader::new("test", response))
    }

    #[tokio::test]
    async fn test_reads_named_and_unnamed_events() {
        let (_server, mut reader) = reader_for(
            ": keep-alive\r\n\
             event: message_start\r\n\
             data: {\"a\":1}\r\n\
             \r\n\
             data: first\n\
             data: second\n\
             \n\
             data: [DONE]\n\n",
        )
        .await;

        let first = reader.next_event().await.unwrap().unwrap();
        assert_eq!(first.event.as_deref(), Some("message_start"));
        assert_eq!(first.data, "{\"a\":1}");

        let second = reader.next_event().await.unwrap().unwrap();
        assert_eq!(second.event, None);
        assert_eq!(second.data, "first\nsecond");

        let last = reader.next_event().await.unwrap().unwrap();
        assert_eq!(last.data, "[DONE]");

        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data: \xff\xfe\n\n".to_vec()))
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();
        let mut reader = SseReader::new("test", response);

        let err = reader.next_event().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidResponse);
    }
}
