//! # Streaming request client
//!
//! [`AsyncApiRequest`] talks to the relay backend: plain `get`/`post`/`delete` calls with a
//! bounded retry counter, plus adapters that turn a streamed response body into a sequence
//! of [`StreamItem`]s.
//!
//! - Text streams yield every non-empty decoded chunk in transport order.
//! - JSON streams buffer the body and cut it into complete JSON values, whether they are
//!   newline-delimited or sent back to back. Blank records are skipped, malformed ones are
//!   logged and dropped.
//! - A transport fault never escapes as an `Err`. It becomes one
//!   [`StreamItem::Error`] and the sequence ends there.
//!
//! [`ApiRequest`] is the blocking face of the same client, for callers that have no
//! runtime of their own (the dashboard). It owns a current-thread runtime and drives the
//! async streams from an [`Iterator`].
//!
//! ```no_run
//! use llm_relay::client::{ApiRequest, StreamItem};
//! use llm_relay::schemas::ChatRequest;
//! use std::time::Duration;
//!
//! let api = ApiRequest::new("http://127.0.0.1:7861", Duration::from_secs(300)).unwrap();
//! for item in api.chat(ChatRequest::new("hello")) {
//!     match item {
//!         StreamItem::Data(chunk) => print!("{}", chunk.text),
//!         StreamItem::Error(err) => eprintln!("{}", err.msg),
//!     }
//! }
//! ```

use std::{collections::VecDeque, fmt, future::Future, pin::Pin, time::Duration};

use futures::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use once_cell::sync::OnceCell;
use reqwest::{Method, Response};
use serde::{
    Deserialize, Serialize,
    de::{DeserializeOwned, IgnoredAny},
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::RelayConfig;
use crate::schemas::{ChatChunk, ChatRequest, ErrorRecord, FeedbackRequest};

/// Attempts made by the typed operations before giving up.
pub const DEFAULT_RETRY: u32 = 3;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the request layer itself.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} {url} failed after {attempts} attempt(s)")]
    RetriesExhausted {
        method: String,
        url: String,
        attempts: u32,
        #[source]
        source: Option<BoxError>,
    },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// One element of an adapted stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem<T> {
    Data(T),
    Error(ErrorRecord),
}

impl<T> StreamItem<T> {
    pub fn data(self) -> Option<T> {
        match self {
            StreamItem::Data(value) => Some(value),
            StreamItem::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamItem::Error(_))
    }
}

/// A transport failure that can be reported inside a stream.
pub trait TransportError: fmt::Display {
    fn to_record(&self) -> ErrorRecord;
}

impl TransportError for reqwest::Error {
    fn to_record(&self) -> ErrorRecord {
        let msg = if self.is_connect() {
            format!(
                "Unable to connect to the API server, please confirm the backend is running. ({self})"
            )
        } else if self.is_timeout() {
            format!("API communication timed out. ({self})")
        } else {
            format!("API communication encountered error: {self}")
        };
        ErrorRecord::internal(msg)
    }
}

impl TransportError for ApiError {
    fn to_record(&self) -> ErrorRecord {
        let connect = matches!(
            self,
            ApiError::RetriesExhausted { source: Some(source), .. }
                if source.downcast_ref::<reqwest::Error>().is_some_and(reqwest::Error::is_connect)
        );
        if connect {
            ErrorRecord::internal(format!(
                "Unable to connect to the API server, please confirm the backend is running. ({self})"
            ))
        } else {
            ErrorRecord::internal(format!("API communication encountered error: {self}"))
        }
    }
}

fn log_failure(verbose: bool, msg: &str, err: &(dyn std::error::Error + 'static)) {
    if verbose {
        error!(error = ?err, "{msg}");
    } else {
        error!("{msg}");
    }
}

/// Run `attempt` until it succeeds or `retry` attempts have failed.
///
/// Every failure is logged; there is no delay between attempts.
pub async fn with_retry<T, E, F, Fut>(
    method: &Method,
    url: &str,
    retry: u32,
    verbose: bool,
    mut attempt: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut remaining = retry;
    let mut attempts = 0;
    let mut last_error: Option<BoxError> = None;

    while remaining > 0 {
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                log_failure(verbose, &format!("error when {method} {url}: {err}"), &err);
                last_error = Some(Box::new(err));
                remaining -= 1;
            }
        }
    }

    Err(ApiError::RetriesExhausted {
        method: method.to_string(),
        url: url.to_string(),
        attempts,
        source: last_error,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Framing {
    Text,
    Json,
}

/// Incremental UTF-8 decoding that tolerates code points split across chunks.
#[derive(Debug, Default)]
struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete sequence at the end: keep it for the next chunk.
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => self.finish(),
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Move every complete JSON value at the front of `buf` into `ready`.
///
/// A value cut off at the end of `buf` stays there until more text arrives. Text that
/// is not JSON is cut at the next newline and passed on as its own record.
fn split_json_values(buf: &mut String, ready: &mut VecDeque<String>) {
    loop {
        let leading = buf.len() - buf.trim_start().len();
        buf.drain(..leading);
        if buf.is_empty() {
            return;
        }

        let mut values = serde_json::Deserializer::from_str(buf.as_str()).into_iter::<IgnoredAny>();
        let end = match values.next() {
            Some(Ok(_)) => values.byte_offset(),
            Some(Err(err)) if err.is_eof() => return,
            _ => match buf.find('\n') {
                Some(pos) => pos + 1,
                None => return,
            },
        };
        ready.push_back(buf[..end].trim().to_string());
        buf.drain(..end);
    }
}

/// Splits a chunked body into records according to the framing.
struct ChunkReader<S> {
    chunks: Pin<Box<S>>,
    framing: Framing,
    utf8: Utf8Buffer,
    lines: String,
    ready: VecDeque<String>,
    finished: bool,
}

impl<S, B, E> ChunkReader<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: TransportError,
{
    fn new(chunks: S, framing: Framing) -> Self {
        Self {
            chunks: Box::pin(chunks),
            framing,
            utf8: Utf8Buffer::default(),
            lines: String::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    fn frame(&mut self, text: String) {
        match self.framing {
            Framing::Text => {
                if !text.is_empty() {
                    self.ready.push_back(text);
                }
            }
            Framing::Json => {
                self.lines.push_str(&text);
                split_json_values(&mut self.lines, &mut self.ready);
            }
        }
    }

    fn flush(&mut self) {
        let tail = self.utf8.finish();
        self.frame(tail);
        // Whatever is left never completed; hand it on line by line to be logged.
        for line in self.lines.lines() {
            let record = line.trim();
            if !record.is_empty() {
                self.ready.push_back(record.to_string());
            }
        }
        self.lines.clear();
    }

    async fn next_record(&mut self) -> Option<Result<String, ErrorRecord>> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(Ok(record));
            }
            if self.finished {
                return None;
            }
            match self.chunks.next().await {
                Some(Ok(bytes)) => {
                    let text = self.utf8.push(bytes.as_ref());
                    self.frame(text);
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err.to_record()));
                }
                None => {
                    self.finished = true;
                    self.flush();
                }
            }
        }
    }
}

fn records<S, B, E>(chunks: S, framing: Framing) -> impl Stream<Item = Result<String, ErrorRecord>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: TransportError,
{
    stream::unfold(ChunkReader::new(chunks, framing), |mut reader| async move {
        let record = reader.next_record().await?;
        Some((record, reader))
    })
}

/// Adapt a chunk stream into non-empty text pieces.
pub fn text_items<S, B, E>(chunks: S) -> impl Stream<Item = StreamItem<String>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: TransportError,
{
    records(chunks, Framing::Text).map(|record| match record {
        Ok(text) => StreamItem::Data(text),
        Err(err) => {
            error!("{}", err.msg);
            StreamItem::Error(err)
        }
    })
}

/// Adapt a chunk stream of JSON values into parsed records.
pub fn json_items<T, S, B, E>(chunks: S) -> impl Stream<Item = StreamItem<T>>
where
    T: DeserializeOwned,
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: TransportError,
{
    records(chunks, Framing::Json).filter_map(|record| async move {
        match record {
            Ok(line) => match serde_json::from_str::<T>(&line) {
                Ok(value) => Some(StreamItem::Data(value)),
                Err(err) => {
                    error!("API returned an invalid JSON record: '{line}' ({err})");
                    None
                }
            },
            Err(err) => {
                error!("{}", err.msg);
                Some(StreamItem::Error(err))
            }
        }
    })
}

/// Read the body of a failed response as an error record.
async fn status_record(response: Response) -> ErrorRecord {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let msg = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("msg").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("API returned status {status}: {body}"));
    error!(status = %status, "{msg}");
    ErrorRecord {
        code: status.as_u16(),
        msg,
    }
}

/// One line of the `/chat` body: a chunk, or the error marker that ends a failed answer.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum ChatLine {
    Chunk(ChatChunk),
    Failure(ErrorRecord),
}

/// Async client for the relay backend.
///
/// Cloning is cheap once connected: clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct AsyncApiRequest {
    base_url: String,
    timeout: Duration,
    log_verbose: bool,
    client: OnceCell<reqwest::Client>,
}

impl AsyncApiRequest {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            log_verbose: false,
            client: OnceCell::new(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.api_address.clone(), config.http_timeout())
            .with_log_verbose(config.log_verbose)
    }

    pub fn with_log_verbose(mut self, log_verbose: bool) -> Self {
        self.log_verbose = log_verbose;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The shared HTTP client, created on first use.
    pub fn client(&self) -> Result<&reqwest::Client, ApiError> {
        self.client.get_or_try_init(|| {
            debug!(base_url = %self.base_url, "creating http client");
            reqwest::Client::builder()
                .connect_timeout(self.timeout)
                .read_timeout(self.timeout)
                .build()
                .map_err(ApiError::Client)
        })
    }

    pub fn is_connected(&self) -> bool {
        self.client.get().is_some()
    }

    /// Drop the HTTP client; the next call creates a new one.
    pub fn close(&mut self) {
        self.client.take();
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<B, Q>(
        &self,
        method: Method,
        path: &str,
        params: Option<&Q>,
        json: Option<&B>,
        retry: u32,
    ) -> Result<Response, ApiError>
    where
        B: Serialize + ?Sized,
        Q: Serialize + ?Sized,
    {
        let client = self.client()?;
        let url = self.url(path);
        with_retry(&method, &url, retry, self.log_verbose, || {
            let mut request = client.request(method.clone(), &url);
            if let Some(params) = params {
                request = request.query(params);
            }
            if let Some(json) = json {
                request = request.json(json);
            }
            request.send()
        })
        .await
    }

    pub async fn get<Q: Serialize + ?Sized>(
        &self,
        path: &str,
        params: Option<&Q>,
        retry: u32,
    ) -> Result<Response, ApiError> {
        self.send::<(), Q>(Method::GET, path, params, None, retry).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        json: Option<&B>,
        retry: u32,
    ) -> Result<Response, ApiError> {
        self.send::<B, ()>(Method::POST, path, None, json, retry).await
    }

    pub async fn delete<B: Serialize + ?Sized>(
        &self,
        path: &str,
        json: Option<&B>,
        retry: u32,
    ) -> Result<Response, ApiError> {
        self.send::<B, ()>(Method::DELETE, path, None, json, retry).await
    }

    /// Yield the response body as text chunks.
    pub fn stream_text(&self, response: Response) -> BoxStream<'static, StreamItem<String>> {
        stream::once(async move {
            if !response.status().is_success() {
                let err = status_record(response).await;
                return stream::iter([StreamItem::Error(err)]).boxed();
            }
            text_items(response.bytes_stream()).boxed()
        })
        .flatten()
        .boxed()
    }

    /// Yield the response body as parsed JSON records.
    pub fn stream_json<T>(&self, response: Response) -> BoxStream<'static, StreamItem<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        stream::once(async move {
            if !response.status().is_success() {
                let err = status_record(response).await;
                return stream::iter([StreamItem::Error(err)]).boxed();
            }
            json_items(response.bytes_stream()).boxed()
        })
        .flatten()
        .boxed()
    }

    /// Parse a non-streaming body, falling back to an error envelope.
    pub async fn response_json(&self, response: Response) -> Value {
        match response.json::<Value>().await {
            Ok(value) => value,
            Err(err) => {
                let msg = format!("API failed to return correct JSON. {err}");
                log_failure(self.log_verbose, &msg, &err);
                json!({"code": 500, "msg": msg, "data": null})
            }
        }
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Value {
        match self.post(path, body, DEFAULT_RETRY).await {
            Ok(response) => self.response_json(response).await,
            Err(err) => {
                let record = err.to_record();
                json!({"code": record.code, "msg": record.msg, "data": null})
            }
        }
    }

    /// Send one chat turn and stream the answer.
    ///
    /// The request is issued when the stream is first polled.
    pub fn chat(&self, request: ChatRequest) -> BoxStream<'static, StreamItem<ChatChunk>> {
        let this = self.clone();
        stream::once(async move {
            debug!(query = %request.query, conversation_id = %request.conversation_id, "chat");
            match this.post("/chat", Some(&request), DEFAULT_RETRY).await {
                Ok(response) => this
                    .stream_json::<ChatLine>(response)
                    .map(|item| match item {
                        StreamItem::Data(ChatLine::Chunk(chunk)) => StreamItem::Data(chunk),
                        StreamItem::Data(ChatLine::Failure(err)) => StreamItem::Error(err),
                        StreamItem::Error(err) => StreamItem::Error(err),
                    })
                    .boxed(),
                Err(err) => {
                    let record = err.to_record();
                    error!("{}", record.msg);
                    stream::iter([StreamItem::Error(record)]).boxed()
                }
            }
        })
        .flatten()
        .boxed()
    }

    /// Rate an answer.
    pub async fn chat_feedback(&self, message_id: &str, score: i32, reason: &str) -> Value {
        let body = FeedbackRequest {
            message_id: message_id.to_string(),
            score,
            reason: reason.to_string(),
        };
        self.post_json("/chat/feedback", Some(&body)).await
    }

    /// Call the demo write endpoint.
    pub async fn add_message_demo(&self) -> Value {
        self.post_json::<()>("/message", None).await
    }
}

/// Iterator over an async stream, driven by a borrowed runtime.
pub struct BlockingStream<'a, T> {
    runtime: &'a tokio::runtime::Runtime,
    stream: BoxStream<'static, T>,
}

impl<T> Iterator for BlockingStream<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.runtime.block_on(self.stream.next())
    }
}

/// Blocking adapter over [`AsyncApiRequest`].
pub struct ApiRequest {
    inner: AsyncApiRequest,
    runtime: tokio::runtime::Runtime,
}

impl ApiRequest {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        Self::from_async(AsyncApiRequest::new(base_url, timeout))
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, ApiError> {
        Self::from_async(AsyncApiRequest::from_config(config))
    }

    fn from_async(inner: AsyncApiRequest) -> Result<Self, ApiError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { inner, runtime })
    }

    pub fn inner(&self) -> &AsyncApiRequest {
        &self.inner
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn get<Q: Serialize + ?Sized>(
        &self,
        path: &str,
        params: Option<&Q>,
        retry: u32,
    ) -> Result<Response, ApiError> {
        self.runtime.block_on(self.inner.get(path, params, retry))
    }

    pub fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        json: Option<&B>,
        retry: u32,
    ) -> Result<Response, ApiError> {
        self.runtime.block_on(self.inner.post(path, json, retry))
    }

    pub fn delete<B: Serialize + ?Sized>(
        &self,
        path: &str,
        json: Option<&B>,
        retry: u32,
    ) -> Result<Response, ApiError> {
        self.runtime.block_on(self.inner.delete(path, json, retry))
    }

    pub fn stream_text(&self, response: Response) -> BlockingStream<'_, StreamItem<String>> {
        BlockingStream {
            runtime: &self.runtime,
            stream: self.inner.stream_text(response),
        }
    }

    pub fn stream_json<T>(&self, response: Response) -> BlockingStream<'_, StreamItem<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        BlockingStream {
            runtime: &self.runtime,
            stream: self.inner.stream_json(response),
        }
    }

    pub fn response_json(&self, response: Response) -> Value {
        self.runtime.block_on(self.inner.response_json(response))
    }

    pub fn chat(&self, request: ChatRequest) -> BlockingStream<'_, StreamItem<ChatChunk>> {
        BlockingStream {
            runtime: &self.runtime,
            stream: self.inner.chat(request),
        }
    }

    pub fn chat_feedback(&self, message_id: &str, score: i32, reason: &str) -> Value {
        self.runtime
            .block_on(self.inner.chat_feedback(message_id, score, reason))
    }

    pub fn add_message_demo(&self) -> Value {
        self.runtime.block_on(self.inner.add_message_demo())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeTimeout;

    impl fmt::Display for FakeTimeout {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "read timed out")
        }
    }

    impl std::error::Error for FakeTimeout {}

    impl TransportError for FakeTimeout {
        fn to_record(&self) -> ErrorRecord {
            ErrorRecord::internal(format!("API communication timed out. ({self})"))
        }
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], FakeTimeout>> {
        stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_text_stream_preserves_order_and_skips_empty_chunks() {
        let items: Vec<_> = text_items(chunks(&["a", "", "b", "", "c"])).collect().await;
        assert_eq!(
            items,
            vec![
                StreamItem::Data("a".to_string()),
                StreamItem::Data("b".to_string()),
                StreamItem::Data("c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_text_stream_joins_split_code_points() {
        let bytes = "é".as_bytes();
        let parts: Vec<Result<Vec<u8>, FakeTimeout>> =
            vec![Ok(vec![bytes[0]]), Ok(vec![bytes[1]]), Ok(b"!".to_vec())];
        let items: Vec<_> = text_items(stream::iter(parts)).collect().await;
        assert_eq!(
            items,
            vec![
                StreamItem::Data("é".to_string()),
                StreamItem::Data("!".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_json_stream_reassembles_records_across_chunks() {
        let items: Vec<StreamItem<ChatChunk>> = json_items(chunks(&[
            "{\"text\":\"Hi\"}\n{\"te",
            "xt\":\" there\",\"message_id\":\"abc\"}",
        ]))
        .collect()
        .await;

        assert_eq!(
            items,
            vec![
                StreamItem::Data(ChatChunk {
                    text: "Hi".to_string(),
                    message_id: None
                }),
                StreamItem::Data(ChatChunk {
                    text: " there".to_string(),
                    message_id: Some("abc".to_string())
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_json_stream_parses_one_object_per_chunk_without_newlines() {
        let items: Vec<StreamItem<ChatChunk>> = json_items(chunks(&[
            "{\"text\":\"Hi\"}",
            "{\"text\":\" there\",\"message_id\":\"abc\"}",
        ]))
        .collect()
        .await;

        assert_eq!(
            items,
            vec![
                StreamItem::Data(ChatChunk {
                    text: "Hi".to_string(),
                    message_id: None
                }),
                StreamItem::Data(ChatChunk {
                    text: " there".to_string(),
                    message_id: Some("abc".to_string())
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_json_stream_splits_back_to_back_objects_in_one_chunk() {
        let items: Vec<StreamItem<Value>> =
            json_items(chunks(&["{\"n\":1}{\"n\":2}{\"n\"", ":3}"]))
                .collect()
                .await;
        assert_eq!(
            items,
            vec![
                StreamItem::Data(json!({"n": 1})),
                StreamItem::Data(json!({"n": 2})),
                StreamItem::Data(json!({"n": 3})),
            ]
        );
    }

    #[tokio::test]
    async fn test_json_stream_drops_unterminated_tail() {
        let items: Vec<StreamItem<Value>> = json_items(chunks(&["{\"n\":1}\n{\"n\":"]))
            .collect()
            .await;
        assert_eq!(items, vec![StreamItem::Data(json!({"n": 1}))]);
    }

    #[tokio::test]
    async fn test_json_stream_drops_malformed_and_blank_records() {
        let items: Vec<StreamItem<Value>> =
            json_items(chunks(&["{\"n\":1}\n\n", "not json\n", "  \n{\"n\":2}\n"]))
                .collect()
                .await;
        assert_eq!(
            items,
            vec![
                StreamItem::Data(json!({"n": 1})),
                StreamItem::Data(json!({"n": 2})),
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_mid_stream_yields_one_error_and_ends() {
        let parts: Vec<Result<&'static [u8], FakeTimeout>> = vec![
            Ok(b"{\"n\":1}\n"),
            Err(FakeTimeout),
            Ok(b"{\"n\":2}\n"),
        ];
        let items: Vec<StreamItem<Value>> = json_items(stream::iter(parts)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], StreamItem::Data(json!({"n": 1})));
        match &items[1] {
            StreamItem::Error(err) => {
                assert_eq!(err.code, 500);
                assert!(err.msg.contains("timed out"));
            }
            other => panic!("expected error item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_with_retry_attempts_exactly_retry_times() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> =
            with_retry(&Method::POST, "http://x/chat", 3, false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FakeTimeout) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ApiError::RetriesExhausted {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_some());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_with_retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&Method::GET, "http://x/", 3, false, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(FakeTimeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_against_closed_port_exhausts_retries() {
        let api = AsyncApiRequest::new(closed_port_url(), Duration::from_secs(2));
        let result = api.get::<()>("/", None, 3).await;
        assert!(matches!(
            result,
            Err(ApiError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_against_closed_port_exhausts_retries() {
        let api = AsyncApiRequest::new(closed_port_url(), Duration::from_secs(2));
        let body = json!({"message_id": "abc"});
        let result = api.delete("/message", Some(&body), 3).await;
        assert!(matches!(
            result,
            Err(ApiError::RetriesExhausted { attempts: 3, ref method, .. }) if method.as_str() == "DELETE"
        ));
    }

    #[tokio::test]
    async fn test_stream_text_over_response_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tokens");
                then.status(200).body("Hello, world");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/empty");
                then.status(200).body("");
            })
            .await;

        let api = AsyncApiRequest::new(server.base_url(), Duration::from_secs(5));
        let response = api.get::<()>("/tokens", None, 1).await.unwrap();
        let items: Vec<_> = api.stream_text(response).collect().await;
        assert!(!items.is_empty());
        let text: String = items
            .into_iter()
            .map(|item| item.data().expect("data item"))
            .inspect(|piece| assert!(!piece.is_empty()))
            .collect();
        assert_eq!(text, "Hello, world");

        let response = api.get::<()>("/empty", None, 1).await.unwrap();
        let items: Vec<_> = api.stream_text(response).collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_stream_text_non_success_status_is_one_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tokens");
                then.status(503).body("unavailable");
            })
            .await;

        let api = AsyncApiRequest::new(server.base_url(), Duration::from_secs(5));
        let response = api.get::<()>("/tokens", None, 1).await.unwrap();
        let items: Vec<_> = api.stream_text(response).collect().await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Error(err) => assert_eq!(err.code, 503),
            other => panic!("expected error item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_yields_chunks_in_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat")
                    .json_body(serde_json::to_value(ChatRequest::new("hello")).unwrap());
                then.status(200).body(
                    "{\"text\":\"Hi\"}\n{\"text\":\" there\",\"message_id\":\"abc\"}\n",
                );
            })
            .await;

        let api = AsyncApiRequest::new(server.base_url(), Duration::from_secs(5));
        let items: Vec<_> = api.chat(ChatRequest::new("hello")).collect().await;

        mock.assert_async().await;
        assert_eq!(
            items,
            vec![
                StreamItem::Data(ChatChunk {
                    text: "Hi".to_string(),
                    message_id: None
                }),
                StreamItem::Data(ChatChunk {
                    text: " there".to_string(),
                    message_id: Some("abc".to_string())
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_error_marker_becomes_error_item() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat");
                then.status(200).body(
                    "{\"text\":\"par\",\"message_id\":\"m\"}\n{\"code\":500,\"msg\":\"provider down\"}\n",
                );
            })
            .await;

        let api = AsyncApiRequest::new(server.base_url(), Duration::from_secs(5));
        let items: Vec<_> = api.chat(ChatRequest::new("hello")).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            StreamItem::Error(ErrorRecord::internal("provider down"))
        );
    }

    #[tokio::test]
    async fn test_chat_connect_failure_yields_exactly_one_error() {
        let api = AsyncApiRequest::new(closed_port_url(), Duration::from_secs(2));
        let items: Vec<_> = api.chat(ChatRequest::new("hello")).collect().await;

        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Error(err) => {
                assert_eq!(err.code, 500);
                assert!(err.msg.contains("Unable to connect"), "{}", err.msg);
            }
            other => panic!("expected error item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_success_status_yields_error_with_envelope_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat");
                then.status(404)
                    .json_body(json!({"code": 404, "msg": "template missing", "data": null}));
            })
            .await;

        let api = AsyncApiRequest::new(server.base_url(), Duration::from_secs(5));
        let items: Vec<_> = api.chat(ChatRequest::new("hello")).collect().await;
        assert_eq!(
            items,
            vec![StreamItem::Error(ErrorRecord {
                code: 404,
                msg: "template missing".to_string()
            })]
        );
    }

    #[tokio::test]
    async fn test_response_json_falls_back_to_error_envelope() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/message");
                then.status(200).body("<html>oops</html>");
            })
            .await;

        let api = AsyncApiRequest::new(server.base_url(), Duration::from_secs(5));
        let value = api.add_message_demo().await;
        assert_eq!(value["code"], 500);
        assert!(value["data"].is_null());
        assert!(
            value["msg"]
                .as_str()
                .unwrap()
                .starts_with("API failed to return correct JSON.")
        );
    }

    #[tokio::test]
    async fn test_client_is_lazy_and_recreated_after_close() {
        let mut api = AsyncApiRequest::new("http://127.0.0.1:1", Duration::from_secs(1));
        assert!(!api.is_connected());
        api.client().unwrap();
        assert!(api.is_connected());
        api.close();
        assert!(!api.is_connected());
        api.client().unwrap();
        assert!(api.is_connected());
    }

    #[test]
    fn test_blocking_chat_iterates_chunks() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(200)
                .body("{\"text\":\"Hi\"}\n\n{\"text\":\" there\",\"message_id\":\"abc\"}");
        });

        let api = ApiRequest::new(server.base_url(), Duration::from_secs(5)).unwrap();
        let texts: Vec<String> = api
            .chat(ChatRequest::new("hello"))
            .filter_map(StreamItem::data)
            .map(|chunk| chunk.text)
            .collect();
        assert_eq!(texts, vec!["Hi".to_string(), " there".to_string()]);
    }

    #[test]
    fn test_blocking_feedback_returns_envelope() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/chat/feedback")
                .json_body(json!({"message_id": "abc", "score": 80, "reason": "good"}));
            then.status(200).json_body(
                json!({"code": 200, "msg": "success", "data": {"message_id": "abc"}}),
            );
        });

        let api = ApiRequest::new(server.base_url(), Duration::from_secs(5)).unwrap();
        let value = api.chat_feedback("abc", 80, "good");
        assert_eq!(value["code"], 200);
        assert_eq!(value["data"]["message_id"], "abc");
    }
}
