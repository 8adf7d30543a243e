//! Request/response session over a pair of byte streams.
//!
//! Requests arrive as newline-delimited JSON. A decode task parses them one
//! at a time into a single-slot channel; the dispatch loop spawns a handler
//! per request and every handler writes exactly one response through a
//! shared, serialized sink.
//!
//! Termination:
//! - end of input drains every in-flight handler;
//! - a malformed record stops decoding, drains, then returns
//!   [`SessionError::ProtocolDecode`];
//! - cancellation, including during one of the drains above, waits up to
//!   `drain_grace` and aborts the rest.

mod handler;
mod protocol;

pub use handler::{
    read_tags, stage_dockerfile, stage_dockerfile_strict, BuildHandler, RequestError, RequestHandler, DOCKERFILE_OPTION,
    FQN_TAGS_FILE_OPTION, IMAGE_OUT_OPTION,
};
pub use protocol::{BuildRequest, BuildResponse};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Session-ending failures. Request-level failures never surface here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not decode request {line:?}: {source}")]
    ProtocolDecode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not read requests: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Builds running at once against the backend. `0` means unbounded.
    pub max_concurrent_builds: usize,
    /// How long in-flight handlers may run after cancellation.
    pub drain_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 8,
            drain_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Requests decoded and dispatched
    pub accepted: u64,
    /// Responses fully written
    pub written: u64,
}

/// Serializes responses so concurrent handlers never interleave writes.
struct ResponseSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> ResponseSink<W> {
    async fn write(&self, response: &BuildResponse) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(response).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

enum Termination {
    InputClosed,
    Cancelled,
}

pub struct Session<R, W> {
    reader: R,
    writer: W,
    handler: Arc<dyn RequestHandler>,
    opts: SessionOptions,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, handler: Arc<dyn RequestHandler>, opts: SessionOptions) -> Self {
        Self {
            reader,
            writer,
            handler,
            opts,
        }
    }

    pub async fn run(self, cancel: &CancellationToken) -> Result<SessionSummary, SessionError> {
        let opts = self.opts;
        self.serve(cancel)
            .instrument(tracing::info_span!(
                "session",
                max_concurrent_builds = opts.max_concurrent_builds
            ))
            .await
    }

    async fn serve(self, cancel: &CancellationToken) -> Result<SessionSummary, SessionError> {
        let (tx, mut rx) = mpsc::channel::<BuildRequest>(1);
        // Independent of `cancel`: the decoder only ends early when told to
        // after the dispatch loop has decided how the session terminates.
        let stop_decoding = CancellationToken::new();
        let decoder = tokio::spawn(decode(self.reader, tx, stop_decoding.clone()).in_current_span());

        let sink = Arc::new(ResponseSink {
            writer: Mutex::new(self.writer),
        });
        let permits = (self.opts.max_concurrent_builds > 0)
            .then(|| Arc::new(Semaphore::new(self.opts.max_concurrent_builds)));

        let mut handlers: JoinSet<bool> = JoinSet::new();
        let mut summary = SessionSummary::default();

        tracing::info!("session started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(request) => {
                        summary.accepted += 1;
                        let span = tracing::info_span!("request", rule = %request.rule);
                        handlers.spawn(
                            handle_one(
                                request,
                                Arc::clone(&self.handler),
                                Arc::clone(&sink),
                                permits.clone(),
                                cancel.clone(),
                            )
                            .instrument(span),
                        );
                    }
                    None => break,
                },
            }
        }
        drop(rx);

        let termination = if cancel.is_cancelled() {
            Termination::Cancelled
        } else {
            Termination::InputClosed
        };

        let grace = self.opts.drain_grace;
        let decoded = match termination {
            Termination::InputClosed => {
                // Cancellation during the drain still bounds it by the grace period.
                let drained = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = drain(&mut handlers, &mut summary) => true,
                };
                if !drained {
                    drain_within(grace, &mut handlers, &mut summary).await;
                }
                match decoder.await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(error = %e, "decode task failed");
                        Ok(())
                    }
                }
            }
            Termination::Cancelled => {
                stop_decoding.cancel();
                decoder.abort();
                drain_within(grace, &mut handlers, &mut summary).await;
                Ok(())
            }
        };

        tracing::info!(
            accepted = summary.accepted,
            written = summary.written,
            "session finished"
        );
        decoded.map(|()| summary)
    }
}

/// Reads records until EOF, a malformed record or cancellation.
async fn decode<R>(
    reader: R,
    tx: mpsc::Sender<BuildRequest>,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_until(b'\n', &mut line) => read?,
        };
        if read == 0 {
            tracing::debug!("request stream closed");
            return Ok(());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let request: BuildRequest = match serde_json::from_slice(&line) {
            Ok(request) => request,
            Err(source) => {
                tracing::error!(error = %source, "could not decode request");
                let line = String::from_utf8_lossy(&line).trim_end().to_string();
                return Err(SessionError::ProtocolDecode { line, source });
            }
        };

        if tx.send(request).await.is_err() {
            return Ok(());
        }
    }
}

/// Runs the handler and writes its response. Returns whether the response
/// reached the sink.
async fn handle_one<W>(
    request: BuildRequest,
    handler: Arc<dyn RequestHandler>,
    sink: Arc<ResponseSink<W>>,
    permits: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) -> bool
where
    W: AsyncWrite + Unpin + Send,
{
    let _permit = match permits {
        Some(permits) => permits.acquire_owned().await.ok(),
        None => None,
    };

    tracing::info!("handling request");
    let response = match handler.handle(&request, &cancel).await {
        Ok(()) => {
            tracing::info!("request succeeded");
            BuildResponse::success(&request.rule)
        }
        Err(e) => {
            tracing::error!(error = %e, "request failed");
            BuildResponse::failure(&request.rule, vec![e.to_string()])
        }
    };

    match sink.write(&response).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "could not write response");
            false
        }
    }
}

async fn drain(handlers: &mut JoinSet<bool>, summary: &mut SessionSummary) {
    while let Some(joined) = handlers.join_next().await {
        match joined {
            Ok(true) => summary.written += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "request handler panicked"),
        }
    }
}

/// Drains for at most `grace`, then aborts whatever is still running.
async fn drain_within(grace: Duration, handlers: &mut JoinSet<bool>, summary: &mut SessionSummary) {
    if tokio::time::timeout(grace, drain(handlers, summary)).await.is_err() {
        tracing::warn!(
            remaining = handlers.len(),
            grace = ?grace,
            "handlers still running after drain grace, aborting"
        );
        handlers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(
            &self,
            request: &BuildRequest,
            _cancel: &CancellationToken,
        ) -> Result<(), RequestError> {
            if request.test {
                request.option("--required").map(|_| ())
            } else {
                Ok(())
            }
        }
    }

    async fn run_session(
        input: &str,
        opts: SessionOptions,
    ) -> (Result<SessionSummary, SessionError>, Vec<BuildResponse>) {
        let (mut client, server_out) = tokio::io::duplex(64 * 1024);
        let reader = std::io::Cursor::new(input.as_bytes().to_vec());
        let session = Session::new(reader, server_out, Arc::new(Echo), opts);
        let result = session.run(&CancellationToken::new()).await;

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        let responses = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (result, responses)
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let input = "\n{\"rule\":\"A\",\"temp_dir\":\"/tmp\"}\n\n   \n{\"rule\":\"B\",\"temp_dir\":\"/tmp\"}\n";
        let (result, responses) = run_session(input, SessionOptions::default()).await;
        let summary = result.unwrap();
        assert_eq!(summary, SessionSummary { accepted: 2, written: 2 });
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn request_failure_is_a_response() {
        let input = "{\"rule\":\"A\",\"temp_dir\":\"/tmp\",\"test\":true}\n";
        let opts = SessionOptions {
            max_concurrent_builds: 0,
            ..Default::default()
        };
        let (result, responses) = run_session(input, opts).await;
        assert_eq!(result.unwrap().written, 1);
        assert_eq!(responses[0].rule, "A");
        assert!(!responses[0].success);
        assert!(responses[0].messages[0].contains("--required"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_decode_error() {
        let mut input = b"{\"rule\":\"A\",\"temp_dir\":\"/tmp\"}\n".to_vec();
        input.extend_from_slice(b"{\"rule\":\"\xff\xfe\"}\n");

        let (mut client, server_out) = tokio::io::duplex(64 * 1024);
        let session = Session::new(
            std::io::Cursor::new(input),
            server_out,
            Arc::new(Echo),
            SessionOptions::default(),
        );
        let result = session.run(&CancellationToken::new()).await;

        assert!(
            matches!(result, Err(SessionError::ProtocolDecode { .. })),
            "got {result:?}"
        );
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.lines().count(), 1);
    }
}
