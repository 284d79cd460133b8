//! Client for a lake served over HTTP.
//!
//! Values go over the wire as bincode frames, never as JSON, so a remote
//! lake returns exactly what the local one would. Query results are pulled
//! from the response body one frame at a time.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{header, Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use silt_meta::{BranchConfig, PoolConfig};
use silt_storage::{encode_frame, frame_len, FrameDecoder, Id, Layout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::Lake;
use crate::branch::CommitMessage;
use crate::error::{LakeError, LakeResult};
use crate::events::{Event, EventStream};
use crate::filter::KeyRange;
use crate::puller::{Batch, Progress, Puller};
use crate::service::{
    CommitResponse, CreateBranchRequest, CreatePoolRequest, ErrorBody, IdsRequest, IdsResponse,
    MergeRequest, QueryFrame, QueryRequest, RangeRequest, RenameRequest, RevertRequest,
    VacuumRequest, FRAMES_CONTENT_TYPE,
};

/// Lake behind a remote service.
#[derive(Clone)]
pub struct RemoteLake {
    base: Url,
    client: Client,
}

impl RemoteLake {
    /// Client for the service at `base`, e.g. `http://localhost:9867`.
    pub fn new(base: &str) -> LakeResult<Self> {
        Self::with_token(base, None)
    }

    /// Client that sends `token` as a bearer credential on every request.
    pub fn with_token(base: &str, token: Option<&str>) -> LakeResult<Self> {
        let base = Url::parse(base).map_err(|e| LakeError::Invalid(format!("lake url {:?}: {}", base, e)))?;
        if base.cannot_be_a_base() {
            return Err(LakeError::Invalid(format!("lake url {:?} cannot be a base", base.as_str())));
        }
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|_| LakeError::Invalid("credential token is not a valid header value".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(Self {
            base,
            client: Client::builder().default_headers(headers).build()?,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn branch_url(&self, pool: Id, branch: &str, action: &[&str]) -> Url {
        let pool = pool.to_string();
        let mut segments = vec!["pool", pool.as_str(), "branch", branch];
        segments.extend_from_slice(action);
        self.url(&segments)
    }

    async fn check(resp: Response) -> LakeResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.bytes().await?;
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(err) => Err(err.into()),
            Err(_) => Err(LakeError::Transport(format!(
                "{}: {}",
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> LakeResult<T> {
        let resp = Self::check(req.send().await?).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn call_empty(&self, req: RequestBuilder) -> LakeResult<()> {
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn commit(&self, req: RequestBuilder) -> LakeResult<Id> {
        Ok(self.call::<CommitResponse>(req).await?.commit)
    }

    /// Request carrying a frame-encoded body and the commit message.
    fn framed(&self, url: Url, body: Vec<u8>, msg: &CommitMessage) -> RequestBuilder {
        self.client
            .post(url)
            .query(msg)
            .header(header::CONTENT_TYPE, FRAMES_CONTENT_TYPE)
            .body(body)
    }
}

#[async_trait]
impl Lake for RemoteLake {
    async fn create_pool(
        &self,
        name: &str,
        layout: Layout,
        seek_stride: u64,
        threshold: u64,
    ) -> LakeResult<PoolConfig> {
        let body = CreatePoolRequest {
            name: name.to_string(),
            layout: layout.to_string(),
            seek_stride,
            threshold,
        };
        self.call(self.client.post(self.url(&["pool"])).json(&body)).await
    }

    async fn remove_pool(&self, pool: Id) -> LakeResult<()> {
        let url = self.url(&["pool", &pool.to_string()]);
        self.call_empty(self.client.delete(url)).await
    }

    async fn rename_pool(&self, pool: Id, name: &str) -> LakeResult<()> {
        let url = self.url(&["pool", &pool.to_string()]);
        let body = RenameRequest {
            name: name.to_string(),
        };
        self.call_empty(self.client.put(url).json(&body)).await
    }

    async fn id_of(&self, name: &str) -> LakeResult<Id> {
        let config: PoolConfig = self.call(self.client.get(self.url(&["pool", name]))).await?;
        Ok(config.id)
    }

    async fn pool_config(&self, pool: Id) -> LakeResult<PoolConfig> {
        let url = self.url(&["pool", &pool.to_string()]);
        self.call(self.client.get(url)).await
    }

    async fn list_pools(&self) -> LakeResult<Vec<PoolConfig>> {
        self.call(self.client.get(self.url(&["pool"]))).await
    }

    async fn create_branch(&self, pool: Id, name: &str, at: Id) -> LakeResult<BranchConfig> {
        let url = self.url(&["pool", &pool.to_string(), "branch"]);
        let body = CreateBranchRequest {
            name: name.to_string(),
            at,
        };
        self.call(self.client.post(url).json(&body)).await
    }

    async fn remove_branch(&self, pool: Id, name: &str) -> LakeResult<()> {
        self.call_empty(self.client.delete(self.branch_url(pool, name, &[])))
            .await
    }

    async fn merge_branch(
        &self,
        pool: Id,
        child: &str,
        parent: &str,
        msg: &CommitMessage,
    ) -> LakeResult<Id> {
        let body = MergeRequest {
            parent: parent.to_string(),
            msg: msg.clone(),
        };
        self.commit(self.client.post(self.branch_url(pool, child, &["merge"])).json(&body))
            .await
    }

    async fn tip(&self, pool: Id, branch: &str) -> LakeResult<Id> {
        self.commit(self.client.get(self.branch_url(pool, branch, &[])))
            .await
    }

    async fn load(
        &self,
        pool: Id,
        branch: &str,
        input: &mut dyn Puller,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let mut body = Vec::new();
        let mut records = 0;
        loop {
            let batch = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(LakeError::Cancelled),
                batch = input.pull(false) => batch?,
            };
            match batch {
                Some(batch) => {
                    records += batch.len();
                    encode_frame(&mut body, &batch)?;
                }
                None => break,
            }
        }
        debug!(pool = %pool, branch, records, bytes = body.len(), "sending load");
        let req = self.framed(self.branch_url(pool, branch, &["load"]), body, msg);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LakeError::Cancelled),
            commit = self.commit(req) => commit,
        }
    }

    async fn delete(&self, pool: Id, branch: &str, ids: &[Id], msg: &CommitMessage) -> LakeResult<Id> {
        let body = IdsRequest {
            ids: ids.to_vec(),
            write_vectors: false,
            msg: msg.clone(),
        };
        self.commit(self.client.post(self.branch_url(pool, branch, &["delete"])).json(&body))
            .await
    }

    async fn delete_where(
        &self,
        pool: Id,
        branch: &str,
        range: &KeyRange,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let mut body = Vec::new();
        encode_frame(
            &mut body,
            &RangeRequest {
                lo: range.lo.clone(),
                hi: range.hi.clone(),
            },
        )?;
        let req = self.framed(self.branch_url(pool, branch, &["delete-where"]), body, msg);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LakeError::Cancelled),
            commit = self.commit(req) => commit,
        }
    }

    async fn revert(&self, pool: Id, branch: &str, commit: Id, msg: &CommitMessage) -> LakeResult<Id> {
        let body = RevertRequest {
            commit,
            msg: msg.clone(),
        };
        self.commit(self.client.post(self.branch_url(pool, branch, &["revert"])).json(&body))
            .await
    }

    async fn compact(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        write_vectors: bool,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let body = IdsRequest {
            ids: ids.to_vec(),
            write_vectors,
            msg: msg.clone(),
        };
        let req = self
            .client
            .post(self.branch_url(pool, branch, &["compact"]))
            .json(&body);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LakeError::Cancelled),
            commit = self.commit(req) => commit,
        }
    }

    async fn add_vectors(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let body = IdsRequest {
            ids: ids.to_vec(),
            write_vectors: true,
            msg: msg.clone(),
        };
        let req = self
            .client
            .post(self.branch_url(pool, branch, &["vectors"]))
            .json(&body);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LakeError::Cancelled),
            commit = self.commit(req) => commit,
        }
    }

    async fn delete_vectors(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        msg: &CommitMessage,
    ) -> LakeResult<Id> {
        let body = IdsRequest {
            ids: ids.to_vec(),
            write_vectors: false,
            msg: msg.clone(),
        };
        let url = self.branch_url(pool, branch, &["vectors", "delete"]);
        self.commit(self.client.post(url).json(&body)).await
    }

    async fn vacuum(
        &self,
        pool: Id,
        branch: &str,
        dryrun: bool,
        cancel: &CancellationToken,
    ) -> LakeResult<Vec<Id>> {
        let req = self
            .client
            .post(self.branch_url(pool, branch, &["vacuum"]))
            .json(&VacuumRequest { dryrun });
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LakeError::Cancelled),
            resp = self.call::<IdsResponse>(req) => Ok(resp?.ids),
        }
    }

    async fn query(
        &self,
        head: &str,
        source: &str,
        cancel: &CancellationToken,
    ) -> LakeResult<Box<dyn Puller>> {
        let body = QueryRequest {
            head: head.to_string(),
            query: source.to_string(),
        };
        let req = self.client.post(self.url(&["query"])).json(&body);
        let resp = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LakeError::Cancelled),
            resp = req.send() => Self::check(resp?).await?,
        };
        Ok(Box::new(RemoteScan {
            resp: Some(resp),
            buf: Vec::new(),
            progress: Progress::default(),
            cancel: cancel.clone(),
            failed: None,
        }))
    }

    async fn subscribe_events(&self) -> LakeResult<EventStream> {
        let req = self
            .client
            .get(self.url(&["events"]))
            .header(header::ACCEPT, "text/event-stream");
        let resp = Self::check(req.send().await?).await?;
        let state = SseReader {
            resp: Some(resp),
            buf: String::new(),
        };
        let events = stream::unfold(state, |mut reader| async move {
            loop {
                if let Some(event) = reader.next_block() {
                    return Some((event, reader));
                }
                let resp = reader.resp.as_mut()?;
                match resp.chunk().await {
                    Ok(Some(chunk)) => reader.buf.push_str(&String::from_utf8_lossy(&chunk)),
                    Ok(None) => return None,
                    Err(e) => {
                        reader.resp = None;
                        return Some((Err(e.into()), reader));
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}

/// Puller over a streamed query response. The response is dropped, which
/// closes the connection and stops the server-side scan, on cancel, on
/// `pull(true)` and after the final frame.
struct RemoteScan {
    resp: Option<Response>,
    buf: Vec<u8>,
    progress: Progress,
    cancel: CancellationToken,
    failed: Option<Arc<LakeError>>,
}

impl RemoteScan {
    fn fail(&mut self, err: LakeError) -> LakeError {
        let err = Arc::new(err);
        self.resp = None;
        self.failed = Some(err.clone());
        LakeError::Shared(err)
    }

    fn next_frame(&mut self) -> LakeResult<Option<QueryFrame>> {
        let Some(len) = frame_len(&self.buf) else {
            return Ok(None);
        };
        let frame = FrameDecoder::new(&self.buf[..len]).next_item()?;
        self.buf.drain(..len);
        Ok(frame)
    }
}

#[async_trait]
impl Puller for RemoteScan {
    async fn pull(&mut self, done: bool) -> LakeResult<Option<Batch>> {
        if done {
            self.resp = None;
            self.buf.clear();
            return Ok(None);
        }
        if let Some(err) = &self.failed {
            return Err(LakeError::Shared(err.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(self.fail(LakeError::Cancelled));
        }
        loop {
            let frame = match self.next_frame() {
                Ok(frame) => frame,
                Err(e) => return Err(self.fail(e)),
            };
            match frame {
                Some(QueryFrame::Batch(batch)) if batch.is_empty() => continue,
                Some(QueryFrame::Batch(batch)) => return Ok(Some(batch)),
                Some(QueryFrame::Done(progress)) => {
                    self.progress = progress;
                    self.resp = None;
                    return Ok(None);
                }
                Some(QueryFrame::Error(err)) => return Err(self.fail(err.into())),
                None => {}
            }
            let Some(resp) = self.resp.as_mut() else {
                return Ok(None);
            };
            let chunk = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                chunk = resp.chunk() => Some(chunk),
            };
            match chunk {
                None => return Err(self.fail(LakeError::Cancelled)),
                Some(Ok(Some(bytes))) => self.buf.extend_from_slice(&bytes),
                Some(Ok(None)) => {
                    return Err(self.fail(LakeError::Transport(
                        "query response ended before its final frame".into(),
                    )))
                }
                Some(Err(e)) => return Err(self.fail(e.into())),
            }
        }
    }

    fn progress(&self) -> Progress {
        self.progress
    }
}

/// Buffered server-sent-event reader. The stream ends at EOF.
struct SseReader {
    resp: Option<Response>,
    buf: String,
}

impl SseReader {
    /// Take the next complete block that carries data.
    fn next_block(&mut self) -> Option<LakeResult<Event>> {
        while let Some(end) = self.buf.find("\n\n") {
            let block: String = self.buf.drain(..end + 2).collect();
            if let Some(event) = parse_sse_block(&block) {
                return Some(event);
            }
        }
        None
    }
}

/// Decode the `data:` lines of one SSE block; `None` for blocks without
/// data, such as keep-alive comments.
fn parse_sse_block(block: &str) -> Option<LakeResult<Event>> {
    let data: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if data.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<Event>(&data.join("\n")).map_err(LakeError::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use silt_storage::{ErrorKind, Value};

    fn buffered(frames: &[QueryFrame]) -> RemoteScan {
        let mut buf = Vec::new();
        for frame in frames {
            encode_frame(&mut buf, frame).unwrap();
        }
        RemoteScan {
            resp: None,
            buf,
            progress: Progress::default(),
            cancel: CancellationToken::new(),
            failed: None,
        }
    }

    #[tokio::test]
    async fn test_remote_scan_reads_frames() {
        let progress = Progress {
            records_matched: 1,
            ..Progress::default()
        };
        let mut scan = buffered(&[
            QueryFrame::Batch(vec![Value::Float(f64::NAN)]),
            QueryFrame::Batch(vec![]),
            QueryFrame::Done(progress),
        ]);
        assert_eq!(
            scan.pull(false).await.unwrap(),
            Some(vec![Value::Float(f64::NAN)])
        );
        assert!(scan.pull(false).await.unwrap().is_none());
        assert_eq!(scan.progress(), progress);
        assert!(scan.pull(false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_scan_error_is_sticky() {
        let mut scan = buffered(&[QueryFrame::Error(ErrorBody {
            kind: ErrorKind::NotFound,
            error: "object gone".into(),
        })]);
        let err = scan.pull(false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "object gone");
        assert_eq!(scan.pull(false).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_remote_scan_stops_on_cancel() {
        let mut scan = buffered(&[
            QueryFrame::Batch(vec![Value::Int(1)]),
            QueryFrame::Batch(vec![Value::Int(2)]),
        ]);
        assert!(scan.pull(false).await.unwrap().is_some());
        scan.cancel.cancel();
        assert_eq!(scan.pull(false).await.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_parse_sse_block() {
        let event = Event::branch(EventKind::BranchCommit, Id::new(), "main", Some(Id::new()));
        let block = format!(
            "event: branch-commit\ndata: {}\n\n",
            serde_json::to_string(&event).unwrap()
        );
        assert_eq!(parse_sse_block(&block).unwrap().unwrap(), event);
        assert!(parse_sse_block(":\n\n").is_none());
        assert!(parse_sse_block("data: {nope\n\n").unwrap().is_err());
    }

    #[test]
    fn test_urls_escape_segments() {
        let lake = RemoteLake::new("http://localhost:9867/").unwrap();
        let pool = Id::new();
        let url = lake.branch_url(pool, "a b", &["vectors", "delete"]);
        assert_eq!(
            url.as_str(),
            format!("http://localhost:9867/pool/{}/branch/a%20b/vectors/delete", pool)
        );
        assert!(RemoteLake::new("not a url").is_err());
    }
}
