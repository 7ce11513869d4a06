use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use beaconhost_core::HostConfig;
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;

pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Content types registered ahead of the MIME guess table.
const EXTENSION_HINTS: &[(&str, &str)] = &[("apk", "application/vnd.android.package-archive")];

pub fn content_type_for(path: &Path) -> &'static str {
    let hinted = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            EXTENSION_HINTS
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(ext))
                .map(|(_, content_type)| *content_type)
        });

    hinted
        .or_else(|| mime_guess::from_path(path).first_raw())
        .unwrap_or("application/octet-stream")
}

/// Headers shared by GET and HEAD on the download route.
pub fn download_headers(config: &HostConfig, file: &Path, size: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type_for(file)));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));

    let disposition = format!("attachment; filename=\"{}\"", config.download_filename());
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    headers
}

/// An opened download, sized at open time.
pub struct Download {
    file: File,
    pub size: u64,
}

impl Download {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
        }
        Ok(Self {
            file,
            size: metadata.len(),
        })
    }

    /// Body that reads the file lazily, one chunk at a time.
    ///
    /// `on_complete` runs once, with the byte count, after the last advertised
    /// byte has been handed to the connection. It never runs when the client
    /// goes away first or the read fails.
    pub fn into_body(self, on_complete: impl FnOnce(u64) + Send + 'static) -> Body {
        let reader = CompletionReader::new(self.file, self.size, Box::new(on_complete));
        Body::from_stream(ReaderStream::with_capacity(reader, DOWNLOAD_CHUNK_SIZE))
    }
}

type OnComplete = Box<dyn FnOnce(u64) + Send>;

/// Counts bytes read through it and fires a callback once `expected` is
/// reached. The count is checked per read rather than at EOF because hyper
/// stops polling a body as soon as `Content-Length` bytes are out.
pub struct CompletionReader<R> {
    inner: R,
    sent: u64,
    expected: u64,
    on_complete: Option<OnComplete>,
}

impl<R> CompletionReader<R> {
    pub fn new(inner: R, expected: u64, on_complete: OnComplete) -> Self {
        let mut reader = Self {
            inner,
            sent: 0,
            expected,
            on_complete: Some(on_complete),
        };
        // An empty body may never be polled at all.
        if expected == 0 {
            reader.complete();
        }
        reader
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn complete(&mut self) {
        if let Some(done) = self.on_complete.take() {
            done(self.sent);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CompletionReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            this.sent += (buf.filled().len() - before) as u64;
            if this.sent >= this.expected {
                this.complete();
            }
        }
        result
    }
}
