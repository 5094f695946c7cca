// Copyright 2024 The vev developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Response construction: status line and headers into the write buffer,
//! the file payload as a read-only memory mapping.
//!
//! The file is resolved under the resource root. Missing or non-regular
//! paths become 404, files without the other-read bit 403. Error statuses
//! are served from `<code>.html` in the resource root when present, else
//! from a small inline HTML body appended to the write buffer.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::buffer::Buffer;
use crate::http::{Status, Version};

/// A response for one request/response turn.
#[derive(Debug)]
pub struct Response {
    status: Status,
    version: Version,
    keep_alive: bool,
    src_dir: PathBuf,
    path: PathBuf,
    mmap: Option<Mmap>,
}

impl Response {
    /// Stages a response for `path` (as routed) under `src_dir`.
    pub fn new(
        src_dir: &Path,
        path: &str,
        version: Version,
        keep_alive: bool,
        status: Status,
    ) -> Self {
        Self {
            status,
            version,
            keep_alive,
            src_dir: src_dir.to_path_buf(),
            path: src_dir.join(path.trim_start_matches('/')),
            mmap: None,
        }
    }

    /// Resolves the file, settles the final status, and writes the status
    /// line and headers (plus an inline error body when there is no file to
    /// map) into `buf`. File payloads are mapped and exposed via [`file`].
    ///
    /// [`file`]: Self::file
    pub fn build(&mut self, buf: &mut Buffer) {
        if self.status == Status::Ok {
            self.status = match std::fs::metadata(&self.path) {
                Ok(meta) if !meta.is_file() => Status::NotFound,
                Ok(meta) if meta.permissions().mode() & 0o004 == 0 => Status::Forbidden,
                Ok(_) => Status::Ok,
                Err(_) => Status::NotFound,
            };
        }
        if self.status != Status::Ok {
            self.keep_alive = self.keep_alive && self.status != Status::BadRequest;
            let error_page = self.src_dir.join(format!("{}.html", self.status));
            if error_page.is_file() {
                self.path = error_page;
            } else {
                self.path.clear();
            }
        }

        self.mmap = self.map_file();

        buf.append(format!("{} {} {}\r\n", self.version, self.status, self.status.reason()).as_bytes());
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }

        match &self.mmap {
            Some(m) => {
                buf.append(format!("Content-Type: {}\r\n", content_type(&self.path)).as_bytes());
                buf.append(format!("Content-Length: {}\r\n\r\n", m.len()).as_bytes());
            }
            None => {
                let body = self.error_body();
                buf.append(b"Content-Type: text/html\r\n");
                buf.append(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
                buf.append(body.as_bytes());
            }
        }
    }

    fn map_file(&self) -> Option<Mmap> {
        if self.path.as_os_str().is_empty() {
            return None;
        }
        let file = File::open(&self.path).ok()?;
        if file.metadata().ok()?.len() == 0 {
            return None;
        }
        // Safety: the mapping is read-only and pages are only touched while
        // the map is alive; a concurrent truncation of a resource file would
        // fault, which is accepted for a static resource tree.
        match unsafe { Mmap::map(&file) } {
            Ok(m) => Some(m),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "mmap failed");
                None
            }
        }
    }

    fn error_body(&self) -> String {
        format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">\
             {} : {}\n<p>{}</p><hr><em>vev</em></body></html>",
            self.status,
            self.status.reason(),
            match self.status {
                Status::Ok => "File is empty!",
                _ => "File NotFound!",
            }
        )
    }

    /// Final status after [`build`](Self::build).
    pub fn status(&self) -> Status {
        self.status
    }

    /// The mapped file payload, if any.
    pub fn file(&self) -> Option<&[u8]> {
        self.mmap.as_deref()
    }

    /// Whether the connection stays open after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Releases the file mapping.
    pub fn unmap(&mut self) {
        self.mmap = None;
    }
}

/// Content type by file extension, `text/plain` when unknown.
fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("txt") => "text/plain",
        Some("xml") => "text/xml",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("mp4") => "video/mp4",
        Some("avi") => "video/x-msvideo",
        Some("mp3") => "audio/mpeg",
        Some("pdf") => "application/pdf",
        Some("gz") => "application/x-gzip",
        Some("tar") => "application/x-tar",
        _ => "text/plain",
    }
}
