use std::io::Write;

use bytes::BytesMut;
use memchr::memmem;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::conn::{ConnCore, ErrorFlags};
use crate::packet::Packet;
use crate::queue::{Dir, Qid};
use crate::rx::UploadFile;
use crate::stage::{MethodSet, Stage, StageKind, StageName};

/// Decoder states for a multipart/form-data body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    Boundary,
    ContentHeader,
    ContentData,
    End,
}

struct Upload {
    state: UploadState,
    boundary: Vec<u8>,
    buf: BytesMut,
    field_name: Option<String>,
    client_filename: Option<String>,
    content_type: Option<String>,
    spool: Option<NamedTempFile>,
    size: u64,
}

enum Step {
    Again,
    NeedMore,
    Done,
}

/// Multipart/form-data upload filter (RFC 1867).
///
/// File parts are spooled to a temporary path under the upload
/// directory; non-file parts are merged into the form-variable map and
/// re-emitted downstream as urlencoded pairs.
pub struct UploadFilter;

impl Stage for UploadFilter {
    fn name(&self) -> StageName {
        "upload"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, core: &ConnCore, dir: Dir) -> bool {
        if dir != Dir::Rx {
            return false;
        }
        let matched = match core.rx() {
            Some(rx) => {
                rx.method_set.contains(MethodSet::POST)
                    && rx.remaining_content > 0
                    && rx
                        .mime_type
                        .as_deref()
                        .map_or(false, |m| m.starts_with("multipart/form-data"))
            }
            None => false,
        };
        matched
    }

    fn open(&self, core: &mut ConnCore, q: Qid) {
        core.rx_mut().upload = true;
        let boundary = core
            .rx_ref()
            .mime_type
            .as_deref()
            .and_then(|mime| mime.find("boundary=").map(|i| mime[i + 9..].to_string()))
            .map(|b| {
                let b = b.trim().trim_matches('"');
                let mut full = Vec::with_capacity(b.len() + 2);
                full.extend_from_slice(b"--");
                full.extend_from_slice(b.as_bytes());
                full
            });
        let boundary = match boundary {
            Some(b) if b.len() > 2 => b,
            _ => {
                core.error(400, ErrorFlags::default(), "Bad boundary");
                return;
            }
        };
        let upload_dir = core
            .rx_ref()
            .upload_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        debug!(dir = %upload_dir.display(), "upload directory");
        core.rx_mut().upload_dir = Some(upload_dir.clone());
        core.rx_mut()
            .form_vars
            .set("UPLOAD_DIR", upload_dir.display().to_string());
        core.queues[q].set_stage_data(Upload {
            state: UploadState::Boundary,
            boundary,
            buf: BytesMut::new(),
            field_name: None,
            client_filename: None,
            content_type: None,
            spool: None,
            size: 0,
        });
    }

    fn incoming(&self, core: &mut ConnCore, q: Qid, mut packet: Packet) {
        if packet.len() == 0 {
            // End of input.
            let complete = core.queues[q]
                .stage_data::<Upload>()
                .map_or(false, |up| up.state == UploadState::End);
            if !complete {
                core.error(
                    400,
                    ErrorFlags::default(),
                    "Client supplied insufficient upload data",
                );
            }
            core.send_to_next(q, packet);
            return;
        }
        let mut up = match core.queues[q].stage_data.take() {
            Some(data) => match data.downcast::<Upload>() {
                Ok(up) => up,
                Err(_) => return,
            },
            None => return,
        };
        up.buf.extend_from_slice(&packet.content_mut()[..]);
        trace!(bytes = packet.len(), "upload data");
        loop {
            let step = match up.state {
                UploadState::Boundary | UploadState::ContentHeader => {
                    match take_line(&mut up.buf) {
                        Some(line) => {
                            if up.state == UploadState::Boundary {
                                process_boundary(core, &mut up, &line)
                            } else {
                                process_content_header(core, &mut up, &line)
                            }
                        }
                        None => Step::NeedMore,
                    }
                }
                UploadState::ContentData => process_content_data(core, q, &mut up),
                UploadState::End => Step::Done,
            };
            match step {
                Step::Again => continue,
                Step::NeedMore | Step::Done => break,
            }
        }
        core.queues[q].stage_data = Some(up as Box<dyn std::any::Any + Send>);
    }
}

/// Read one `\n`-terminated line, trimming the trailing CR.
fn take_line(buf: &mut BytesMut) -> Option<String> {
    let nl = memchr::memchr(b'\n', &buf[..])?;
    let line = buf.split_to(nl + 1);
    let mut line = &line[..nl];
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    Some(String::from_utf8_lossy(line).into_owned())
}

/// Expecting the multipart boundary divider.
fn process_boundary(core: &mut ConnCore, up: &mut Upload, line: &str) -> Step {
    if !line.as_bytes().starts_with(&up.boundary[..]) {
        core.error(
            400,
            ErrorFlags::default(),
            "Bad upload state. Incomplete boundary",
        );
        return Step::Done;
    }
    if line[up.boundary.len()..].starts_with("--") {
        up.state = UploadState::End;
    } else {
        up.state = UploadState::ContentHeader;
    }
    Step::Again
}

/// Part headers; a blank line starts the part data.
fn process_content_header(core: &mut ConnCore, up: &mut Upload, line: &str) -> Step {
    if line.is_empty() {
        up.state = UploadState::ContentData;
        return Step::Again;
    }
    let mut split = line.splitn(2, ':');
    let header = split.next().unwrap_or("").trim();
    let rest = split.next().unwrap_or("").trim();

    if header.eq_ignore_ascii_case("Content-Disposition") {
        up.field_name = None;
        up.client_filename = None;
        for pair in rest.split(';') {
            let pair = pair.trim();
            let mut kv = pair.splitn(2, '=');
            let key = kv.next().unwrap_or("").trim();
            let value = kv.next().unwrap_or("").trim().trim_matches('"');
            if key.eq_ignore_ascii_case("name") {
                up.field_name = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("filename") {
                if up.field_name.is_none() {
                    core.error(
                        400,
                        ErrorFlags::default(),
                        "Bad upload state. Missing name field",
                    );
                    return Step::Done;
                }
                up.client_filename = Some(value.to_string());
                let dir = core
                    .rx_ref()
                    .upload_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                match tempfile::Builder::new().prefix("upload-").tempfile_in(&dir) {
                    Ok(file) => {
                        debug!(
                            client = value,
                            spool = %file.path().display(),
                            "file upload"
                        );
                        up.spool = Some(file);
                        up.size = 0;
                    }
                    Err(e) => {
                        core.error(
                            500,
                            ErrorFlags::default(),
                            format!("Can't create upload temp file in {}: {}", dir.display(), e),
                        );
                        return Step::Done;
                    }
                }
            }
        }
    } else if header.eq_ignore_ascii_case("Content-Type") && up.client_filename.is_some() {
        up.content_type = Some(rest.to_string());
    }
    Step::Again
}

/// Part data up to the next boundary. Data that cannot yet contain a
/// complete boundary is written through (file parts) or held (form
/// fields).
fn process_content_data(core: &mut ConnCore, q: Qid, up: &mut Upload) -> Step {
    if up.buf.len() < up.boundary.len() {
        return Step::NeedMore;
    }
    let found = memmem::find(&up.buf[..], &up.boundary[..]);
    let data_len = match found {
        Some(pos) => pos,
        None => {
            if up.client_filename.is_some() {
                // No boundary yet: spill to the spool file, holding back
                // enough bytes to cover a split "\r\n--boundary".
                let keep = up.boundary.len() + 1;
                if up.buf.len() > keep {
                    let spill = up.buf.len() - keep;
                    let data = up.buf.split_to(spill);
                    if !write_to_file(core, up, &data[..]) {
                        return Step::Done;
                    }
                }
            }
            return Step::NeedMore;
        }
    };
    let mut data = up.buf.split_to(data_len);
    // Drop the CRLF preceding the boundary.
    if data.ends_with(b"\r\n") {
        data.truncate(data.len() - 2);
    }
    if up.client_filename.is_some() {
        if !data.is_empty() && !write_to_file(core, up, &data[..]) {
            return Step::Done;
        }
        finish_file_part(core, q, up);
    } else if let Some(name) = up.field_name.take() {
        let value = String::from_utf8_lossy(&data[..]).into_owned();
        trace!(field = %name, "form field");
        core.rx_mut().form_vars.set(name.clone(), value.clone());
        // Re-emit downstream as urlencoded form data.
        let pair = format!("{}={}", name, value);
        core.rx_mut().mime_type = Some("application/x-www-form-urlencoded".to_string());
        core.send_to_next(q, Packet::data_from(pair.as_bytes()));
    }
    up.state = UploadState::Boundary;
    Step::Again
}

fn write_to_file(core: &mut ConnCore, up: &mut Upload, data: &[u8]) -> bool {
    if up.size + data.len() as u64 > core.limits.upload_size {
        let msg = format!(
            "Uploaded file exceeds maximum {}",
            core.limits.upload_size
        );
        core.error(413, ErrorFlags::close(), msg);
        return false;
    }
    let file = up.spool.as_mut().expect("upload spool");
    if let Err(e) = file.write_all(data) {
        let msg = format!("Can't write to upload temp file: {}", e);
        core.error(500, ErrorFlags::default(), msg);
        return false;
    }
    up.size += data.len() as u64;
    true
}

/// Complete the current file part: record it on the request and define
/// its variable surface.
fn finish_file_part(core: &mut ConnCore, _q: Qid, up: &mut Upload) {
    let spool = match up.spool.take() {
        Some(spool) => spool,
        None => return,
    };
    if let Err(e) = spool.as_file().sync_all() {
        trace!(error = %e, "spool sync failed");
    }
    let temp_path = spool.into_temp_path();
    let auto_delete = core.rx_ref().auto_delete;
    let path = temp_path.to_path_buf();
    let spool = if auto_delete {
        Some(temp_path)
    } else {
        // Persist the spool file; the application owns it now.
        let _ = temp_path.keep();
        None
    };
    let file = UploadFile {
        name: up.field_name.clone().unwrap_or_default(),
        client_filename: up.client_filename.take().unwrap_or_default(),
        temp_filename: path,
        content_type: up.content_type.take(),
        size: up.size,
        spool,
    };
    debug!(
        name = %file.name,
        client = %file.client_filename,
        size = file.size,
        "upload complete"
    );
    core.rx_mut().files.push(file);
    let index = core.rx_ref().files.len() - 1;
    crate::vars::define_file_fields(core, index);
}
