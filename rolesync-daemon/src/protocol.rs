use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rolesync_core::paths::socket_path;
use rolesync_core::{GroupId, RoleName, SubjectId};

use crate::error::{io_err, DaemonError};

/// JSON newline-delimited request.
///
/// `subject` scopes `sync` and `intents`; `event` additionally needs `group`
/// and the member's new `roles`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<RoleName>>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    pub fn with_subject(mut self, subject: SubjectId) -> Self {
        self.subject = Some(subject);
        self
    }
}

/// JSON newline-delimited response.
///
/// A long-running command may precede its final response with any number of
/// progress frames: `{"ok":true,"progress":{...}}`. The final line never
/// carries `progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            progress: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            progress: None,
        }
    }

    pub fn progress(update: Value) -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
            progress: Some(update),
        }
    }

    pub fn is_progress(&self) -> bool {
        self.progress.is_some()
    }
}

/// Send one JSON request to the daemon socket and return its final response.
///
/// Progress frames sent ahead of the final response are discarded.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    send_request_with_progress(home, request, |_| {})
}

/// Like [`send_request`], handing each progress frame to `on_progress` as it arrives.
pub fn send_request_with_progress<F>(
    home: &Path,
    request: &DaemonRequest,
    mut on_progress: F,
) -> Result<DaemonResponse, DaemonError>
where
    F: FnMut(Value),
{
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    stream
        .write_all(payload.as_bytes())
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| io_err(&socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed connection before responding".to_string(),
            ));
        }

        let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
        match response.progress {
            Some(update) => on_progress(update),
            None => return Ok(response),
        }
    }
}

/// `status`, retried briefly so callers racing a fresh `daemon start` succeed.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    call(home, DaemonRequest::new("stop")).map(|_| ())
}

/// Reset one subject from the primary group, or every member when `subject` is `None`.
pub fn request_sync(home: &Path, subject: Option<SubjectId>) -> Result<Value, DaemonError> {
    call(
        home,
        DaemonRequest {
            subject,
            ..DaemonRequest::new("sync")
        },
    )
}

/// Reset every member of the primary group, reporting each subject as it finishes.
pub fn request_sync_all<F>(home: &Path, on_progress: F) -> Result<Value, DaemonError>
where
    F: FnMut(Value),
{
    let response = send_request_with_progress(home, &DaemonRequest::new("sync"), on_progress)?;
    response_into_data(response)
}

/// Apply a role edit to `subject` in `group`; the daemon handles the resulting notification.
pub fn request_event(
    home: &Path,
    group: GroupId,
    subject: SubjectId,
    roles: Vec<RoleName>,
) -> Result<Value, DaemonError> {
    call(
        home,
        DaemonRequest {
            subject: Some(subject),
            group: Some(group),
            roles: Some(roles),
            ..DaemonRequest::new("event")
        },
    )
}

pub fn request_rebuild(home: &Path) -> Result<Value, DaemonError> {
    call(home, DaemonRequest::new("rebuild"))
}

pub fn request_roles(home: &Path) -> Result<Value, DaemonError> {
    call(home, DaemonRequest::new("roles"))
}

pub fn request_intents(home: &Path, subject: Option<SubjectId>) -> Result<Value, DaemonError> {
    call(
        home,
        DaemonRequest {
            subject,
            ..DaemonRequest::new("intents")
        },
    )
}

fn call(home: &Path, request: DaemonRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, &request)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
