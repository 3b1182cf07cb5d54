//! Scripted OBEX peers for tests.
//!
//! Enabled with the `test-util` feature.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::ObexClient;
use crate::headers::HeaderSet;
use crate::server::split_default;
use crate::transport::{ConnectFuture, Connector, Transport};
use crate::wire::{Opcode, ResponseCode};

/// How the scripted receiver behaves.
#[derive(Debug, Clone)]
pub struct PeerScript {
    pub connect_response: ResponseCode,
    /// Response to the first packet of the n-th object. Objects past the
    /// end of the list are accepted.
    pub object_responses: Vec<ResponseCode>,
    /// Delay before answering the first packet of each object.
    pub first_response_delay: Option<Duration>,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            connect_response: ResponseCode::OK,
            object_responses: Vec::new(),
            first_response_delay: None,
        }
    }
}

/// One object seen by the scripted receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerObject {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub length: Option<u32>,
    pub data: Vec<u8>,
    /// Final response sent for the object.
    pub response: Option<ResponseCode>,
}

/// Everything the scripted receiver observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerLog {
    pub connect_count: Option<u32>,
    pub connected: bool,
    pub objects: Vec<PeerObject>,
    pub aborted: u32,
    pub disconnected: bool,
}

/// Runs a receiving peer until the client disconnects or the stream ends.
pub async fn run_peer<T>(io: T, script: PeerScript) -> PeerLog
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = split_default(io);
    let mut log = PeerLog::default();
    let mut current: Option<PeerObject> = None;

    while let Ok(Some(request)) = reader.next_request().await {
        let code = match request.opcode {
            Opcode::Connect => {
                log.connect_count = request.headers.count;
                log.connected = script.connect_response == ResponseCode::OK;
                if writer.respond_connect(script.connect_response).await.is_err() {
                    break;
                }
                continue;
            }
            Opcode::Disconnect => {
                log.disconnected = true;
                let _ = writer.respond(ResponseCode::OK).await;
                break;
            }
            Opcode::Abort => {
                log.aborted += 1;
                current = None;
                ResponseCode::OK
            }
            Opcode::Put { last } => {
                let starting = current.is_none();
                let object = current.get_or_insert_with(|| PeerObject {
                    name: request.headers.name.clone(),
                    mime_type: request.headers.mime_type.clone(),
                    length: request.headers.length,
                    ..Default::default()
                });
                if let Some(ref body) = request.headers.body {
                    object.data.extend_from_slice(body);
                }

                let mut code = if last {
                    ResponseCode::OK
                } else {
                    ResponseCode::CONTINUE
                };
                if starting {
                    if let Some(delay) = script.first_response_delay {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(&scripted) = script.object_responses.get(log.objects.len()) {
                        if !scripted.is_success() {
                            code = scripted;
                        }
                    }
                }
                if last || !code.is_success() {
                    if let Some(mut done) = current.take() {
                        done.response = Some(code);
                        log.objects.push(done);
                    }
                }
                code
            }
            Opcode::Other(_) => ResponseCode::NOT_IMPLEMENTED,
        };
        if writer.respond(code).await.is_err() {
            break;
        }
    }
    log
}

/// An object pushed by [`push_objects`].
#[derive(Debug, Clone)]
pub struct PushObject {
    pub name: String,
    pub mime_type: Option<String>,
    /// Declared length; defaults to `data.len()`.
    pub length: Option<u32>,
    pub data: Vec<u8>,
}

impl PushObject {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: Some(mime_type.into()),
            length: None,
            data,
        }
    }
}

/// Final responses observed by [`push_objects`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub connect: Option<ResponseCode>,
    /// One entry per object: the first non-success response, or the final OK.
    pub responses: Vec<ResponseCode>,
    pub disconnect: Option<ResponseCode>,
}

/// Pushes objects like a sending device would, in `chunk` sized bodies.
pub async fn push_objects<T>(io: T, objects: Vec<PushObject>, chunk: usize) -> PushReport
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut client = ObexClient::new(io);
    let mut report = PushReport::default();
    let count = u32::try_from(objects.len()).unwrap_or(u32::MAX);
    let connect = HeaderSet {
        count: Some(count),
        ..Default::default()
    };
    match client.connect(connect).await {
        Ok(code) => {
            report.connect = Some(code);
            if code != ResponseCode::OK {
                return report;
            }
        }
        Err(_) => return report,
    }

    for object in objects {
        let length = object
            .length
            .unwrap_or_else(|| u32::try_from(object.data.len()).unwrap_or(u32::MAX));
        let mut headers = HeaderSet {
            name: Some(object.name),
            mime_type: object.mime_type,
            length: Some(length),
            ..Default::default()
        };
        let mut chunks = object.data.chunks(chunk.max(1)).peekable();
        let mut outcome = None;
        loop {
            let body = chunks.next().map(<[u8]>::to_vec).unwrap_or_default();
            let last = chunks.peek().is_none();
            headers.body = Some(body);
            headers.end_of_body = last;
            match client
                .request(Opcode::Put { last }, std::mem::take(&mut headers))
                .await
            {
                Ok((code, _)) if last || !code.is_success() => {
                    outcome = Some(code);
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        match outcome {
            Some(code) => report.responses.push(code),
            None => return report,
        }
    }

    report.disconnect = client.disconnect().await.ok();
    let _ = client.shutdown().await;
    report
}

/// Connector that hands out in-memory transports wired to [`run_peer`].
#[derive(Clone)]
pub struct PeerConnector {
    script: PeerScript,
    logs: Arc<Mutex<Vec<tokio::task::JoinHandle<PeerLog>>>>,
    connects: Arc<Mutex<u32>>,
}

impl PeerConnector {
    pub fn new(script: PeerScript) -> Self {
        Self {
            script,
            logs: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(Mutex::new(0)),
        }
    }

    /// Number of connect attempts so far.
    pub fn connects(&self) -> u32 {
        *self.connects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for every spawned peer and returns their logs.
    pub async fn logs(&self) -> Vec<PeerLog> {
        let handles: Vec<_> = self
            .logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let mut logs = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(log) = handle.await {
                logs.push(log);
            }
        }
        logs
    }
}

impl Connector for PeerConnector {
    fn connect<'a>(&'a self, destination: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            *self.connects.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            let (local, remote) = tokio::io::duplex(64 * 1024);
            let handle = tokio::spawn(run_peer(remote, self.script.clone()));
            self.logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
            Ok(Transport::new(local, destination))
        })
    }
}

/// Connector that fails with a fixed error message. The first
/// `failures` attempts fail; later ones, if any, reach a default peer.
#[derive(Clone)]
pub struct FailingConnector {
    message: String,
    failures: u32,
    peer: PeerConnector,
    attempts: Arc<Mutex<u32>>,
}

impl FailingConnector {
    /// Always fails.
    pub fn always(message: impl Into<String>) -> Self {
        Self::times(message, u32::MAX)
    }

    /// Fails `failures` times, then connects to an accepting peer.
    pub fn times(message: impl Into<String>, failures: u32) -> Self {
        Self {
            message: message.into(),
            failures,
            peer: PeerConnector::new(PeerScript::default()),
            attempts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer(&self) -> &PeerConnector {
        &self.peer
    }
}

impl Connector for FailingConnector {
    fn connect<'a>(&'a self, destination: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
                *attempts += 1;
                *attempts
            };
            if attempt <= self.failures {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    self.message.clone(),
                ));
            }
            self.peer.connect(destination).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pusher_and_peer_agree() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(run_peer(
            b,
            PeerScript {
                object_responses: vec![ResponseCode::CONTINUE, ResponseCode::NOT_ACCEPTABLE],
                ..Default::default()
            },
        ));
        let report = push_objects(
            a,
            vec![
                PushObject::new("a.txt", "text/plain", vec![7; 1000]),
                PushObject::new("b.bin", "application/octet-stream", vec![1; 10]),
            ],
            300,
        )
        .await;

        assert_eq!(
            report.responses,
            vec![ResponseCode::OK, ResponseCode::NOT_ACCEPTABLE]
        );
        let log = peer.await.unwrap();
        assert_eq!(log.connect_count, Some(2));
        assert_eq!(log.objects[0].data.len(), 1000);
        assert_eq!(log.objects[1].response, Some(ResponseCode::NOT_ACCEPTABLE));
        assert!(log.disconnected);
    }

    #[tokio::test]
    async fn failing_connector_counts_attempts() {
        let connector = FailingConnector::times("boom", 1);
        assert!(connector.connect("peer").await.is_err());
        assert!(connector.connect("peer").await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }
}
