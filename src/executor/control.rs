//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Loopback control endpoint for supervised jobscript runs.
//!
//! The endpoint accepts the text messages `shutdown` and `abort`, one per
//! connection line. Peer identity is the ability to connect on loopback;
//! the port is ephemeral and published to the child environment.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    Shutdown,
    Abort,
}

/// A bound control endpoint; dropped (and thereby closed) on all exit paths
/// of the supervisor.
pub struct ControlEndpoint {
    port: u16,
    receiver: mpsc::Receiver<ControlMessage>,
    listener_task: tokio::task::JoinHandle<()>,
}

impl ControlEndpoint {
    /// Bind to an ephemeral loopback port and start the listener task.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::Runtime(format!("Cannot bind control endpoint: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Runtime(format!("Cannot read control endpoint port: {}", e)))?
            .port();
        info!(port, "control endpoint listening");

        let (sender, receiver) = mpsc::channel(8);
        let listener_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("control endpoint accept failed: {}", e);
                        continue;
                    }
                };
                debug!(%peer, "control connection");
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                if reader.read_line(&mut line).await.is_err() {
                    continue;
                }
                let message = match line.trim() {
                    "shutdown" => Some(ControlMessage::Shutdown),
                    "abort" => Some(ControlMessage::Abort),
                    other => {
                        debug!(request = other, "ignoring control request");
                        None
                    }
                };
                let mut stream = reader.into_inner();
                if let Some(message) = message {
                    let _ = stream.write_all(b"ok\n").await;
                    if sender.send(message).await.is_err() {
                        break;
                    }
                    if message == ControlMessage::Shutdown {
                        break;
                    }
                } else {
                    let _ = stream.write_all(b"ignored\n").await;
                }
            }
        });

        Ok(ControlEndpoint {
            port,
            receiver,
            listener_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next control message; `None` when the endpoint closed.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.receiver.recv().await
    }
}

impl Drop for ControlEndpoint {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

/// Send a control message to a running endpoint.
pub async fn send_control(hostname: &str, port: u16, message: ControlMessage) -> Result<()> {
    let text = match message {
        ControlMessage::Shutdown => "shutdown\n",
        ControlMessage::Abort => "abort\n",
    };
    let mut stream = TcpStream::connect((hostname, port))
        .await
        .map_err(|e| Error::Runtime(format!("Cannot reach control endpoint: {}", e)))?;
    stream
        .write_all(text.as_bytes())
        .await
        .map_err(|e| Error::Runtime(format!("Cannot send control message: {}", e)))?;
    let mut reply = String::new();
    let mut reader = BufReader::new(stream);
    let _ = reader.read_line(&mut reply).await;
    debug!(reply = reply.trim(), "control endpoint replied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_roundtrip() {
        let mut endpoint = ControlEndpoint::bind().await.unwrap();
        let port = endpoint.port();
        send_control("127.0.0.1", port, ControlMessage::Abort)
            .await
            .unwrap();
        assert_eq!(endpoint.recv().await, Some(ControlMessage::Abort));
    }

    #[tokio::test]
    async fn test_unknown_message_ignored() {
        let mut endpoint = ControlEndpoint::bind().await.unwrap();
        let port = endpoint.port();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"status\n").await.unwrap();
        drop(stream);

        send_control("127.0.0.1", port, ControlMessage::Shutdown)
            .await
            .unwrap();
        assert_eq!(endpoint.recv().await, Some(ControlMessage::Shutdown));
    }
}
