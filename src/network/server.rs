//! TCP device server.
//!
//! One [`DeviceServer`] exposes one device (a settings holder or the
//! microscope) on a listening socket. Each connection is served by its own
//! task, requests on a connection are answered in order, and a device-wide
//! lock keeps at most one handler call in flight per device.

use super::error_mapping::error_response;
use super::protocol::{read_frame, write_frame, DeviceRequest, DeviceResponse, RequestType};
use crate::error::{TemError, TemResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Connections idle for longer than this are closed by the server.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Device-specific request handling.
///
/// `Ping` is answered by the server itself; every other request type reaches
/// `handle`. A returned error is mapped to its wire status.
#[async_trait]
pub trait DeviceHandler: Send + Sync + 'static {
    /// Name used in logs, e.g. `detector/haadf`.
    fn device_name(&self) -> String;

    /// Serve one request and return the response payload.
    async fn handle(&self, request: &DeviceRequest) -> TemResult<Bytes>;
}

/// TCP server exposing one device.
pub struct DeviceServer {
    listener: TcpListener,
    handler: Arc<dyn DeviceHandler>,
    call_lock: Arc<Mutex<()>>,
    idle_timeout: Duration,
}

impl DeviceServer {
    /// Bind `addr`; port 0 picks an ephemeral port.
    pub async fn bind(addr: &str, handler: Arc<dyn DeviceHandler>) -> TemResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            device = %handler.device_name(),
            addr = %listener.local_addr()?,
            "Device server listening"
        );

        Ok(Self {
            listener,
            handler,
            call_lock: Arc::new(Mutex::new(())),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Close connections idle for longer than this.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Bound address.
    pub fn local_addr(&self) -> TemResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> TemResult<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let handler = self.handler.clone();
                            let call_lock = self.call_lock.clone();
                            let idle_timeout = self.idle_timeout;
                            let shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_client(
                                    socket,
                                    addr,
                                    handler,
                                    call_lock,
                                    idle_timeout,
                                    shutdown,
                                )
                                .await
                                {
                                    warn!(%addr, error = %e, "Client connection ended with error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Accept error"),
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(device = %self.handler.device_name(), "Device server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(self) -> TemResult<ServerHandle> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(ServerHandle {
            addr,
            shutdown_tx,
            task,
        })
    }

    async fn handle_client(
        mut socket: TcpStream,
        addr: SocketAddr,
        handler: Arc<dyn DeviceHandler>,
        call_lock: Arc<Mutex<()>>,
        idle_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> TemResult<()> {
        debug!(%addr, device = %handler.device_name(), "Client connected");

        loop {
            let frame = tokio::select! {
                read = timeout(idle_timeout, read_frame(&mut socket)) => read,
                _ = shutdown.changed() => break,
            };

            let body = match frame {
                Ok(Ok(Some(body))) => body,
                Ok(Ok(None)) => {
                    debug!(%addr, "Client disconnected");
                    break;
                }
                Ok(Err(e @ TemError::Protocol(_))) => {
                    // Frame length is unusable; the stream cannot be resynchronised.
                    let _ = write_frame(&mut socket, &error_response(0, &e).encode()).await;
                    return Err(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(%addr, ?idle_timeout, "Closing idle client connection");
                    break;
                }
            };

            let response = match DeviceRequest::decode(&body) {
                Ok(request) => Self::process_request(&request, &handler, &call_lock).await,
                Err(e) => {
                    warn!(%addr, error = %e, "Failed to decode request");
                    error_response(0, &e)
                }
            };

            write_frame(&mut socket, &response.encode()).await?;
        }

        Ok(())
    }

    async fn process_request(
        request: &DeviceRequest,
        handler: &Arc<dyn DeviceHandler>,
        call_lock: &Mutex<()>,
    ) -> DeviceResponse {
        if request.request_type == RequestType::Ping {
            return DeviceResponse::success(request.request_id, Bytes::new());
        }

        let _guard = call_lock.lock().await;
        match handler.handle(request).await {
            Ok(payload) => DeviceResponse::success(request.request_id, payload),
            Err(e) => {
                debug!(
                    device = %handler.device_name(),
                    request = ?request.request_type,
                    kind = e.kind(),
                    error = %e,
                    "Request failed"
                );
                error_response(request.request_id, &e)
            }
        }
    }
}

/// Handle to a server running on a background task.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<TemResult<()>>,
}

impl ServerHandle {
    /// Address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, close every open connection and wait for the listener to exit.
    pub async fn shutdown(self) -> TemResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| TemError::Protocol(format!("server task failed: {e}")))?
    }
}
