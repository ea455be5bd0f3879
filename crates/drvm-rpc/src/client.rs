use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::api::{self, ActionReply, DeviceParams, DriverList, GuestDriver, GuestStatus, ListDriversParams};
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{self, Message, MessageType};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Host-side client holding one persistent connection to the guest service.
///
/// Every request/response pair runs under a single lock, so concurrent
/// callers are queued and never interleave frames on the wire. Any transport
/// failure drops the connection; later calls fail with
/// [`Error::VmUnavailable`] until [`RpcClient::connect`] succeeds again.
pub struct RpcClient {
    addr: String,
    request_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>) -> Self {
        RpcClient {
            addr: addr.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            conn: Mutex::new(None),
        }
    }

    /// How long a single request may wait for its response.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Open (or reopen) the connection. Returns `false` instead of an error
    /// so callers can poll while the guest boots.
    pub fn connect(&self, timeout: Duration) -> bool {
        let mut conn = self.lock();
        match self.open(timeout) {
            Ok(stream) => {
                info!(addr = %self.addr, "connected to guest");
                *conn = Some(stream);
                true
            }
            Err(e) => {
                error!(addr = %self.addr, error = %e, "failed to connect to guest");
                *conn = None;
                false
            }
        }
    }

    pub fn disconnect(&self) {
        if self.lock().take().is_some() {
            info!(addr = %self.addr, "disconnected from guest");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// Send one request and block until its response arrives.
    pub fn send_request(&self, method: &str, params: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut conn = self.lock();
        let Some(stream) = conn.as_mut() else {
            return Err(Error::VmUnavailable("not connected".into()));
        };

        debug!(method, "sending request");
        match exchange(stream, &Message::request(method, params)) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                warn!(method, error = %e, "request failed, dropping connection");
                *conn = None;
                Err(e)
            }
        }
    }

    /// Typed request: serializes `params`, checks `success`, deserializes the reply.
    pub fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: &P) -> Result<R> {
        let payload = self.send_request(method, api::to_payload(params)?)?;
        api::ensure_success(&payload)?;
        Ok(api::from_payload(payload)?)
    }

    pub fn list_drivers(&self, category: Option<&str>) -> Result<Vec<GuestDriver>> {
        let params = ListDriversParams {
            category: category.map(str::to_string),
        };
        let list: DriverList = self.call(api::LIST_DRIVERS, &params)?;
        Ok(list.drivers)
    }

    pub fn install_driver(&self, device_id: &str) -> Result<ActionReply> {
        let params = DeviceParams {
            device_id: device_id.to_string(),
        };
        self.call(api::INSTALL_DRIVER, &params)
    }

    pub fn uninstall_driver(&self, device_id: &str) -> Result<ActionReply> {
        let params = DeviceParams {
            device_id: device_id.to_string(),
        };
        self.call(api::UNINSTALL_DRIVER, &params)
    }

    pub fn get_status(&self) -> Result<GuestStatus> {
        self.call(api::GET_STATUS, &Map::new())
    }

    fn open(&self, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.request_timeout))?;
                    stream.set_write_timeout(Some(self.request_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve")
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn exchange(stream: &mut TcpStream, request: &Message) -> Result<Map<String, Value>> {
    protocol::write_message(stream, request).map_err(transport_error)?;

    let response = protocol::read_message(stream)
        .map_err(transport_error)?
        .ok_or_else(|| Error::VmUnavailable("connection closed by guest".into()))?;

    if response.msg_type != MessageType::Response {
        return Err(ProtocolError::UnexpectedType(response.msg_type).into());
    }
    Ok(response.payload)
}

fn transport_error(err: ProtocolError) -> Error {
    match err {
        ProtocolError::Io(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            Error::Timeout
        }
        ProtocolError::Io(e) => Error::VmUnavailable(e.to_string()),
        other => Error::Protocol(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn calls_fail_fast_when_not_connected() {
        let client = RpcClient::new("127.0.0.1:1");
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_request("get_status", Map::new()),
            Err(Error::VmUnavailable(_))
        ));
    }

    #[test]
    fn connect_reports_refusal_as_false() {
        // Grab a free port and release it so nothing is listening there.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = RpcClient::new(format!("127.0.0.1:{port}"));
        assert!(!client.connect(Duration::from_millis(200)));
        assert!(!client.is_connected());
    }

    #[test]
    fn timeouts_are_classified() {
        let err = transport_error(ProtocolError::Io(io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(matches!(err, Error::Timeout));
        let err = transport_error(ProtocolError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(matches!(err, Error::VmUnavailable(_)));
        let err = transport_error(ProtocolError::BadVersion(7));
        assert!(matches!(err, Error::Protocol(ProtocolError::BadVersion(7))));
    }
}
