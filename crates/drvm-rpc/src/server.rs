use std::any::Any;
use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::api::failure;
use crate::protocol::{self, Message, MessageType};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<Map<String, Value>, HandlerError>;

type BoxedHandler = Box<dyn Fn(Map<String, Value>) -> HandlerResult + Send + Sync>;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Guest-side server: one listener, one worker thread per connection,
/// requests dispatched by method name.
pub struct RpcServer {
    listener: TcpListener,
    handlers: HashMap<String, BoxedHandler>,
}

impl RpcServer {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, "RPC server listening");
        Ok(RpcServer {
            listener,
            handlers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn register<F>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Map<String, Value>) -> HandlerResult + Send + Sync + 'static,
    {
        let method = method.into();
        debug!(method, "registered handler");
        self.handlers.insert(method, Box::new(handler));
    }

    /// Run the accept loop on the current thread. Only returns on a listener
    /// setup error.
    pub fn serve(self) -> io::Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let (listener, dispatcher) = self.into_parts()?;
        accept_loop(listener, dispatcher, stop);
        Ok(())
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let addr = self.listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let (listener, dispatcher) = self.into_parts()?;

        let stop_flag = stop.clone();
        let thread = thread::Builder::new()
            .name("drvm-rpc-accept".into())
            .spawn(move || accept_loop(listener, dispatcher, stop_flag))?;

        Ok(ServerHandle {
            addr,
            stop,
            thread: Some(thread),
        })
    }

    fn into_parts(self) -> io::Result<(TcpListener, Arc<Dispatcher>)> {
        self.listener.set_nonblocking(true)?;
        let dispatcher = Arc::new(Dispatcher {
            handlers: self.handlers,
        });
        Ok((self.listener, dispatcher))
    }
}

/// Handle to a server started with [`RpcServer::spawn`]. Stops the accept
/// loop when dropped; connections already being served run to completion.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!(addr = %self.addr, "RPC server stopped");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Dispatcher {
    handlers: HashMap<String, BoxedHandler>,
}

impl Dispatcher {
    /// Never fails: every problem becomes a `{success: false, error}` reply.
    fn dispatch(&self, mut request: Map<String, Value>) -> Map<String, Value> {
        let method = match request.remove("method") {
            Some(Value::String(method)) => method,
            _ => return failure("Invalid request: missing method"),
        };
        let params = match request.remove("params") {
            Some(Value::Object(params)) => params,
            None | Some(Value::Null) => Map::new(),
            Some(_) => return failure("Invalid request: params must be an object"),
        };

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, "unknown method");
            return failure(format!("Unknown method: {method}"));
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!(method, error = %e, "handler error");
                failure(e.to_string())
            }
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                error!(method, reason, "handler panicked");
                failure(format!("Handler panicked: {reason}"))
            }
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "client connected");
                let dispatcher = Arc::clone(&dispatcher);
                let spawned = thread::Builder::new()
                    .name(format!("drvm-rpc-{peer}"))
                    .spawn(move || handle_connection(stream, peer, &dispatcher));
                if let Err(e) = spawned {
                    error!(%peer, error = %e, "failed to spawn connection worker");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    warn!(error = %e, "accept error");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, dispatcher: &Dispatcher) {
    // Accepted sockets inherit O_NONBLOCK from the listener on some platforms.
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(%peer, error = %e, "could not switch connection to blocking mode");
        return;
    }
    let mut reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(e) => {
            warn!(%peer, error = %e, "could not clone connection");
            return;
        }
    };
    let mut writer = stream;

    loop {
        let frame = match protocol::read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_foreign_frame() => {
                warn!(%peer, error = %e, "skipping foreign frame");
                continue;
            }
            Err(e) => {
                warn!(%peer, error = %e, "closing connection");
                break;
            }
        };

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "dropping undecodable frame");
                continue;
            }
        };

        if message.msg_type != MessageType::Request {
            debug!(%peer, msg_type = ?message.msg_type, "ignoring non-request frame");
            continue;
        }

        let reply = Message::response(dispatcher.dispatch(message.payload));
        if let Err(e) = protocol::write_message(&mut writer, &reply) {
            warn!(%peer, error = %e, "failed to send response");
            break;
        }
    }

    info!(%peer, "client disconnected");
}
