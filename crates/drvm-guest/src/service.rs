use std::io;
use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use drvm_rpc::api::{self, DeviceParams, ListDriversParams};
use drvm_rpc::{HandlerResult, RpcServer};
use serde_json::{Map, Value};

use crate::manager::GuestDriverManager;

pub type SharedManager = Arc<Mutex<GuestDriverManager>>;

/// Bind the RPC listener and wire the four control-plane methods to `manager`.
pub fn bind(addr: impl ToSocketAddrs, manager: GuestDriverManager) -> io::Result<RpcServer> {
    let mut server = RpcServer::bind(addr)?;
    register_handlers(&mut server, Arc::new(Mutex::new(manager)));
    Ok(server)
}

pub fn register_handlers(server: &mut RpcServer, manager: SharedManager) {
    register(server, api::LIST_DRIVERS, &manager, |m, params| {
        let params: ListDriversParams = api::from_payload(params)?;
        let list = m.list_drivers(params.category.as_deref())?;
        Ok(api::to_payload(&list)?)
    });
    register(server, api::INSTALL_DRIVER, &manager, |m, params| {
        let params: DeviceParams = api::from_payload(params)?;
        Ok(api::to_payload(&m.install_driver(&params.device_id)?)?)
    });
    register(server, api::UNINSTALL_DRIVER, &manager, |m, params| {
        let params: DeviceParams = api::from_payload(params)?;
        Ok(api::to_payload(&m.uninstall_driver(&params.device_id)?)?)
    });
    register(server, api::GET_STATUS, &manager, |m, _| {
        Ok(api::to_payload(&m.status())?)
    });
}

fn register<F>(server: &mut RpcServer, method: &str, manager: &SharedManager, handler: F)
where
    F: Fn(&mut GuestDriverManager, Map<String, Value>) -> anyhow::Result<Map<String, Value>>
        + Send
        + Sync
        + 'static,
{
    let manager = Arc::clone(manager);
    server.register(method, move |params: Map<String, Value>| -> HandlerResult {
        handler(&mut lock(&manager), params).map_err(Into::into)
    });
}

fn lock(manager: &SharedManager) -> MutexGuard<'_, GuestDriverManager> {
    manager.lock().unwrap_or_else(PoisonError::into_inner)
}
