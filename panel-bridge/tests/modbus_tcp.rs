use std::{
    collections::HashMap,
    future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use panel_bridge::{
    config::{ConnectionConfig, ControlMode, PanelConfig},
    executor::{CommandExecutor, CONNECTION_UNAVAILABLE, TRANSPORT_ERROR},
    modbus::{ConnectionManager, ConnectionState, RegisterMapper, TcpTransport, WriteRequest},
};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
};
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};

/// A panel controller with `size` coils and `size` holding registers from address 0.
#[derive(Clone)]
struct PanelController {
    size: u16,
    coils: Arc<Mutex<HashMap<u16, bool>>>,
    registers: Arc<Mutex<HashMap<u16, u16>>>,
}

impl tokio_modbus::server::Service for PanelController {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::WriteSingleCoil(addr, value) if addr < self.size => {
                self.coils.lock().unwrap().insert(addr, value);
                Ok(Response::WriteSingleCoil(addr, value))
            }
            Request::WriteSingleRegister(addr, value) if addr < self.size => {
                self.registers.lock().unwrap().insert(addr, value);
                Ok(Response::WriteSingleRegister(addr, value))
            }
            Request::WriteSingleCoil(..) | Request::WriteSingleRegister(..) => {
                Err(ExceptionCode::IllegalDataAddress)
            }
            _ => Err(ExceptionCode::IllegalFunction),
        };
        future::ready(res)
    }
}

async fn start_controller(size: u16) -> (SocketAddr, PanelController) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    let controller = PanelController {
        size,
        coils: Default::default(),
        registers: Default::default(),
    };

    let service = controller.clone();
    tokio::spawn(async move {
        let server = Server::new(listener);
        // Borrowing keeps the closure `Copy`, which `on_connected` needs.
        let service = &service;
        let new_service = |_socket_addr| Ok(Some(service.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| eprintln!("controller error: {err}");
        let _ = server.serve(&on_connected, on_process_error).await;
    });

    (socket_addr, controller)
}

fn executor(socket_addr: SocketAddr, panels: PanelConfig) -> CommandExecutor<TcpTransport> {
    executor_with_timeout(socket_addr, panels, Duration::from_secs(2))
}

fn executor_with_timeout(
    socket_addr: SocketAddr,
    panels: PanelConfig,
    timeout: Duration,
) -> CommandExecutor<TcpTransport> {
    let connection = ConnectionManager::new(
        ConnectionConfig {
            host: socket_addr.ip().to_string(),
            port: socket_addr.port(),
            unit_id: 1,
            timeout,
        },
        TcpTransport::new(),
    );
    CommandExecutor::new(RegisterMapper::new(panels), connection)
}

/// Length of a Write Single Coil ADU: MBAP header, function code, address and value.
const WRITE_SINGLE_COIL_LEN: usize = 12;

/// A controller that hangs up on its first client right after reading a request, and echoes every request (the valid
/// reply to Write Single Coil) on later connections. Returns the number of accepted connections so far.
async fn start_flaky_controller() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            tokio::spawn(async move {
                let mut adu = [0; WRITE_SINGLE_COIL_LEN];
                while stream.read_exact(&mut adu).await.is_ok() {
                    if first || stream.write_all(&adu).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (socket_addr, accepted)
}

#[tokio::test]
async fn switches_panel_coils() {
    let (socket_addr, controller) = start_controller(4).await;
    let mut executor = executor(socket_addr, PanelConfig::default());

    let on = executor.execute(WriteRequest::switch(2, true)).await;
    let off = executor.execute(WriteRequest::switch(0, false)).await;

    assert!(on.success, "{on:?}");
    assert_eq!(on.address, Some(2));
    assert!(off.success, "{off:?}");
    assert_eq!(
        *controller.coils.lock().unwrap(),
        HashMap::from([(2, true), (0, false)])
    );
    assert_eq!(executor.connection().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn sets_panel_power_registers() {
    let (socket_addr, controller) = start_controller(4).await;
    let mut executor = executor(
        socket_addr,
        PanelConfig {
            control_mode: ControlMode::Variable,
            base_register_address: 1,
            ..Default::default()
        },
    );

    let outcome = executor.execute(WriteRequest::power(2, 60)).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.address, Some(3));

    let rejected = executor.execute(WriteRequest::power(2, 101)).await;
    assert!(!rejected.success);

    assert_eq!(
        *controller.registers.lock().unwrap(),
        HashMap::from([(3, 60)])
    );
}

#[tokio::test]
async fn device_exception_keeps_session() {
    let (socket_addr, _controller) = start_controller(2).await;
    let mut executor = executor(
        socket_addr,
        PanelConfig {
            count: 4,
            ..Default::default()
        },
    );

    let outcome = executor.execute(WriteRequest::switch(3, true)).await;

    assert!(!outcome.success);
    assert_eq!(outcome.address, Some(3));
    let reason = outcome.error_reason.unwrap();
    assert!(!reason.is_empty());
    assert_ne!(reason, TRANSPORT_ERROR);
    assert_ne!(reason, CONNECTION_UNAVAILABLE);
    assert_eq!(executor.connection().state(), ConnectionState::Connected);

    assert!(executor.execute(WriteRequest::switch(1, true)).await.success);
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    drop(listener);

    let mut executor = executor(socket_addr, PanelConfig::default());
    let outcome = executor.execute(WriteRequest::switch(0, true)).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_reason.as_deref(), Some(CONNECTION_UNAVAILABLE));
    assert_eq!(executor.connection().state(), ConnectionState::Failed);
}

#[tokio::test]
async fn connect_timeout_is_unavailable() {
    // A listener that never accepts. Once its accept queue is full, further SYNs go unanswered.
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let socket_addr = listener.local_addr().unwrap();

    let mut backlog = vec![];
    let mut saturated = false;
    for _ in 0..64 {
        let attempt = TcpStream::connect(socket_addr);
        match tokio::time::timeout(Duration::from_millis(200), attempt).await {
            Ok(stream) => backlog.push(stream.unwrap()),
            Err(_) => {
                saturated = true;
                break;
            }
        }
    }
    assert!(saturated, "accept queue never filled");

    let mut executor = executor_with_timeout(
        socket_addr,
        PanelConfig::default(),
        Duration::from_millis(300),
    );
    let outcome = executor.execute(WriteRequest::switch(0, true)).await;

    assert!(!outcome.success);
    assert_eq!(outcome.address, Some(0));
    assert_eq!(outcome.error_reason.as_deref(), Some(CONNECTION_UNAVAILABLE));
    assert_eq!(executor.connection().state(), ConnectionState::Failed);
    drop(listener);
}

#[tokio::test]
async fn dropped_session_reconnects_once() {
    let (socket_addr, accepted) = start_flaky_controller().await;
    let mut executor = executor(socket_addr, PanelConfig::default());

    let hung_up = executor.execute(WriteRequest::switch(0, true)).await;
    assert!(!hung_up.success);
    assert_eq!(hung_up.address, Some(0));
    assert_eq!(hung_up.error_reason.as_deref(), Some(TRANSPORT_ERROR));
    assert_eq!(executor.connection().state(), ConnectionState::Failed);

    let retried = executor.execute(WriteRequest::switch(0, true)).await;
    assert!(retried.success, "{retried:?}");
    let reused = executor.execute(WriteRequest::switch(1, false)).await;
    assert!(reused.success, "{reused:?}");

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(executor.connection().state(), ConnectionState::Connected);
}
