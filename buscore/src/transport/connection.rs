//! A transport backed by a real bus connection.

use {
    crate::{transport::Transport, Error},
    error_reporter::Report,
    parking_lot::Mutex,
    std::{sync::Arc, time::Duration},
    tokio::{
        runtime::Runtime,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        task::JoinHandle,
    },
    zbus::{export::futures_util::StreamExt, Message, MessageStream},
};

struct Tasks {
    send: Option<JoinHandle<()>>,
    recv: Option<JoinHandle<()>>,
}

/// A [Transport] that talks to a bus daemon through a [zbus::Connection].
///
/// The connection is driven by a small runtime owned by this object. Outgoing messages
/// are queued and written by a send task, incoming messages are read by a receive task
/// and buffered until [Transport::recv] picks them up.
pub struct ZbusTransport {
    runtime: Runtime,
    connection: zbus::Connection,
    queue: UnboundedSender<Message>,
    incoming: Mutex<UnboundedReceiver<Message>>,
    tasks: Arc<Mutex<Tasks>>,
}

fn runtime() -> Result<Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("buscore-io")
        .enable_all()
        .build()
        .map_err(|e| Error::Runtime(Arc::new(e)))
}

impl ZbusTransport {
    /// Connects to the session bus.
    pub fn session() -> Result<Self, Error> {
        let runtime = runtime()?;
        let connection = runtime
            .block_on(zbus::Connection::session())
            .map_err(|e| Error::Connect(Arc::new(e)))?;
        Ok(Self::start(runtime, connection))
    }

    /// Connects to the system bus.
    pub fn system() -> Result<Self, Error> {
        let runtime = runtime()?;
        let connection = runtime
            .block_on(zbus::Connection::system())
            .map_err(|e| Error::Connect(Arc::new(e)))?;
        Ok(Self::start(runtime, connection))
    }

    /// The underlying connection.
    pub fn connection(&self) -> &zbus::Connection {
        &self.connection
    }

    fn start(runtime: Runtime, connection: zbus::Connection) -> Self {
        let (queue, outgoing) = mpsc::unbounded_channel();
        let (incoming_send, incoming) = mpsc::unbounded_channel();
        let tasks = Arc::new(Mutex::new(Tasks {
            send: None,
            recv: None,
        }));
        {
            let mut t = tasks.lock();
            t.recv = Some(runtime.spawn(recv(connection.clone(), incoming_send)));
            t.send = Some(runtime.spawn(send(connection.clone(), outgoing, tasks.clone())));
        }
        Self {
            runtime,
            connection,
            queue,
            incoming: Mutex::new(incoming),
            tasks,
        }
    }
}

fn abort(tasks: &Mutex<Tasks>) {
    let mut tasks = tasks.lock();
    if let Some(task) = tasks.recv.take() {
        task.abort();
    }
    if let Some(task) = tasks.send.take() {
        task.abort();
    }
}

async fn send(
    connection: zbus::Connection,
    mut queue: UnboundedReceiver<Message>,
    tasks: Arc<Mutex<Tasks>>,
) {
    while let Some(msg) = queue.recv().await {
        if let Err(e) = connection.send(&msg).await {
            log::error!("Could not send a message: {}", Report::new(e));
            break;
        }
    }
    // Dropping the receive side of the incoming queue makes the next recv fail with
    // ConnectionLost.
    abort(&tasks);
}

async fn recv(connection: zbus::Connection, incoming: UnboundedSender<Message>) {
    let mut stream = MessageStream::from(&connection);
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                log::error!("Could not receive message: {}", Report::new(e));
                break;
            }
        };
        if incoming.send(msg).is_err() {
            break;
        }
    }
}

impl Transport for ZbusTransport {
    fn unique_name(&self) -> Option<String> {
        self.connection.unique_name().map(|n| n.to_string())
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        self.queue.send(msg).map_err(|_| Error::ConnectionLost)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Message>, Error> {
        let mut incoming = self.incoming.lock();
        let res = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, incoming.recv()).await });
        match res {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(Error::ConnectionLost),
            Err(_) => Ok(None),
        }
    }

    fn close(&self) {
        abort(&self.tasks);
    }
}

impl Drop for ZbusTransport {
    fn drop(&mut self) {
        self.close();
    }
}
