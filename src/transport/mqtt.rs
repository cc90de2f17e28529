//! MQTT v3.1.1 Client Transport
//!
//! One spawned task owns the TCP session. Calls on [`MqttTransport`] become
//! commands on a channel into that task, which multiplexes them with socket
//! reads and keep-alive pings. A lost session is re-established with
//! exponential backoff and the remembered filters are subscribed again.

use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Interval};
use tracing::{debug, error, info, warn};

use super::{BrokerAddress, EventSender, Transport, TransportEvent};
use crate::codec::{Decoder, Encoder};
use crate::config::BrokerConfig;
use crate::error::ConnectionError;
use crate::message::Message;
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAckCode, Subscribe, Subscription, Unsubscribe,
};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Floor for reconnect delays, so a zero interval never spins
const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(10);

/// Request from the transport handle to the session task
#[derive(Debug)]
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Shutdown,
}

/// MQTT client transport over plain TCP
pub struct MqttTransport {
    config: BrokerConfig,
    /// Filters replayed after a reconnect
    filters: Arc<RwLock<AHashMap<String, QoS>>>,
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            filters: Arc::new(RwLock::new(AHashMap::new())),
            command_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn sender(&self) -> Result<mpsc::Sender<Command>, ConnectionError> {
        self.command_tx
            .lock()
            .clone()
            .ok_or_else(|| ConnectionError::Lost("not connected".to_string()))
    }
}

fn task_stopped() -> ConnectionError {
    ConnectionError::Lost("session task stopped".to_string())
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, address: &str, events: EventSender) -> Result<(), ConnectionError> {
        let address = BrokerAddress::parse(address)?;

        let mut command_tx = self.command_tx.lock();
        if command_tx.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(ConnectionError::AlreadyConnected);
        }

        // Filters from a previous session task are subscribed again by the caller
        self.filters.write().clear();
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let driver = SessionDriver::new(self.config.clone(), address, self.filters.clone(), events);
        let handle = tokio::spawn(driver.run(rx));

        *command_tx = Some(tx);
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ConnectionError> {
        let tx = self.sender()?;
        tx.send(Command::Subscribe {
            filter: filter.to_string(),
            qos,
        })
        .await
        .map_err(|_| task_stopped())?;

        // Only filters the session task accepted are replayed after a reconnect
        self.filters.write().insert(filter.to_string(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), ConnectionError> {
        self.filters.write().remove(filter);

        let tx = self.sender()?;
        tx.send(Command::Unsubscribe {
            filter: filter.to_string(),
        })
        .await
        .map_err(|_| task_stopped())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        let tx = self.sender()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Command::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            ack: ack_tx,
        })
        .await
        .map_err(|_| task_stopped())?;

        ack_rx.await.map_err(|_| task_stopped())?
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let tx = self.command_tx.lock().take();
        let task = self.task.lock().take();

        if let Some(tx) = tx {
            let _ = tx.send(Command::Shutdown).await;
        }
        if let Some(mut task) = task {
            if timeout(self.config.connect_timeout, &mut task).await.is_err() {
                warn!("MQTT session task did not stop in time, aborting");
                task.abort();
            }
        }
        Ok(())
    }
}

/// Socket halves plus bytes read but not yet decoded
struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
}

/// State owned by the session task
struct SessionDriver {
    config: BrokerConfig,
    address: BrokerAddress,
    filters: Arc<RwLock<AHashMap<String, QoS>>>,
    events: EventSender,
    encoder: Encoder,
    decoder: Decoder,
    write_buf: BytesMut,
    next_packet_id: u16,
}

impl SessionDriver {
    fn new(
        config: BrokerConfig,
        address: BrokerAddress,
        filters: Arc<RwLock<AHashMap<String, QoS>>>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            address,
            filters,
            events,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            write_buf: BytesMut::with_capacity(1024),
            next_packet_id: 1,
        }
    }

    fn emit(&self, event: TransportEvent) {
        // Receiver gone means the connection was dropped; nothing to report to
        let _ = self.events.send(event);
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    /// Connection loop: handshake, run, back off, repeat
    ///
    /// The first handshake failure is reported as an error and ends the task.
    /// Once a session was established, losing it is reported as a disconnect
    /// and followed by reconnect attempts unless reconnecting is disabled.
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut retry_interval = self.config.reconnect_interval;
        let mut established = false;

        loop {
            debug!("MQTT {}: connecting", self.address);

            let attempt = tokio::select! {
                result = self.handshake() => result,
                _ = drain_until_shutdown(&mut commands) => {
                    debug!("MQTT {}: shutdown during handshake", self.address);
                    return;
                }
            };

            let mut session = match attempt {
                Ok(session) => session,
                Err(e) if !established => {
                    error!("MQTT {}: connection failed: {}", self.address, e);
                    self.emit(TransportEvent::Error(e.to_string()));
                    return;
                }
                Err(e) => {
                    warn!("MQTT {}: reconnect failed: {}", self.address, e);
                    if !self.backoff(&mut retry_interval, &mut commands).await {
                        return;
                    }
                    continue;
                }
            };

            // The connection subscribes its own filters after a fresh connect
            let restore = established;
            established = true;
            retry_interval = self.config.reconnect_interval;
            self.emit(TransportEvent::Connect);

            match self.run_session(&mut session, &mut commands, restore).await {
                Ok(()) => {
                    info!("MQTT {}: disconnected gracefully", self.address);
                    self.emit(TransportEvent::Disconnect(None));
                    return;
                }
                Err(e) => {
                    warn!("MQTT {}: session lost: {}", self.address, e);
                    self.emit(TransportEvent::Disconnect(Some(e.to_string())));
                    if !self.config.reconnect {
                        return;
                    }
                    self.emit(TransportEvent::Reconnect);
                    if !self.backoff(&mut retry_interval, &mut commands).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep for the current backoff interval, then double it.
    /// Returns false if shutdown was requested meanwhile.
    async fn backoff(
        &self,
        retry_interval: &mut Duration,
        commands: &mut mpsc::Receiver<Command>,
    ) -> bool {
        let delay = (*retry_interval).max(MIN_RECONNECT_INTERVAL);
        *retry_interval = next_backoff(delay, self.config.max_reconnect_interval);
        debug!("MQTT {}: reconnecting in {:?}", self.address, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = drain_until_shutdown(commands) => {
                debug!("MQTT {}: shutdown during backoff", self.address);
                false
            }
        }
    }

    async fn handshake(&mut self) -> Result<Session, ConnectionError> {
        let connect_timeout = self.config.connect_timeout;

        let stream = timeout(
            connect_timeout,
            TcpStream::connect((self.address.host.as_str(), self.address.port)),
        )
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)?
        .map_err(|e| ConnectionError::Unreachable(format!("{}: {}", self.address, e)))?;
        let _ = stream.set_nodelay(true);

        debug!("MQTT {}: TCP connected", self.address);

        let (reader, writer) = stream.into_split();
        let mut session = Session {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(4096),
        };

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.config.client_id.clone(),
            clean_session: self.config.clean_session,
            keep_alive: self.config.keepalive,
            username: self.config.username.clone(),
            password: self.config.password.as_ref().map(|p| Bytes::from(p.clone())),
        }));
        self.send(&mut session.writer, &connect).await?;

        debug!("MQTT {}: CONNECT sent", self.address);

        let packet = timeout(connect_timeout, read_packet(&self.decoder, &mut session))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)??;

        match packet {
            Packet::ConnAck(connack) if connack.return_code == ConnectReturnCode::Accepted => {
                info!(
                    "MQTT {}: connected as '{}' (session_present={})",
                    self.address, self.config.client_id, connack.session_present
                );
                Ok(session)
            }
            Packet::ConnAck(connack) => {
                Err(ConnectionError::Rejected(connack.return_code.to_string()))
            }
            other => Err(ConnectionError::Rejected(format!(
                "expected CONNACK, got packet type {}",
                other.packet_type()
            ))),
        }
    }

    /// Serve one established session until shutdown or failure
    async fn run_session(
        &mut self,
        session: &mut Session,
        commands: &mut mpsc::Receiver<Command>,
        restore: bool,
    ) -> Result<(), ConnectionError> {
        if restore {
            self.resubscribe(session).await?;
        }

        let keepalive = self.config.keepalive_duration();
        let mut keepalive_timer =
            keepalive.map(|period| tokio::time::interval_at(Instant::now() + period, period));
        let mut last_inbound = Instant::now();
        let mut awaiting_rel: AHashSet<u16> = AHashSet::new();

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Publish { topic, payload, qos, retain, ack }) => {
                            let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
                            let publish = Packet::Publish(Publish {
                                dup: false,
                                qos,
                                retain,
                                topic,
                                packet_id,
                                payload,
                            });
                            let result = self.send(&mut session.writer, &publish).await;
                            let _ = ack.send(result.clone());
                            result?;
                        }
                        Some(Command::Subscribe { filter, qos }) => {
                            let packet_id = self.next_packet_id();
                            debug!("MQTT {}: SUBSCRIBE {} (id {})", self.address, filter, packet_id);
                            let subscribe = Packet::Subscribe(Subscribe {
                                packet_id,
                                subscriptions: vec![Subscription { filter, qos }],
                            });
                            self.send(&mut session.writer, &subscribe).await?;
                        }
                        Some(Command::Unsubscribe { filter }) => {
                            let packet_id = self.next_packet_id();
                            debug!("MQTT {}: UNSUBSCRIBE {} (id {})", self.address, filter, packet_id);
                            let unsubscribe = Packet::Unsubscribe(Unsubscribe {
                                packet_id,
                                filters: vec![filter],
                            });
                            self.send(&mut session.writer, &unsubscribe).await?;
                        }
                        Some(Command::Shutdown) | None => {
                            let _ = self.send(&mut session.writer, &Packet::Disconnect).await;
                            let _ = session.writer.shutdown().await;
                            return Ok(());
                        }
                    }
                }

                packet = read_packet(&self.decoder, session) => {
                    last_inbound = Instant::now();
                    self.handle_packet(packet?, session, &mut awaiting_rel).await?;
                }

                _ = tick(&mut keepalive_timer) => {
                    if let Some(period) = keepalive {
                        if last_inbound.elapsed() > period * 3 / 2 {
                            return Err(ConnectionError::Lost("keep alive timeout".to_string()));
                        }
                    }
                    self.send(&mut session.writer, &Packet::PingReq).await?;
                }
            }
        }
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        session: &mut Session,
        awaiting_rel: &mut AHashSet<u16>,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Publish(publish) => {
                let packet_id = publish.packet_id;
                let qos = publish.qos;
                let message = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos,
                    retain: publish.retain,
                };

                match (qos, packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.emit(TransportEvent::Message(message));
                        self.send(&mut session.writer, &Packet::PubAck(PubAck { packet_id }))
                            .await?;
                    }
                    (QoS::ExactlyOnce, Some(packet_id)) => {
                        // A redelivered PUBLISH before PUBREL is not dispatched twice
                        if awaiting_rel.insert(packet_id) {
                            self.emit(TransportEvent::Message(message));
                        }
                        self.send(&mut session.writer, &Packet::PubRec(PubRec { packet_id }))
                            .await?;
                    }
                    _ => self.emit(TransportEvent::Message(message)),
                }
            }
            Packet::PubRel(rel) => {
                awaiting_rel.remove(&rel.packet_id);
                self.send(
                    &mut session.writer,
                    &Packet::PubComp(PubComp {
                        packet_id: rel.packet_id,
                    }),
                )
                .await?;
            }
            Packet::PubRec(rec) => {
                self.send(
                    &mut session.writer,
                    &Packet::PubRel(PubRel {
                        packet_id: rec.packet_id,
                    }),
                )
                .await?;
            }
            Packet::PubAck(ack) => {
                debug!("MQTT {}: PUBACK {}", self.address, ack.packet_id);
            }
            Packet::PubComp(comp) => {
                debug!("MQTT {}: PUBCOMP {}", self.address, comp.packet_id);
            }
            Packet::SubAck(suback) => {
                if suback.return_codes.contains(&SubAckCode::Failure) {
                    warn!(
                        "MQTT {}: broker refused subscription (id {})",
                        self.address, suback.packet_id
                    );
                } else {
                    debug!("MQTT {}: SUBACK {}", self.address, suback.packet_id);
                }
            }
            Packet::UnsubAck(unsuback) => {
                debug!("MQTT {}: UNSUBACK {}", self.address, unsuback.packet_id);
            }
            Packet::PingResp => {
                debug!("MQTT {}: PINGRESP received", self.address);
            }
            other => {
                return Err(ConnectionError::Lost(format!(
                    "unexpected packet type {} from broker",
                    other.packet_type()
                )));
            }
        }
        Ok(())
    }

    /// Subscribe again to every remembered filter
    async fn resubscribe(&mut self, session: &mut Session) -> Result<(), ConnectionError> {
        let subscriptions: Vec<Subscription> = self
            .filters
            .read()
            .iter()
            .map(|(filter, qos)| Subscription {
                filter: filter.clone(),
                qos: *qos,
            })
            .collect();

        if subscriptions.is_empty() {
            return Ok(());
        }

        debug!(
            "MQTT {}: restoring {} subscriptions",
            self.address,
            subscriptions.len()
        );
        let packet_id = self.next_packet_id();
        self.send(
            &mut session.writer,
            &Packet::Subscribe(Subscribe {
                packet_id,
                subscriptions,
            }),
        )
        .await
    }

    async fn send(
        &mut self,
        writer: &mut OwnedWriteHalf,
        packet: &Packet,
    ) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Lost(format!("encode error: {}", e)))?;
        writer
            .write_all(&self.write_buf)
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))
    }
}

/// Read until one complete packet is buffered
///
/// Cancel safe: partially read bytes stay in the session buffer.
async fn read_packet(decoder: &Decoder, session: &mut Session) -> Result<Packet, ConnectionError> {
    loop {
        if let Some((packet, len)) = decoder
            .decode(&session.read_buf)
            .map_err(|e| ConnectionError::Lost(format!("decode error: {}", e)))?
        {
            session.read_buf.advance(len);
            return Ok(packet);
        }

        let n = session
            .reader
            .read_buf(&mut session.read_buf)
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::Lost(
                "connection closed by broker".to_string(),
            ));
        }
    }
}

/// Double `current`, capped at `max` and never below the floor
fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max).max(MIN_RECONNECT_INTERVAL)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Answer commands while no session is up
///
/// Returns once shutdown is requested or the transport handle is dropped.
/// Subscription changes need no answer here; the filter set is replayed on the
/// next session.
async fn drain_until_shutdown(commands: &mut mpsc::Receiver<Command>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Shutdown => return,
            Command::Publish { ack, .. } => {
                let _ = ack.send(Err(ConnectionError::Lost(
                    "no active session".to_string(),
                )));
            }
            Command::Subscribe { .. } | Command::Unsubscribe { .. } => {}
        }
    }
}
