// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT transport built on the `rumqttc` async client.
//!
//! The event loop is polled from the network task only. `connect` drives it
//! until the CONNACK and SUBACK arrive; `run` keeps polling until the link
//! drops or the task is cancelled, and a cancelled session flushes a
//! DISCONNECT before the socket is dropped.

use crate::config::MqttConfig;
use crate::error::ConnectionError;
use crate::transport::{BrokerEvents, BrokerTransport, SessionControl, SessionEnd};
use rumqttc::{
    AsyncClient, ConnectionError as LinkError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubscribeReasonCode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 64;

/// Upper bound for CONNACK and SUBACK.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for flushing the DISCONNECT on a cancelled session.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

struct Session {
    event_loop: EventLoop,
    events: Arc<dyn BrokerEvents>,
    disconnect: Arc<Disconnector>,
}

/// [`BrokerTransport`] over a plain TCP MQTT 3.1.1 connection.
pub struct MqttTransport {
    config: MqttConfig,
    handshake_timeout: Duration,
    session: Option<Session>,
}

/// Queues at most one DISCONNECT per session, whether it is asked for by
/// the subscriber or by a cancelled `run`.
struct Disconnector {
    client: AsyncClient,
    queued: AtomicBool,
}

impl Disconnector {
    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            queued: AtomicBool::new(false),
        }
    }

    /// Returns `true` for the call that queued the request.
    fn request(&self) -> bool {
        if self.queued.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("disconnect request not queued: {}", e);
            self.queued.store(false, Ordering::Release);
            return false;
        }
        true
    }
}

impl SessionControl for Disconnector {
    fn request_disconnect(&self) {
        self.request();
    }
}

impl MqttTransport {
    /// Create a transport for the given broker settings.
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session: None,
        }
    }

    /// Override the CONNACK/SUBACK timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn options(&self) -> Result<MqttOptions, ConnectionError> {
        let host = self.config.broker.trim();
        if host.is_empty() {
            return Err(ConnectionError::InvalidSettings(
                "broker host is empty".to_string(),
            ));
        }

        let mut options = MqttOptions::new(self.config.client_id.clone(), host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(1)));
        options.set_clean_session(true);
        if let Some((user, pass)) = self.config.credentials() {
            options.set_credentials(user, pass);
        }
        Ok(options)
    }
}

impl BrokerTransport for MqttTransport {
    async fn connect(
        &mut self,
        filter: &str,
        events: Arc<dyn BrokerEvents>,
    ) -> Result<Arc<dyn SessionControl>, ConnectionError> {
        let options = self.options()?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tracing::info!(
            "Connecting to broker {}:{}...",
            self.config.broker,
            self.config.port
        );

        let handshake = handshake(&self.config, &mut event_loop, &client, filter, &events);
        match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ConnectionError::Timeout(self.handshake_timeout)),
        }

        events.on_connected(filter);
        let disconnect = Arc::new(Disconnector::new(client));
        self.session = Some(Session {
            event_loop,
            events,
            disconnect: Arc::clone(&disconnect),
        });

        Ok(disconnect)
    }

    async fn run(&mut self, cancel: CancellationToken) -> SessionEnd {
        let Some(mut session) = self.session.take() else {
            return SessionEnd::Closed;
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    close(&mut session).await;
                    return SessionEnd::Cancelled;
                }
                polled = session.event_loop.poll() => match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        session.events.on_message(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::info!("Broker closed the session");
                        session.events.on_disconnected();
                        return SessionEnd::Closed;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        session.events.on_disconnected();
                        return SessionEnd::Closed;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT link error: {}", e);
                        session.events.on_disconnected();
                        return SessionEnd::Closed;
                    }
                },
            }
        }
    }
}

async fn handshake(
    config: &MqttConfig,
    event_loop: &mut EventLoop,
    client: &AsyncClient,
    filter: &str,
    events: &Arc<dyn BrokerEvents>,
) -> Result<(), ConnectionError> {
    wait_for_connack(event_loop).await?;
    tracing::info!("Connected to broker {}:{}", config.broker, config.port);

    client
        .subscribe(filter, map_qos(config.qos)?)
        .await
        .map_err(|e| ConnectionError::Network(e.to_string()))?;
    wait_for_suback(event_loop, filter, events.as_ref()).await
}

/// Queue a DISCONNECT unless one is already pending, poll until it is on
/// the wire, then drop the socket.
async fn close(session: &mut Session) {
    session.disconnect.request();

    let flush = async {
        loop {
            match session.event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
        tracing::debug!("DISCONNECT not flushed within {:?}", CLOSE_TIMEOUT);
    }
    session.events.on_disconnected();
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(Event::Incoming(Packet::Disconnect)) => return Err(ConnectionError::Closed),
            Ok(_) => {}
            Err(e) => return Err(map_link_error(e)),
        }
    }
}

async fn wait_for_suback(
    event_loop: &mut EventLoop,
    filter: &str,
    events: &dyn BrokerEvents,
) -> Result<(), ConnectionError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if refused {
                    return Err(ConnectionError::SubscribeRefused(filter.to_string()));
                }
                return Ok(());
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                events.on_message(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => return Err(ConnectionError::Closed),
            Ok(_) => {}
            Err(e) => return Err(map_link_error(e)),
        }
    }
}

fn map_link_error(err: LinkError) -> ConnectionError {
    match err {
        LinkError::ConnectionRefused(code) => ConnectionError::Refused(format!("{:?}", code)),
        LinkError::RequestsDone => ConnectionError::Closed,
        other => ConnectionError::Network(other.to_string()),
    }
}

fn map_qos(qos: u8) -> Result<QoS, ConnectionError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConnectionError::InvalidSettings(format!(
            "unsupported MQTT QoS level: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{RunFlag, StopHandle, StopTrigger};
    use crate::sample::TopicBuffer;
    use crate::subscriber::{ConnectionState, Subscriber};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const SUBACK_GRANTED: u8 = 0x00;
    const SUBACK_FAILURE: u8 = 0x80;
    const DISCONNECT: u8 = 14;
    const WAIT: Duration = Duration::from_secs(5);

    fn mqtt_config(broker: &str, port: u16) -> MqttConfig {
        MqttConfig {
            broker: broker.to_string(),
            port,
            topic: "uwb".to_string(),
            client_id: "test-client".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            qos: 0,
        }
    }

    struct Recorder {
        connected: AtomicUsize,
        disconnects: AtomicUsize,
        messages: mpsc::UnboundedSender<(String, Vec<u8>)>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
            let (messages, rx) = mpsc::unbounded_channel();
            let recorder = Arc::new(Self {
                connected: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                messages,
            });
            (recorder, rx)
        }
    }

    impl BrokerEvents for Recorder {
        fn on_connected(&self, _filter: &str) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, topic: &str, payload: &[u8]) {
            let _ = self.messages.send((topic.to_string(), payload.to_vec()));
        }

        fn on_disconnected(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Read one control packet. Returns the first header byte and the body.
    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn publish_packet(topic: &str, payload: &str) -> Vec<u8> {
        let len = 2 + topic.len() + payload.len();
        assert!(len < 128, "single-byte remaining length");
        let mut packet = vec![0x30, len as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload.as_bytes());
        packet
    }

    /// Minimal MQTT 3.1.1 broker for one client.
    ///
    /// Answers CONNECT and SUBSCRIBE, sends `publish` if given, then records
    /// packet types until the client hangs up or `close` fires. Returns every
    /// packet type it received.
    fn fake_broker(
        listener: TcpListener,
        suback_code: u8,
        publish: Option<(&'static str, &'static str)>,
        close: Option<oneshot::Receiver<()>>,
    ) -> JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut types = Vec::new();

            let (header, _) = read_packet(&mut stream).await.expect("CONNECT");
            types.push(header >> 4);
            stream.write_all(&CONNACK).await.unwrap();

            let (header, body) = read_packet(&mut stream).await.expect("SUBSCRIBE");
            types.push(header >> 4);
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], suback_code])
                .await
                .unwrap();

            if let Some((topic, payload)) = publish {
                stream.write_all(&publish_packet(topic, payload)).await.unwrap();
            }

            let close = async move {
                match close {
                    Some(rx) => {
                        let _ = rx.await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(close);

            loop {
                tokio::select! {
                    _ = &mut close => break,
                    packet = read_packet(&mut stream) => match packet {
                        Some((header, _)) => types.push(header >> 4),
                        None => break,
                    },
                }
            }
            types
        })
    }

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn transport(port: u16) -> MqttTransport {
        MqttTransport::new(mqtt_config("127.0.0.1", port)).handshake_timeout(WAIT)
    }

    struct Collector {
        buffer: TopicBuffer,
        stop_rx: mpsc::UnboundedReceiver<StopTrigger>,
        subscriber: Arc<Subscriber>,
    }

    fn collector() -> Collector {
        let buffer = TopicBuffer::new();
        let (stop, stop_rx) = StopHandle::channel();
        let subscriber = Subscriber::new("uwb/#", "distance", buffer.writer(), RunFlag::new(), stop);
        Collector {
            buffer,
            stop_rx,
            subscriber,
        }
    }

    async fn wait_for_samples(buffer: &TopicBuffer, count: usize) {
        tokio::time::timeout(WAIT, async {
            while buffer.len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("samples recorded");
    }

    #[test]
    fn test_map_qos() {
        assert_eq!(map_qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(map_qos(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(map_qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(map_qos(3), Err(ConnectionError::InvalidSettings(_))));
    }

    #[test]
    fn test_options_reject_empty_host() {
        let transport = MqttTransport::new(mqtt_config("  ", 1883));
        assert!(matches!(
            transport.options(),
            Err(ConnectionError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_options_apply_keep_alive() {
        let mut config = mqtt_config("localhost", 1883);
        config.keep_alive_secs = 12;
        let options = MqttTransport::new(config).options().unwrap();
        assert_eq!(options.keep_alive(), Duration::from_secs(12));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_map_link_error() {
        assert_eq!(map_link_error(LinkError::RequestsDone), ConnectionError::Closed);
        let io = LinkError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(map_link_error(io), ConnectionError::Network(_)));
    }

    #[test]
    fn test_disconnect_is_queued_once() {
        let options = MqttOptions::new("test-client", "127.0.0.1", 1883);
        let (client, _event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let disconnect = Disconnector::new(client);

        assert!(disconnect.request());
        assert!(!disconnect.request());
        disconnect.request_disconnect();
        assert!(!disconnect.request());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = transport(port);
        let (events, _messages) = Recorder::new();

        let result = transport.connect("uwb/#", events.clone()).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Network(_)) | Err(ConnectionError::Timeout(_))
        ));
        assert_eq!(events.connected.load(Ordering::SeqCst), 0);
        assert_eq!(transport.run(CancellationToken::new()).await, SessionEnd::Closed);
    }

    #[tokio::test]
    async fn test_silent_broker_times_out() {
        let (listener, port) = local_listener().await;
        let silent = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let timeout = Duration::from_millis(200);
        let mut transport = MqttTransport::new(mqtt_config("127.0.0.1", port)).handshake_timeout(timeout);
        let (events, _messages) = Recorder::new();

        let result = transport.connect("uwb/#", events.clone()).await;
        assert_eq!(result.err(), Some(ConnectionError::Timeout(timeout)));
        assert_eq!(events.connected.load(Ordering::SeqCst), 0);
        silent.abort();
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_refused() {
        let (listener, port) = local_listener().await;
        let broker = fake_broker(listener, SUBACK_FAILURE, None, None);

        let mut transport = transport(port);
        let (events, _messages) = Recorder::new();

        let result = transport.connect("uwb/#", events.clone()).await;
        assert_eq!(
            result.err(),
            Some(ConnectionError::SubscribeRefused("uwb/#".to_string()))
        );
        assert_eq!(events.connected.load(Ordering::SeqCst), 0);

        drop(transport);
        let packets = tokio::time::timeout(WAIT, broker).await.unwrap().unwrap();
        assert_eq!(packets, vec![1, 8]);
    }

    #[tokio::test]
    async fn test_cancelled_session_sends_disconnect() {
        let (listener, port) = local_listener().await;
        let broker = fake_broker(
            listener,
            SUBACK_GRANTED,
            Some(("uwb/a", r#"{"distance": 1.5}"#)),
            None,
        );

        let mut transport = transport(port);
        let (events, mut messages) = Recorder::new();
        transport.connect("uwb/#", events.clone()).await.expect("connect");
        assert_eq!(events.connected.load(Ordering::SeqCst), 1);

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let session = tokio::spawn(async move { transport.run(run_cancel).await });

        let (topic, payload) = tokio::time::timeout(WAIT, messages.recv())
            .await
            .expect("publish delivered")
            .unwrap();
        assert_eq!(topic, "uwb/a");
        assert_eq!(payload, br#"{"distance": 1.5}"#.to_vec());

        cancel.cancel();
        assert_eq!(session.await.unwrap(), SessionEnd::Cancelled);
        assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);

        let packets = tokio::time::timeout(WAIT, broker).await.unwrap().unwrap();
        assert_eq!(packets, vec![1, 8, DISCONNECT]);
    }

    #[tokio::test]
    async fn test_operator_stop_sends_one_disconnect() {
        let (listener, port) = local_listener().await;
        let broker = fake_broker(
            listener,
            SUBACK_GRANTED,
            Some(("uwb/a", r#"{"distance": 2}"#)),
            None,
        );

        let f = collector();
        let mut transport = transport(port);
        f.subscriber.connect(&mut transport).await.expect("connect");
        assert_eq!(f.subscriber.state(), ConnectionState::Connected);

        let (end, ()) = tokio::join!(
            f.subscriber.run(&mut transport, CancellationToken::new()),
            async {
                wait_for_samples(&f.buffer, 1).await;
                assert!(f.subscriber.disconnect());
            }
        );

        assert_eq!(end, SessionEnd::Closed);
        assert_eq!(f.subscriber.state(), ConnectionState::Stopped);
        assert!(!f.subscriber.disconnect());

        let packets = tokio::time::timeout(WAIT, broker).await.unwrap().unwrap();
        assert_eq!(packets, vec![1, 8, DISCONNECT]);
    }

    #[tokio::test]
    async fn test_broker_close_requests_stop() {
        let (listener, port) = local_listener().await;
        let (close, closed) = oneshot::channel();
        let broker = fake_broker(
            listener,
            SUBACK_GRANTED,
            Some(("uwb/a", r#"{"distance": 3}"#)),
            Some(closed),
        );

        let mut f = collector();
        let mut transport = transport(port);
        f.subscriber.connect(&mut transport).await.expect("connect");

        let (end, ()) = tokio::join!(
            f.subscriber.run(&mut transport, CancellationToken::new()),
            async {
                wait_for_samples(&f.buffer, 1).await;
                let _ = close.send(());
            }
        );

        assert_eq!(end, SessionEnd::Closed);
        assert_eq!(f.subscriber.state(), ConnectionState::Disconnected);
        assert_eq!(f.stop_rx.try_recv().ok(), Some(StopTrigger::BrokerDisconnect));
        assert_eq!(f.buffer.len(), 1);

        let packets = tokio::time::timeout(WAIT, broker).await.unwrap().unwrap();
        assert_eq!(packets, vec![1, 8]);
    }
}
