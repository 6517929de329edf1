use std::collections::VecDeque;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnAck, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    Publish, QoS, SubscribeReasonCode, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::MqttConfig;
use crate::decoder::decode;
use crate::dispatch::DispatchSender;
use crate::error::MqttError;
use crate::health::{ComponentStatus, HealthHandle};
use crate::metrics::{
    ACK_BACKLOG, DECODE_ERRORS, MESSAGES_FILTERED, MESSAGES_RECEIVED, MQTT_CONNECTION_ERRORS,
};
use crate::types::TelemetryEvent;

/// Capacity of the channel between `AsyncClient` and `EventLoop`.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Translate our configuration into client options: persistent session, manual
/// acknowledgement (a publish is acked once it has been handed to the writer).
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, MqttError> {
    let broker = config.mqtt_broker.as_str();
    let invalid = || MqttError::InvalidBrokerUrl(broker.to_owned());

    let url = Url::parse(broker).map_err(|_| invalid())?;
    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        _ => return Err(invalid()),
    };
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut options = MqttOptions::new(config.mqtt_client_id.as_str(), host, port);
    options
        .set_keep_alive(config.mqtt_keep_alive.0.max(MIN_KEEP_ALIVE))
        .set_clean_session(false)
        .set_manual_acks(true);

    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.as_str(),
            config.mqtt_password.as_deref().unwrap_or_default(),
        );
    }
    if tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    Ok(options)
}

/// A connected, subscribed MQTT session. The event loop is driven by `deliver`,
/// which decodes every publish and pushes it to the dispatch queue.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    topic_filter: String,
    /// Publishes seen before `deliver` took over the event loop.
    pending: VecDeque<Publish>,
    timeout: Duration,
    grace_period: Duration,
    reconnect_delay: Duration,
    unsubscribe_on_shutdown: bool,
}

impl MqttSession {
    /// Connect to the broker, retrying transient failures until the configured timeout.
    pub async fn connect(config: &MqttConfig) -> Result<Self, MqttError> {
        let options = mqtt_options(config)?;
        let (host, port) = options.broker_address();
        info!(host = host.as_str(), port, "Connecting to MQTT server...");

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let mut session = Self {
            client,
            eventloop,
            topic_filter: config.topic_filter(),
            pending: VecDeque::new(),
            timeout: config.mqtt_timeout.0,
            grace_period: config.mqtt_grace_period.0,
            reconnect_delay: config.mqtt_reconnect_delay.0,
            unsubscribe_on_shutdown: config.mqtt_unsubscribe_on_shutdown,
        };

        let ack = tokio::time::timeout(session.timeout, session.wait_for_connack())
            .await
            .map_err(|_| MqttError::ConnectTimeout)?;
        info!(session_present = ack.session_present, "Connected to MQTT server");

        Ok(session)
    }

    async fn wait_for_connack(&mut self) -> ConnAck {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => return ack,
                Ok(Event::Incoming(Packet::Publish(publish))) => self.pending.push_back(publish),
                Ok(_) => {}
                Err(error) => {
                    warn!("MQTT connection attempt failed, retrying: {}", error);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    /// Subscribe to every TIC label at QoS 2 and wait for the broker to acknowledge.
    pub async fn subscribe(&mut self) -> Result<(), MqttError> {
        info!("Subscribing to topics {}...", self.topic_filter);
        self.client
            .subscribe(self.topic_filter.as_str(), QoS::ExactlyOnce)
            .await?;

        tokio::time::timeout(self.timeout, self.wait_for_suback())
            .await
            .map_err(|_| MqttError::SubscribeTimeout)?
    }

    async fn wait_for_suback(&mut self) -> Result<(), MqttError> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(MqttError::SubscribeRejected(self.topic_filter.clone()));
                    }
                    return Ok(());
                }
                // With a persistent session the broker may redeliver before acking.
                Event::Incoming(Packet::Publish(publish)) => self.pending.push_back(publish),
                _ => {}
            }
        }
    }

    /// Drive the event loop until `shutdown` fires or the queue is closed, then
    /// disconnect. Connection errors are logged and the loop keeps polling, which
    /// makes the client reconnect; the persistent session gets us the messages
    /// that were published in the meantime.
    pub async fn deliver(
        mut self,
        queue: DispatchSender<TelemetryEvent>,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) {
        liveness.report_healthy();
        let mut acks = AckBacklog::default();
        let mut stopped = false;

        while let Some(publish) = self.pending.pop_front() {
            if !forward(&publish, &queue, &shutdown).await {
                stopped = true;
                break;
            }
            acks.push(publish, &self.client);
        }

        while !stopped {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };
            // Each poll may have taken requests off the channel.
            acks.flush(&self.client);

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    liveness.report_healthy();
                    if !forward(&publish, &queue, &shutdown).await {
                        break;
                    }
                    acks.push(publish, &self.client);
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(session_present = ack.session_present, "Reconnected to MQTT server");
                    liveness.report_healthy();
                }
                Ok(Event::Incoming(Packet::PingResp)) => liveness.report_healthy(),
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    metrics::counter!(MQTT_CONNECTION_ERRORS).increment(1);
                    liveness.report_status(ComponentStatus::Unhealthy);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }

        self.disconnect(acks).await;
    }

    /// Send the outstanding acks, optionally unsubscribe, then disconnect, all
    /// within the grace period.
    async fn disconnect(mut self, mut acks: AckBacklog) {
        info!("Disconnecting from MQTT server...");
        let grace_period = self.grace_period;

        let closed = tokio::time::timeout(grace_period, self.close(&mut acks)).await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("MQTT connection lost while disconnecting: {}", e),
            Err(_) => warn!(
                unacked = acks.len(),
                "MQTT disconnect did not complete within {:?}", grace_period
            ),
        }
    }

    async fn close(&mut self, acks: &mut AckBacklog) -> Result<(), ConnectionError> {
        while !acks.flush(&self.client) {
            self.eventloop.poll().await?;
        }

        if self.unsubscribe_on_shutdown {
            while self
                .client
                .try_unsubscribe(self.topic_filter.as_str())
                .is_err()
            {
                self.eventloop.poll().await?;
            }
        }

        while self.client.try_disconnect().is_err() {
            self.eventloop.poll().await?;
        }

        // Requests go out in order, so every ack queued above is on the wire by now.
        loop {
            if let Event::Outgoing(Outgoing::Disconnect) = self.eventloop.poll().await? {
                return Ok(());
            }
        }
    }
}

/// Acknowledgements waiting for room in the client's request channel. The
/// channel only empties while the event loop is polled, so an ack that does not
/// fit is kept here, in order, and retried after the next poll.
#[derive(Default)]
struct AckBacklog {
    publishes: VecDeque<Publish>,
}

impl AckBacklog {
    fn push(&mut self, publish: Publish, client: &AsyncClient) {
        self.publishes.push_back(publish);
        self.flush(client);
    }

    /// Hand over as many acks as the channel takes. Returns true once none are left.
    fn flush(&mut self, client: &AsyncClient) -> bool {
        while let Some(publish) = self.publishes.front() {
            if client.try_ack(publish).is_err() {
                debug!(backlog = self.publishes.len(), "MQTT request channel full, deferring acks");
                break;
            }
            drop(self.publishes.pop_front());
        }

        metrics::gauge!(ACK_BACKLOG).set(self.publishes.len() as f64);
        self.publishes.is_empty()
    }

    fn len(&self) -> usize {
        self.publishes.len()
    }
}

/// Decode one publish and hand it to the writer. Returns true when the publish
/// should be acknowledged: it was enqueued, dropped by the backpressure policy or
/// filtered out. Returns false when we must stop delivering; the publish is then
/// left unacknowledged for the broker to send again.
async fn forward(
    publish: &Publish,
    queue: &DispatchSender<TelemetryEvent>,
    shutdown: &CancellationToken,
) -> bool {
    metrics::counter!(MESSAGES_RECEIVED).increment(1);

    match decode(&publish.topic, &publish.payload, publish.retain) {
        Ok(Some(event)) => {
            let sent = tokio::select! {
                _ = shutdown.cancelled() => return false,
                sent = queue.send(event) => sent,
            };
            if sent.is_err() {
                warn!("Dispatch queue closed, stopping MQTT delivery");
                return false;
            }
        }
        Ok(None) => {
            debug!(topic = publish.topic.as_str(), "Ignoring publish");
            metrics::counter!(MESSAGES_FILTERED).increment(1);
        }
        Err(e) => {
            error!("{}", e);
            metrics::counter!(DECODE_ERRORS).increment(1);
        }
    }

    true
}
