//! MQTT transport over rumqttc.
//!
//! Two tasks per session: the command pump feeds the rumqttc client, the
//! event pump drives the rumqttc event loop and translates what it sees into
//! [`TransportEvent`]s. A session that never receives a CONNACK is closed;
//! one that drops after being accepted is retried every `reconnect_delay`.
//! On `Disconnect` the event pump keeps polling until the DISCONNECT packet
//! is written, bounded by [`DISCONNECT_GRACE`].

use std::time::Duration;

use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectOptions, Connector, EVENT_CHANNEL_CAPACITY, QoS, TransportCommand, TransportEvent,
    TransportLink,
};
use crate::error::SyncError;
use crate::token::ConnectionKey;

/// Requests buffered inside the rumqttc client before `publish` waits.
const CLIENT_REQUEST_CAPACITY: usize = 64;

/// How long a closing session may take to flush its DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'static, Result<TransportLink, SyncError>> {
        Box::pin(async move {
            let mqtt_options = mqtt_options(&options)?;
            let (client, eventloop) = AsyncClient::new(mqtt_options, CLIENT_REQUEST_CAPACITY);

            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let cancel = CancellationToken::new();
            let disconnect = CancellationToken::new();

            tokio::spawn(pump_commands(
                options.key.clone(),
                client,
                command_rx,
                disconnect.clone(),
                cancel.clone(),
            ));
            tokio::spawn(pump_events(
                options.key,
                eventloop,
                event_tx,
                options.reconnect_delay,
                disconnect,
                cancel,
            ));

            Ok(TransportLink {
                commands: command_tx,
                events: event_rx,
            })
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Scheme {
    Tcp,
    Ws,
    Wss,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BrokerEndpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

fn parse_endpoint(url: &str) -> Result<BrokerEndpoint, String> {
    let (scheme, rest) = match url.split_once("://") {
        Some(("wss", rest)) => (Scheme::Wss, rest),
        Some(("ws", rest)) => (Scheme::Ws, rest),
        Some(("mqtt" | "tcp", rest)) => (Scheme::Tcp, rest),
        Some((other, _)) => return Err(format!("unsupported broker scheme {other:?}")),
        None => (Scheme::Tcp, url),
    };

    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid broker port {port:?}"))?;
            (host, port)
        }
        None => {
            let port = match scheme {
                Scheme::Wss => 443,
                Scheme::Ws => 80,
                Scheme::Tcp => 1883,
            };
            (authority, port)
        }
    };

    if host.is_empty() {
        return Err(format!("broker url {url:?} has no host"));
    }

    Ok(BrokerEndpoint {
        scheme,
        host: host.to_string(),
        port,
    })
}

fn mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, SyncError> {
    let endpoint = parse_endpoint(&options.broker_url).map_err(|reason| SyncError::Connection {
        key: options.key.clone(),
        reason,
    })?;

    // Websocket transports take the full URL as the broker address.
    let mut mqtt = match endpoint.scheme {
        Scheme::Tcp => MqttOptions::new(&options.client_id, endpoint.host, endpoint.port),
        Scheme::Ws | Scheme::Wss => {
            MqttOptions::new(&options.client_id, &options.broker_url, endpoint.port)
        }
    };
    match endpoint.scheme {
        Scheme::Tcp => {}
        Scheme::Ws => {
            mqtt.set_transport(Transport::Ws);
        }
        Scheme::Wss => {
            mqtt.set_transport(Transport::wss_with_default_config());
        }
    }

    mqtt.set_credentials(&options.username, &options.password)
        .set_clean_session(options.clean_session)
        .set_keep_alive(options.keep_alive)
        .set_max_packet_size(options.max_packet_bytes, options.max_packet_bytes);

    Ok(mqtt)
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

async fn pump_commands(
    key: ConnectionKey,
    client: AsyncClient,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    disconnect: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => command,
        };

        let result = match command {
            Some(TransportCommand::Publish {
                topic,
                payload,
                qos,
            }) => client.publish(topic, to_mqtt_qos(qos), false, payload).await,
            Some(TransportCommand::Subscribe { topic, qos }) => {
                client.subscribe(topic, to_mqtt_qos(qos)).await
            }
            Some(TransportCommand::Unsubscribe { topic }) => client.unsubscribe(topic).await,
            Some(TransportCommand::Disconnect) | None => {
                match client.disconnect().await {
                    // The event pump stops once the packet is out.
                    Ok(()) => disconnect.cancel(),
                    Err(e) => {
                        debug!(server = %key.server_id, workspace = %key.workspace_id, "disconnect request failed: {}", e);
                        cancel.cancel();
                    }
                }
                break;
            }
        };

        if let Err(e) = result {
            warn!(server = %key.server_id, workspace = %key.workspace_id, "mqtt request failed: {}", e);
        }
    }
}

async fn pump_events(
    key: ConnectionKey,
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    reconnect_delay: Duration,
    disconnect: CancellationToken,
    cancel: CancellationToken,
) {
    let mut accepted = false;

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = disconnect.cancelled() => {
                let flushed = flush_disconnect(&mut eventloop, DISCONNECT_GRACE).await;
                debug!(server = %key.server_id, workspace = %key.workspace_id, flushed, "mqtt session disconnected");
                break;
            }
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if accepted {
                    info!(server = %key.server_id, workspace = %key.workspace_id, "mqtt session re-established");
                }
                accepted = true;
                TransportEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(server = %key.server_id, workspace = %key.workspace_id, "mqtt session disconnected");
                break;
            }
            Ok(_) => continue,
            Err(e) if !accepted => {
                let _ = events
                    .send(TransportEvent::Closed {
                        reason: Some(e.to_string()),
                    })
                    .await;
                break;
            }
            Err(e) => {
                if events
                    .send(TransportEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = disconnect.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => continue,
                }
            }
        };

        if events.send(event).await.is_err() {
            // Nobody is listening any more.
            cancel.cancel();
            break;
        }
    }

    debug!(server = %key.server_id, workspace = %key.workspace_id, "mqtt event pump stopped");
}

/// Drive the event loop until the queued DISCONNECT has been written.
/// Returns false if the connection ended or `grace` ran out first.
async fn flush_disconnect(eventloop: &mut EventLoop, grace: Duration) -> bool {
    let flushed = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    };
    tokio::time::timeout(grace, flushed).await.unwrap_or(false)
}
