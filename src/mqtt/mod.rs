// This file is part of Astarte.
//
// Copyright 2021 - 2025 SECO Mind Srl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! The Astarte MQTT client: a synchronous, single-threaded-poll state machine driving a
//! mutual-TLS MQTT 3.1.1 connection, with QoS 1/2 reliability backed by [`crate::cache`].
//!
//! Unlike an async event loop, every operation here either returns immediately or blocks for at
//! most the caller-supplied timeout; the device's `poll()` is expected to call [`Client::poll`]
//! on a regular cadence.

pub mod tls;

use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, Disconnect, PingReq, PubAck, PubComp, PubRec, PubRel,
    Publish, Subscribe, SubscribeReasonCode,
};
use mqttbytes::v4::Packet;
use mqttbytes::QoS;
use tracing::{debug, error, trace, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::cache::{IncomingCache, OutgoingCache, OutgoingEntry};

use self::tls::{ClientIdentity, TlsError, TlsSocket, TrustAnchor};

/// Error returned by the MQTT client.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed MQTT packet")]
    Codec(#[from] mqttbytes::Error),
    #[error("the client is not connected")]
    NotConnected,
    #[error("the broker refused the connection: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
}

/// Client-level connection state, matching the table in the component design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    ConnectionError,
}

/// Static configuration for a [`Client`] instance.
#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
    pub max_msg_size: usize,
    pub clean_session: bool,
    pub reconnect_backoff: BackoffConfig,
}

/// An event produced by a [`Client::poll`] call, consumed by the handshake/device layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    Connected { session_present: bool },
    Disconnected,
    ConnectionError,
    Incoming { topic: String, payload: Vec<u8> },
    Delivered { id: u16 },
    Subscribed { id: u16, accepted: bool },
}

pub(crate) fn qos_from_u8(value: u8) -> QoS {
    match value {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// The MQTT client. Every state mutation happens synchronously inside a method call; there's no
/// background thread. Callers (the device's single poll loop, or other threads wrapping this in
/// their own lock, per §5) are expected to serialize access.
pub struct Client {
    config: MqttClientConfig,
    state: State,
    socket: Option<TlsSocket>,
    read_buf: BytesMut,
    outgoing: OutgoingCache,
    incoming: IncomingCache,
    backoff: Backoff,
    connecting_deadline: Option<Instant>,
    disconnecting_deadline: Option<Instant>,
    last_activity: Instant,
    awaiting_pingresp: bool,
    identity: Option<ClientIdentity>,
    anchor: TrustAnchor,
}

impl Client {
    pub fn new(config: MqttClientConfig) -> Self {
        let retransmit_interval = config.connect_timeout.max(Duration::from_secs(5));
        let reconnect_backoff = config.reconnect_backoff;

        Self {
            config,
            state: State::Disconnected,
            socket: None,
            read_buf: BytesMut::with_capacity(4096),
            outgoing: OutgoingCache::new(retransmit_interval),
            incoming: IncomingCache::new(retransmit_interval),
            backoff: Backoff::new(reconnect_backoff),
            connecting_deadline: None,
            disconnecting_deadline: None,
            last_activity: Instant::now(),
            awaiting_pingresp: false,
            identity: None,
            anchor: TrustAnchor::Native,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Forces the client into a given state without touching the socket, for tests in other
    /// modules that need to exercise state-gated behavior without a real broker.
    #[cfg(test)]
    pub(crate) fn set_state_for_test(&mut self, state: State) {
        self.state = state;
    }

    /// Opens the TLS socket, sends CONNECT, and transitions to `connecting`.
    pub fn connect(
        &mut self,
        identity: ClientIdentity,
        anchor: TrustAnchor,
        now: Instant,
    ) -> Result<(), MqttError> {
        self.identity = Some(identity);
        self.anchor = anchor;
        self.connect_internal(now)
    }

    fn connect_internal(&mut self, now: Instant) -> Result<(), MqttError> {
        let identity = self.identity.clone().ok_or(MqttError::NotConnected)?;

        let socket = TlsSocket::connect(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout,
            &identity,
            &self.anchor,
        )?;
        self.socket = Some(socket);
        self.read_buf.clear();

        let mut connect = Connect::new(self.config.client_id.clone());
        connect.clean_session = self.config.clean_session;
        connect.keep_alive = self.config.keep_alive.as_secs().min(u16::MAX as u64) as u16;

        self.write_packet(|buf| connect.write(buf))?;

        self.state = State::Connecting;
        self.connecting_deadline = Some(now + self.config.connect_timeout);
        self.last_activity = now;

        debug!(host = %self.config.host, port = self.config.port, "mqtt connect sent");

        Ok(())
    }

    /// Allocates a packet id (if `qos > 0`) and publishes. Returns the id the caller can use to
    /// correlate with a later `Delivered` event.
    pub fn publish(
        &mut self,
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: QoS,
        now: Instant,
    ) -> Result<Option<u16>, MqttError> {
        if self.state != State::Connected {
            return Err(MqttError::NotConnected);
        }

        let topic = topic.into();
        let id = if qos == QoS::AtMostOnce {
            0
        } else {
            self.outgoing.allocate_id()
        };

        let mut publish = Publish::new(topic.clone(), qos, payload.clone());
        publish.pkid = id;

        self.write_packet(|buf| publish.write(buf))?;
        self.last_activity = now;

        if qos != QoS::AtMostOnce {
            self.outgoing.insert(
                id,
                OutgoingEntry::Publish {
                    topic,
                    payload,
                    qos: qos as u8,
                },
                now,
            );
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    pub fn subscribe(
        &mut self,
        topic: impl Into<String>,
        max_qos: QoS,
        now: Instant,
    ) -> Result<u16, MqttError> {
        if self.state != State::Connected {
            return Err(MqttError::NotConnected);
        }

        let topic = topic.into();
        let id = self.outgoing.allocate_id();

        let mut subscribe = Subscribe::new(topic.clone(), max_qos);
        subscribe.pkid = id;

        self.write_packet(|buf| subscribe.write(buf))?;
        self.last_activity = now;

        self.outgoing.insert(
            id,
            OutgoingEntry::Subscribe {
                topic,
                qos: max_qos as u8,
            },
            now,
        );

        Ok(id)
    }

    /// Begins a graceful disconnect: the client waits (cooperatively, across further `poll`
    /// calls) for the outgoing cache to drain, or for `timeout` to elapse, then tears the
    /// session down.
    pub fn disconnect(&mut self, timeout: Duration, now: Instant) {
        if self.state != State::Connected {
            self.force_disconnect();
            return;
        }
        self.state = State::Disconnecting;
        self.disconnecting_deadline = Some(now + timeout);
    }

    /// Whether every outgoing QoS 1/2 publish has been acknowledged. The handshake uses this to
    /// know when it's safe to consider itself settled.
    pub fn outgoing_drained(&self) -> bool {
        self.outgoing.is_empty()
    }

    /// Discards pending messages and tears the session down immediately.
    pub fn force_disconnect(&mut self) {
        self.socket = None;
        self.outgoing.clear();
        self.incoming.clear();
        self.read_buf.clear();
        self.state = State::Disconnected;
        self.connecting_deadline = None;
        self.disconnecting_deadline = None;
        self.awaiting_pingresp = false;
    }

    /// Drives the state machine: connection timeouts, reconnect backoff, cache retransmission,
    /// keepalive, and (if the socket has data) dispatch of one incoming packet.
    pub fn poll(&mut self, now: Instant) -> Vec<MqttEvent> {
        let mut events = Vec::new();

        if self.state == State::Connecting {
            if let Some(deadline) = self.connecting_deadline {
                if now >= deadline {
                    warn!("mqtt connect timed out");
                    self.enter_connection_error(now, &mut events);
                }
            }
        }

        if self.state == State::ConnectionError && self.backoff.is_elapsed(now) {
            if let Err(err) = self.connect_internal(now) {
                debug!(%err, "mqtt reconnect attempt failed");
                self.backoff.next_delay(now);
            }
        }

        if self.state == State::Disconnecting {
            let drained = self.outgoing.is_empty();
            let expired = self.disconnecting_deadline.is_some_and(|d| now >= d);
            if drained || expired {
                self.send_disconnect_best_effort();
                self.force_disconnect();
                events.push(MqttEvent::Disconnected);
            }
        }

        if self.state == State::Connected {
            self.retransmit_expired(now);

            if let Err(err) = self.drive_keepalive(now) {
                debug!(%err, "mqtt keepalive failed");
                self.enter_connection_error(now, &mut events);
            }
        }

        if self.socket.is_some() && matches!(self.state, State::Connecting | State::Connected) {
            let budget = self.poll_budget(now);
            match self.pump_socket(budget) {
                Ok(()) => match self.try_read_packet() {
                    Ok(Some(packet)) => self.dispatch(packet, now, &mut events),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, "dropped malformed/oversize mqtt packet, read buffer drained");
                    }
                },
                Err(err) => {
                    error!(%err, "mqtt socket read failed");
                    self.enter_connection_error(now, &mut events);
                }
            }
        }

        events
    }

    fn enter_connection_error(&mut self, now: Instant, events: &mut Vec<MqttEvent>) {
        self.socket = None;
        self.connecting_deadline = None;
        self.awaiting_pingresp = false;
        self.state = State::ConnectionError;
        self.backoff.next_delay(now);
        events.push(MqttEvent::ConnectionError);
    }

    fn send_disconnect_best_effort(&mut self) {
        let _ = self.write_packet(|buf| Disconnect.write(buf));
    }

    fn poll_budget(&self, now: Instant) -> Duration {
        if self.config.keep_alive.is_zero() {
            return self.config.poll_timeout;
        }
        let elapsed = now.saturating_duration_since(self.last_activity);
        let remaining = self.config.keep_alive.saturating_sub(elapsed);
        self.config.poll_timeout.min(remaining).max(Duration::from_millis(1))
    }

    fn drive_keepalive(&mut self, now: Instant) -> Result<(), MqttError> {
        if self.config.keep_alive.is_zero() {
            return Ok(());
        }

        if self.awaiting_pingresp {
            if now.saturating_duration_since(self.last_activity) > self.config.keep_alive {
                return Err(MqttError::NotConnected);
            }
            return Ok(());
        }

        if now.saturating_duration_since(self.last_activity) >= self.config.keep_alive {
            self.write_packet(|buf| PingReq.write(buf))?;
            self.awaiting_pingresp = true;
            trace!("mqtt pingreq sent");
        }

        Ok(())
    }

    fn retransmit_expired(&mut self, now: Instant) {
        let mut republish = Vec::new();
        self.outgoing.check_expiry(now, |id, entry| republish.push((id, entry.clone())));

        for (id, entry) in republish {
            match entry {
                OutgoingEntry::Publish { topic, payload, qos } => {
                    let mut publish = Publish::new(topic, qos_from_u8(qos), payload);
                    publish.pkid = id;
                    publish.dup = true;
                    if let Err(err) = self.write_packet(|buf| publish.write(buf)) {
                        warn!(%err, id, "failed to retransmit publish");
                    }
                }
                OutgoingEntry::Subscribe { topic, qos } => {
                    let mut subscribe = Subscribe::new(topic, qos_from_u8(qos));
                    subscribe.pkid = id;
                    if let Err(err) = self.write_packet(|buf| subscribe.write(buf)) {
                        warn!(%err, id, "failed to retransmit subscribe");
                    }
                }
            }
        }

        let mut resend_pubrec = Vec::new();
        self.incoming.check_expiry(now, |id| resend_pubrec.push(id));
        for id in resend_pubrec {
            let pubrec = PubRec::new(id);
            if let Err(err) = self.write_packet(|buf| pubrec.write(buf)) {
                warn!(%err, id, "failed to resend pubrec");
            }
        }
    }

    fn dispatch(&mut self, packet: Packet, now: Instant, events: &mut Vec<MqttEvent>) {
        self.last_activity = now;

        match packet {
            Packet::ConnAck(ack) => self.on_connack(ack, events),
            Packet::Publish(publish) => self.on_publish(publish, now, events),
            Packet::PubAck(ack) => {
                self.outgoing.remove(ack.pkid);
                events.push(MqttEvent::Delivered { id: ack.pkid });
            }
            Packet::PubRec(rec) => {
                self.outgoing.refresh(rec.pkid, now);
                let pubrel = PubRel::new(rec.pkid);
                let _ = self.write_packet(|buf| pubrel.write(buf));
            }
            Packet::PubRel(rel) => {
                self.incoming.remove(rel.pkid);
                let pubcomp = PubComp::new(rel.pkid);
                let _ = self.write_packet(|buf| pubcomp.write(buf));
            }
            Packet::PubComp(comp) => {
                self.outgoing.remove(comp.pkid);
                events.push(MqttEvent::Delivered { id: comp.pkid });
            }
            Packet::SubAck(suback) => {
                self.outgoing.remove(suback.pkid);
                let accepted = suback
                    .return_codes
                    .first()
                    .is_some_and(|code| !matches!(code, SubscribeReasonCode::Failure));
                events.push(MqttEvent::Subscribed {
                    id: suback.pkid,
                    accepted,
                });
            }
            Packet::PingResp => {
                self.awaiting_pingresp = false;
                trace!("mqtt pingresp received");
            }
            Packet::Disconnect => {
                self.force_disconnect();
                events.push(MqttEvent::Disconnected);
            }
            other => trace!(?other, "unhandled mqtt packet"),
        }
    }

    fn on_connack(&mut self, ack: ConnAck, events: &mut Vec<MqttEvent>) {
        if ack.code != ConnectReturnCode::Success {
            error!(code = ?ack.code, "broker refused connection");
            self.enter_connection_error(Instant::now(), events);
            return;
        }

        self.backoff.reset();
        self.connecting_deadline = None;
        self.state = State::Connected;

        if !ack.session_present {
            self.outgoing.clear();
            self.incoming.clear();
        }

        events.push(MqttEvent::Connected {
            session_present: ack.session_present,
        });
    }

    fn on_publish(&mut self, publish: Publish, now: Instant, events: &mut Vec<MqttEvent>) {
        match publish.qos {
            QoS::AtMostOnce => {
                events.push(MqttEvent::Incoming {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            QoS::AtLeastOnce => {
                let puback = PubAck::new(publish.pkid);
                let _ = self.write_packet(|buf| puback.write(buf));
                events.push(MqttEvent::Incoming {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            QoS::ExactlyOnce => {
                let is_new = self.incoming.insert(publish.pkid, now);
                let pubrec = PubRec::new(publish.pkid);
                let _ = self.write_packet(|buf| pubrec.write(buf));
                if is_new {
                    events.push(MqttEvent::Incoming {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
            }
        }
    }

    fn write_packet(
        &mut self,
        encode: impl FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    ) -> Result<(), MqttError> {
        let mut buf = BytesMut::new();
        encode(&mut buf)?;

        let socket = self.socket.as_mut().ok_or(MqttError::NotConnected)?;
        socket.write_all(&buf)?;
        socket.flush()?;
        Ok(())
    }

    fn pump_socket(&mut self, timeout: Duration) -> Result<(), MqttError> {
        let socket = self.socket.as_mut().ok_or(MqttError::NotConnected)?;
        socket.set_read_timeout(Some(timeout))?;

        let mut chunk = [0u8; 4096];
        match socket.read(&mut chunk) {
            Ok(0) => Err(MqttError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "broker closed the connection",
            ))),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => Ok(()),
            Err(err) => Err(MqttError::Io(err)),
        }
    }

    /// On any error but `InsufficientBytes`, `read_buf` holds a partially consumed, desynced
    /// packet: `mqttbytes::v4::read` only inspects the fixed header before erroring, so nothing
    /// past it was split off. Clearing it here is what lets the connection keep accepting
    /// traffic instead of re-failing to parse the same bytes on every later poll.
    fn try_read_packet(&mut self) -> Result<Option<Packet>, MqttError> {
        match mqttbytes::v4::read(&mut self.read_buf, self.config.max_msg_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
            Err(err) => {
                self.read_buf.clear();
                Err(MqttError::Codec(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MqttClientConfig {
        MqttClientConfig {
            client_id: "realm/device".into(),
            host: "127.0.0.1".into(),
            port: 8883,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(250),
            max_msg_size: 64 * 1024,
            clean_session: true,
            reconnect_backoff: BackoffConfig::default(),
        }
    }

    #[test]
    fn starts_disconnected() {
        let client = Client::new(test_config());
        assert_eq!(client.state(), State::Disconnected);
    }

    #[test]
    fn publish_while_disconnected_is_rejected() {
        let mut client = Client::new(test_config());
        let err = client
            .publish("a/b", vec![1, 2, 3], QoS::AtLeastOnce, Instant::now())
            .unwrap_err();
        assert!(matches!(err, MqttError::NotConnected));
    }

    #[test]
    fn qos_from_u8_maps_known_values() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }

    #[test]
    fn oversize_packet_drains_the_read_buffer_instead_of_wedging() {
        let mut client = Client::new(test_config());
        client.state = State::Connected;

        // A PUBLISH fixed header declaring a remaining length far past max_msg_size.
        client.read_buf.extend_from_slice(&[0x30, 0xff, 0xff, 0xff, 0x7f]);

        let err = client.try_read_packet().unwrap_err();
        assert!(matches!(err, MqttError::Codec(_)));
        assert!(client.read_buf.is_empty());

        // A subsequent, well-formed PINGRESP now parses instead of re-erroring forever.
        client.read_buf.extend_from_slice(&[0xd0, 0x00]);
        let packet = client.try_read_packet().unwrap();
        assert!(matches!(packet, Some(Packet::PingResp)));
    }

    #[test]
    fn connecting_times_out_without_a_connack() {
        let mut client = Client::new(test_config());
        client.state = State::Connecting;
        let now = Instant::now();
        client.connecting_deadline = Some(now - Duration::from_millis(1));

        let events = client.poll(now);

        assert_eq!(client.state(), State::ConnectionError);
        assert!(events.contains(&MqttEvent::ConnectionError));
    }
}
