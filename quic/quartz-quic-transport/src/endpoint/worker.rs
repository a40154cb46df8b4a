// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A worker loop: the exclusive owner of a set of connections.
//!
//! Tasks arrive over an mpsc queue (datagrams routed by the Master,
//! cross-worker messages); the embedder's event loop drains them,
//! polls transmissions, and sleeps until `next_wakeup`.

use crate::{
    connection::{id_manager::RoutingEvent, Connection, Event},
    space::InitialSpace,
    transmission::Outgoing,
};
use futures_channel::mpsc;
use hashbrown::HashMap;
use quartz_quic_core::{
    ack,
    connection::{
        id::{InitialId, LocalId, PeerId},
        limits::Limits,
    },
    crypto::{tls, InitialKey as _},
    endpoint,
    inet::{ExplicitCongestionNotification, SocketAddress},
    random,
    time::Timestamp,
    transport::parameters::TransportParameters,
    varint::VarInt,
};
use std::hash::BuildHasherDefault;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

/// A connection's identity within its worker
pub type ConnectionHandle = u64;

/// Work posted to a worker loop
#[derive(Debug)]
pub enum Task {
    /// A datagram for an existing connection
    Datagram {
        remote_address: SocketAddress,
        ecn: ExplicitCongestionNotification,
        recv_time: Timestamp,
        payload: Vec<u8>,
    },

    /// The first datagram of a new connection (server)
    Accept {
        remote_address: SocketAddress,
        ecn: ExplicitCongestionNotification,
        recv_time: Timestamp,
        payload: Vec<u8>,
        original_destination_id: InitialId,
        /// The client presented a validated token
        address_validated: bool,
    },

    /// Close every connection and stop
    Shutdown,
}

/// Wakes a worker loop blocked on I/O
pub trait Wakeup: Send + Sync {
    fn wakeup(&self);
}

/// The sending side of a worker's queue
#[derive(Clone)]
pub struct Handle {
    pub id: WorkerId,
    sender: mpsc::UnboundedSender<Task>,
    wakeup: std::sync::Arc<dyn Wakeup>,
}

impl Handle {
    pub fn submit(&self, task: Task) {
        if self.sender.unbounded_send(task).is_ok() {
            self.wakeup.wakeup();
        }
    }
}

type CidMap = HashMap<Vec<u8>, ConnectionHandle, BuildHasherDefault<siphasher::sip::SipHasher13>>;

pub struct Worker<E: tls::Endpoint, R: random::Generator + Clone> {
    id: WorkerId,
    receiver: mpsc::UnboundedReceiver<Task>,
    tls: E,
    limits: Limits,
    random: R,
    reset_token_key: [u8; 16],

    connections: HashMap<ConnectionHandle, Connection<E::Session>>,
    by_cid: CidMap,
    next_handle: ConnectionHandle,

    /// Routing changes to report to the Master
    routing_updates: Vec<RoutingEvent>,
}

impl<E: tls::Endpoint, R: random::Generator + Clone> Worker<E, R> {
    pub fn new(
        id: WorkerId,
        tls: E,
        limits: Limits,
        random: R,
        reset_token_key: [u8; 16],
        wakeup: std::sync::Arc<dyn Wakeup>,
    ) -> (Self, Handle) {
        let (sender, receiver) = mpsc::unbounded();

        let worker = Self {
            id,
            receiver,
            tls,
            limits,
            random,
            reset_token_key,
            connections: HashMap::new(),
            by_cid: CidMap::default(),
            next_handle: 0,
            routing_updates: Vec::new(),
        };
        let handle = Handle { id, sender, wakeup };

        (worker, handle)
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_mut(
        &mut self,
        handle: ConnectionHandle,
    ) -> Option<&mut Connection<E::Session>> {
        self.connections.get_mut(&handle)
    }

    /// Drains and processes every queued task
    pub fn poll_tasks(&mut self, now: Timestamp) {
        while let Ok(Some(task)) = self.receiver.try_next() {
            self.on_task(task, now);
        }
    }

    pub fn on_task(&mut self, task: Task, now: Timestamp) {
        match task {
            Task::Datagram {
                remote_address,
                ecn,
                mut payload,
                ..
            } => {
                let handle = {
                    // route on the DCID prefix of the first packet
                    let dcid = datagram_dcid(&payload);
                    dcid.and_then(|dcid| self.by_cid.get(dcid.as_slice()).copied())
                };

                if let Some(handle) = handle {
                    if let Some(connection) = self.connections.get_mut(&handle) {
                        let _ = connection.on_datagram(now, remote_address, ecn, &mut payload);
                        self.after_processing(handle);
                    }
                }
            }
            Task::Accept {
                remote_address,
                ecn,
                mut payload,
                original_destination_id,
                address_validated,
                ..
            } => {
                if let Some(handle) = self.accept(
                    now,
                    remote_address,
                    original_destination_id,
                    address_validated,
                ) {
                    if let Some(connection) = self.connections.get_mut(&handle) {
                        let _ = connection.on_datagram(now, remote_address, ecn, &mut payload);
                        self.after_processing(handle);
                    }
                }
            }
            Task::Shutdown => {
                for connection in self.connections.values_mut() {
                    connection.close(VarInt::ZERO, now);
                }
            }
        }
    }

    /// Creates a server connection for a fresh Initial datagram
    fn accept(
        &mut self,
        now: Timestamp,
        remote_address: SocketAddress,
        original_destination_id: InitialId,
        address_validated: bool,
    ) -> Option<ConnectionHandle> {
        let mut random = self.random.clone();

        let mut local_id_bytes = [0u8; crate::connection::id_manager::LOCAL_ID_LEN];
        random.secure_random_fill(&mut local_id_bytes);
        let local_id = LocalId::try_from_bytes(&local_id_bytes)?;

        let params = self.transport_parameters(local_id, Some(original_destination_id));
        let session = self.tls.new_server_session(&params);

        let (key, header_key) =
            <E::Session as quartz_quic_core::crypto::CryptoSuite>::InitialKey::new_server(
                original_destination_id.as_bytes(),
            );
        let initial_space = InitialSpace::<E::Session>::new(
            key,
            header_key,
            ack::Settings {
                max_ack_delay: self.limits.max_ack_delay,
                ack_delay_exponent: self.limits.ack_delay_exponent,
                ..Default::default()
            },
        );

        // the client's SCID is not known until its Initial parses; the
        // provisional remote id is replaced during packet processing
        let remote_id = PeerId::try_from_bytes(&[])?;

        let mut connection = Connection::new(
            endpoint::Type::Server,
            self.limits.clone(),
            session,
            initial_space,
            local_id,
            remote_id,
            remote_address,
            address_validated,
            Box::new(random),
            Some(original_destination_id),
            now,
        );
        connection.set_reset_token_key(self.reset_token_key);

        let handle = self.next_handle;
        self.next_handle += 1;

        self.by_cid
            .insert(original_destination_id.as_bytes().to_vec(), handle);
        self.by_cid.insert(local_id.as_bytes().to_vec(), handle);
        self.routing_updates.push(RoutingEvent::Added(local_id));

        self.connections.insert(handle, connection);
        tracing::debug!(?remote_address, "accepted connection");
        Some(handle)
    }

    /// Dials a server (client role)
    pub fn connect(
        &mut self,
        now: Timestamp,
        remote_address: SocketAddress,
        server_name: &str,
        initial_token: Vec<u8>,
    ) -> Option<ConnectionHandle> {
        let mut random = self.random.clone();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
        //# When an Initial packet is sent by a client ... the client
        //# populates the Destination Connection ID field with an
        //# unpredictable value.  This Destination Connection ID MUST be at
        //# least 8 bytes in length.
        let mut dcid_bytes = [0u8; 8];
        random.secure_random_fill(&mut dcid_bytes);
        let initial_dcid = InitialId::try_from_bytes(&dcid_bytes)?;

        let mut local_id_bytes = [0u8; crate::connection::id_manager::LOCAL_ID_LEN];
        random.secure_random_fill(&mut local_id_bytes);
        let local_id = LocalId::try_from_bytes(&local_id_bytes)?;

        let params = self.transport_parameters(local_id, None);
        let session = self.tls.new_client_session(&params, server_name);

        let (key, header_key) =
            <E::Session as quartz_quic_core::crypto::CryptoSuite>::InitialKey::new_client(
                initial_dcid.as_bytes(),
            );
        let initial_space = InitialSpace::<E::Session>::new(
            key,
            header_key,
            ack::Settings {
                max_ack_delay: self.limits.max_ack_delay,
                ack_delay_exponent: self.limits.ack_delay_exponent,
                ..Default::default()
            },
        );

        let mut connection = Connection::new(
            endpoint::Type::Client,
            self.limits.clone(),
            session,
            initial_space,
            local_id,
            initial_dcid.into(),
            remote_address,
            // the server's address is implicitly validated
            true,
            Box::new(random),
            Some(initial_dcid),
            now,
        );
        connection.set_reset_token_key(self.reset_token_key);
        connection.set_initial_token(initial_token);

        // kick the TLS engine so the first flight is ready
        let _ = connection.drive_tls(now);

        let handle = self.next_handle;
        self.next_handle += 1;
        self.by_cid.insert(local_id.as_bytes().to_vec(), handle);
        self.routing_updates.push(RoutingEvent::Added(local_id));
        self.connections.insert(handle, connection);

        Some(handle)
    }

    fn transport_parameters(
        &self,
        local_id: LocalId,
        original_destination_id: Option<InitialId>,
    ) -> TransportParameters {
        let mut params = self.limits.transport_parameters();
        params.initial_source_connection_id = Some(local_id.into());

        if let Some(odcid) = original_destination_id {
            params.original_destination_connection_id = Some(odcid.into());
            params.stateless_reset_token = Some(
                *crate::connection::id_manager::derive_reset_token(
                    &self.reset_token_key,
                    local_id.as_bytes(),
                )
                .as_bytes(),
            );
        }

        params
    }

    fn after_processing(&mut self, handle: ConnectionHandle) {
        let Some(connection) = self.connections.get_mut(&handle) else {
            return;
        };

        for event in connection.take_routing_events() {
            match &event {
                RoutingEvent::Added(id) => {
                    self.by_cid.insert(id.as_bytes().to_vec(), handle);
                }
                RoutingEvent::Removed(id) => {
                    self.by_cid.remove(id.as_bytes());
                }
            }
            self.routing_updates.push(event);
        }
    }

    /// Routing updates the Master needs to apply
    pub fn take_routing_updates(&mut self) -> Vec<RoutingEvent> {
        core::mem::take(&mut self.routing_updates)
    }

    /// Collects outgoing datagrams from every connection
    pub fn poll_transmit(&mut self, now: Timestamp, out: &mut Vec<Outgoing>) {
        for connection in self.connections.values_mut() {
            while let Some(outgoing) = connection.transmit(now) {
                out.push(outgoing);
            }
        }
    }

    /// Fires expired timers and reaps finished connections
    pub fn on_timeout(&mut self, now: Timestamp) -> Vec<(ConnectionHandle, Event)> {
        let mut events = Vec::new();

        for (&handle, connection) in self.connections.iter_mut() {
            connection.on_timeout(now);
            while let Some(event) = connection.poll_event() {
                events.push((handle, event));
            }
        }

        // drop fully closed connections
        let closed: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, connection)| {
                matches!(connection.state(), crate::connection::State::Closed)
            })
            .map(|(&handle, _)| handle)
            .collect();
        for handle in closed {
            self.connections.remove(&handle);
            self.by_cid.retain(|_, &mut h| h != handle);
        }

        events
    }

    /// The nearest deadline across every connection
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.connections
            .values()
            .filter_map(Connection::next_expiration)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_quic_core::{
        crypto::tls::testing::Endpoint as TlsEndpoint,
        random::testing::Generator,
        time::testing::now,
    };

    struct NoopWakeup;

    impl Wakeup for NoopWakeup {
        fn wakeup(&self) {}
    }

    fn worker() -> (Worker<TlsEndpoint, Generator>, Handle) {
        Worker::new(
            WorkerId(0),
            TlsEndpoint,
            Limits::default(),
            Generator::default(),
            [7u8; 16],
            std::sync::Arc::new(NoopWakeup),
        )
    }

    #[test]
    fn connect_registers_a_connection() {
        let (mut worker, _handle) = worker();

        let handle = worker
            .connect(now(0), "127.0.0.1:4433".parse().unwrap(), "localhost", Vec::new())
            .unwrap();

        assert_eq!(worker.connection_count(), 1);
        assert!(worker.connection_mut(handle).is_some());

        let updates = worker.take_routing_updates();
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], RoutingEvent::Added(_)));
    }

    #[test]
    fn accept_creates_a_server_connection() {
        let (mut worker, handle) = worker();

        let odcid = InitialId::try_from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        handle.submit(Task::Accept {
            remote_address: "127.0.0.1:50000".parse().unwrap(),
            ecn: ExplicitCongestionNotification::NotEct,
            recv_time: now(0),
            // an empty datagram parses no packets but still creates the
            // connection state
            payload: vec![],
            original_destination_id: odcid,
            address_validated: false,
        });

        worker.poll_tasks(now(0));
        assert_eq!(worker.connection_count(), 1);
    }

    #[test]
    fn shutdown_closes_every_connection() {
        let (mut worker, _handle) = worker();
        let handle = worker
            .connect(now(0), "127.0.0.1:4433".parse().unwrap(), "localhost", Vec::new())
            .unwrap();

        worker.on_task(Task::Shutdown, now(1));
        assert!(matches!(
            worker.connection_mut(handle).unwrap().state(),
            crate::connection::State::Closing
        ));
    }
}

/// Extracts the DCID of the first packet without a full parse
fn datagram_dcid(payload: &[u8]) -> Option<Vec<u8>> {
    let first = *payload.first()?;
    if first & 0x80 != 0 {
        let dcid_len = *payload.get(5)? as usize;
        if dcid_len > 20 {
            return None;
        }
        payload.get(6..6 + dcid_len).map(<[u8]>::to_vec)
    } else {
        payload
            .get(1..1 + crate::connection::id_manager::LOCAL_ID_LEN)
            .map(<[u8]>::to_vec)
    }
}
