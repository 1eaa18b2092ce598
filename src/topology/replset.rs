/// Replica-set topology: discovery, dispatch and failover
///
/// One `ReplicaSetTopology` owns every server the client knows about, the
/// callback registry correlating requests with replies, and the background
/// tasks keeping both honest. All inbound traffic funnels through a single
/// dispatcher task; all membership mutation happens under the state lock on
/// the topology/HA paths, never from caller tasks.
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{Document, DocumentCodec};
use crate::config::{ClientConfig, DeploymentConfig};
use crate::core::connection::Connection;
use crate::core::registry::{CallbackRegistry, OperationReply};
use crate::core::server::Server;
use crate::core::{ConnectionEvent, HandshakeReply, ServerAddress, ServerRole};
use crate::error::{DriverError, DriverResult, SelectionError, TopologyError};
use crate::select::{select_reader, strategy::LatencyStrategy, ReadPreference};
use crate::topology::monitor::{self, MemberProbe};
use crate::topology::pending::{OperationKind, PendingOperationQueue};
use crate::topology::state::ReplicaSetState;
use crate::topology::TopologyEvent;
use crate::wire::{wrap_message, RawReply, OP_QUERY, OP_REPLY};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct ReplicaSetTopology {
    config: ClientConfig,
    codec: Arc<dyn DocumentCodec>,
    registry: CallbackRegistry,
    state: RwLock<ReplicaSetState>,
    conn_events: mpsc::UnboundedSender<ConnectionEvent>,
    events: broadcast::Sender<TopologyEvent>,
    pending: PendingOperationQueue,
    strategy: Option<Box<dyn LatencyStrategy>>,
    read_cursor: AtomicUsize,
    /// Standalone deployments bypass role gating and discovery
    direct: bool,
    ready: AtomicBool,
    closed: AtomicBool,
    full_setup_emitted: AtomicBool,
    stray_replies: AtomicU64,
    redundant_closes: AtomicU64,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicaSetTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSetTopology").finish_non_exhaustive()
    }
}

impl ReplicaSetTopology {
    /// Connect to the configured deployment: discover members, establish the
    /// set name, start the monitors. Returns only once the topology can
    /// serve operations, or with the error that makes it permanently unable
    /// to.
    pub async fn connect(
        config: ClientConfig,
        codec: Arc<dyn DocumentCodec>,
    ) -> DriverResult<Arc<Self>> {
        let topology = Self::build(config, codec)?;
        if let Err(e) = topology.initialize().await {
            topology.close().await;
            return Err(e);
        }
        Ok(topology)
    }

    /// Connect without waiting for discovery to finish. Operations issued
    /// before the topology is ready park in the pending queue and run,
    /// writes first, once discovery completes; they fail when setup fails.
    pub fn connect_lazy(
        config: ClientConfig,
        codec: Arc<dyn DocumentCodec>,
    ) -> DriverResult<Arc<Self>> {
        let topology = Self::build(config, codec)?;
        let setup = Arc::clone(&topology);
        tokio::spawn(async move {
            if let Err(e) = setup.initialize().await {
                warn!("Deferred topology setup failed: {}", e);
                setup.close().await;
            }
        });
        Ok(topology)
    }

    fn build(config: ClientConfig, codec: Arc<dyn DocumentCodec>) -> DriverResult<Arc<Self>> {
        config.validate()?;

        let (conn_events, conn_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let strategy = config
            .monitor
            .strategy
            .as_ref()
            .map(|kind| kind.build(config.acceptable_latency()));
        let direct = matches!(config.deployment, DeploymentConfig::Standalone { .. });
        let set_name = config.set_name().map(String::from);
        let pending_limit = config.operation.pending_buffer_limit;

        let topology = Arc::new(Self {
            config,
            codec,
            registry: CallbackRegistry::new(),
            state: RwLock::new(ReplicaSetState::new(set_name)),
            conn_events,
            events,
            pending: PendingOperationQueue::new(pending_limit),
            strategy,
            read_cursor: AtomicUsize::new(0),
            direct,
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            full_setup_emitted: AtomicBool::new(false),
            stray_replies: AtomicU64::new(0),
            redundant_closes: AtomicU64::new(0),
            tasks: StdMutex::new(Vec::new()),
        });

        let dispatcher = {
            let topology = Arc::clone(&topology);
            tokio::spawn(async move { topology.dispatch_loop(conn_rx).await })
        };
        lock(&topology.tasks).push(dispatcher);
        Ok(topology)
    }

    async fn initialize(self: &Arc<Self>) -> DriverResult<()> {
        if self.direct {
            self.connect_standalone().await?;
        } else {
            self.discover().await?;
        }

        self.ready.store(true, Ordering::Release);
        self.pending.drain_ready();

        let ha = tokio::spawn(monitor::run_ha(Arc::clone(self), self.config.ha_interval()));
        lock(&self.tasks).push(ha);
        if self
            .strategy
            .as_ref()
            .map(|s| s.needs_probes())
            .unwrap_or(false)
        {
            let pings = tokio::spawn(monitor::run_pings(
                Arc::clone(self),
                self.config.ping_interval(),
            ));
            lock(&self.tasks).push(pings);
        }
        Ok(())
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_requests(&self) -> usize {
        self.registry.pending_count()
    }

    pub async fn master_address(&self) -> Option<ServerAddress> {
        self.state
            .read()
            .await
            .master()
            .map(|m| m.address().clone())
    }

    pub async fn secondary_count(&self) -> usize {
        self.state.read().await.connected_secondaries().len()
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.member_count()
    }

    pub async fn is_full_setup(&self) -> bool {
        self.state.read().await.is_full_setup()
    }

    /// Checkout a connection for a write. Only the primary qualifies; when
    /// the set has no primary the checkout fails rather than waiting, and
    /// the HA monitor's next promotion makes it succeed again.
    pub async fn checkout_writer(&self) -> DriverResult<Arc<Connection>> {
        self.ensure_open()?;
        self.wait_ready(OperationKind::Write).await?;
        let state = self.state.read().await;
        if self.direct {
            let server = state
                .all_servers()
                .into_iter()
                .next()
                .ok_or(TopologyError::NotReady)?;
            return server.checkout_writer();
        }
        let master = state.master().ok_or(SelectionError::NoPrimary)?;
        master.checkout_writer()
    }

    /// Checkout a connection for a read honoring the preference.
    pub async fn checkout_reader(
        &self,
        preference: &ReadPreference,
    ) -> DriverResult<Arc<Connection>> {
        self.ensure_open()?;
        self.wait_ready(OperationKind::Read).await?;
        let state = self.state.read().await;
        if self.direct {
            let server = state
                .all_servers()
                .into_iter()
                .next()
                .ok_or(TopologyError::NotReady)?;
            return server.checkout_reader(preference.mode);
        }
        let master = state.master();
        let secondaries = state.connected_secondaries();
        drop(state);
        let server = select_reader(
            master.as_ref(),
            &secondaries,
            preference,
            self.strategy.as_deref(),
            &self.read_cursor,
        )?;
        server.checkout_reader(preference.mode)
    }

    pub fn next_request_id(&self) -> i32 {
        self.registry.next_request_id()
    }

    /// Preference applied to reads that do not carry their own.
    pub fn default_read_preference(&self) -> ReadPreference {
        ReadPreference::new(self.config.operation.default_read_mode)
    }

    /// Send an already-encoded payload on a connection and await the reply.
    /// The request id must come from [`Self::next_request_id`]. A timeout
    /// resolves this one request; the connection stays in service.
    pub async fn send_and_await(
        &self,
        conn: &Connection,
        payload: &[u8],
        request_id: i32,
    ) -> DriverResult<OperationReply> {
        self.ensure_open()?;
        let address = conn.address().clone();
        let receiver = self.registry.register(request_id, address.clone());
        let message = wrap_message(payload, request_id, 0, OP_QUERY);
        let started = Instant::now();
        if let Err(e) = conn.write(&message).await {
            self.registry.resolve_error(
                request_id,
                DriverError::ConnectionClosed {
                    address: address.to_string(),
                },
            );
            return Err(e);
        }
        let reply = self.await_reply(receiver, request_id, &address).await?;
        let elapsed = started.elapsed();
        if let Some(server) = self.state.read().await.server_at(&address) {
            server.record_operation_latency(elapsed);
        }
        Ok(reply)
    }

    /// Encode a command document, send it, decode the reply.
    pub async fn send_command_on(
        &self,
        conn: &Connection,
        document: &Document,
    ) -> DriverResult<Document> {
        let payload = self.codec.encode(document)?;
        let request_id = self.next_request_id();
        let reply = self.send_and_await(conn, &payload, request_id).await?;
        let frame = reply
            .first()
            .ok_or_else(|| DriverError::protocol("reply carried no frames"))?;
        self.codec.decode(&frame.payload)
    }

    /// Send several documents back to back on one connection as a chained
    /// group: intermediate replies accumulate, the final reply is decoded
    /// and returned, and any failure fails the whole group once.
    pub async fn send_chained(
        &self,
        conn: &Connection,
        documents: &[Document],
    ) -> DriverResult<Document> {
        self.ensure_open()?;
        if documents.is_empty() {
            return Err(DriverError::internal("chained send of zero documents"));
        }
        let payloads: Vec<Vec<u8>> = documents
            .iter()
            .map(|d| self.codec.encode(d))
            .collect::<DriverResult<_>>()?;
        let ids: Vec<i32> = payloads.iter().map(|_| self.next_request_id()).collect();
        let final_id = *ids
            .last()
            .ok_or_else(|| DriverError::internal("chained send of zero documents"))?;
        let address = conn.address().clone();
        let receiver = self.registry.register_chained(&ids, address.clone());

        for (payload, id) in payloads.iter().zip(&ids) {
            let message = wrap_message(payload, *id, 0, OP_QUERY);
            if let Err(e) = conn.write(&message).await {
                self.registry.resolve_error(
                    *id,
                    DriverError::ConnectionClosed {
                        address: address.to_string(),
                    },
                );
                return Err(e);
            }
        }

        let reply = self.await_reply(receiver, final_id, &address).await?;
        let frame = reply
            .frames
            .last()
            .ok_or_else(|| DriverError::protocol("chained reply carried no frames"))?;
        self.codec.decode(&frame.payload)
    }

    /// Shut the topology down: stop the tasks, fail everything pending and
    /// close every pool. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            let total = self.redundant_closes.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Redundant topology close ignored ({} so far)", total);
            return;
        }
        info!("Closing topology");
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.pending.fail_all(|| DriverError::Closed);
        self.registry.resolve_all_with_error(|| DriverError::Closed);
        let servers = { self.state.read().await.all_servers() };
        for server in servers {
            server.stop(false).await;
        }
        let _ = self.events.send(TopologyEvent::Close);
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    /// Park until the topology is ready. Operations issued before the
    /// initial setup completed buffer in the pending queue and are released
    /// writes-first.
    async fn wait_ready(&self, kind: OperationKind) -> DriverResult<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let receiver = self.pending.enqueue(kind);
        // The flag may have flipped (or the topology closed) between the
        // check and the enqueue, after the one-shot drain already ran.
        if self.is_closed() {
            self.pending.fail_all(|| DriverError::Closed);
        } else if self.ready.load(Ordering::Acquire) {
            self.pending.drain_ready();
        }
        receiver.await.map_err(|_| DriverError::Closed)?
    }

    async fn await_reply(
        &self,
        receiver: tokio::sync::oneshot::Receiver<DriverResult<OperationReply>>,
        request_id: i32,
        address: &ServerAddress,
    ) -> DriverResult<OperationReply> {
        let outcome = match self.config.request_timeout() {
            Some(limit) => match timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.registry.resolve_error(
                        request_id,
                        DriverError::timeout(format!("request {request_id} to {address}")),
                    );
                    self.emit(TopologyEvent::Timeout {
                        address: address.clone(),
                    });
                    return Err(DriverError::timeout(format!(
                        "request {request_id} to {address}"
                    )));
                }
            },
            None => receiver.await,
        };
        outcome.map_err(|_| DriverError::Closed)?
    }

    fn emit(&self, event: TopologyEvent) {
        let _ = self.events.send(event);
    }

    fn new_server(&self, address: ServerAddress) -> Arc<Server> {
        Server::new(
            address,
            self.direct,
            self.config.pool.size,
            self.config.connect_timeout(),
            self.config.operation.max_message_size_bytes,
            self.conn_events.clone(),
        )
    }

    async fn connect_standalone(&self) -> DriverResult<()> {
        let address = self
            .config
            .seed_addresses()?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::internal("standalone deployment without address"))?;
        let server = self.new_server(address.clone());
        server.start().await?;
        self.state.write().await.insert(Arc::clone(&server));

        let reply = self.probe(&server).await?;
        server.apply_handshake(&reply);
        self.state.write().await.classify(&server);

        self.emit(TopologyEvent::Open { address });
        self.full_setup_emitted.store(true, Ordering::Release);
        self.emit(TopologyEvent::FullSetup);
        Ok(())
    }

    /// Seed-list discovery with gossip expansion: every connected member's
    /// reported host list extends the frontier, so members absent from the
    /// seed list are still found. A set-name mismatch is fatal; individual
    /// unreachable candidates are recorded and skipped.
    async fn discover(&self) -> DriverResult<()> {
        let mut frontier: VecDeque<ServerAddress> =
            self.config.seed_addresses()?.into_iter().collect();
        let mut seen: HashSet<ServerAddress> = frontier.iter().cloned().collect();

        while let Some(address) = frontier.pop_front() {
            if self.is_closed() {
                return Err(DriverError::Closed);
            }
            match self.connect_member(address.clone()).await {
                Ok(reply) => {
                    self.emit(TopologyEvent::Open { address });
                    for member in reply.reported_members() {
                        if let Ok(addr) = ServerAddress::parse(member) {
                            if seen.insert(addr.clone()) {
                                frontier.push_back(addr);
                            }
                        }
                    }
                }
                Err(e @ DriverError::Topology(TopologyError::SetNameMismatch { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!("Candidate {} failed during discovery: {}", address, e);
                    self.state
                        .write()
                        .await
                        .record_error(address.to_string(), e.to_string());
                }
            }
        }

        let state = self.state.read().await;
        if !state.is_usable() {
            return Err(TopologyError::DiscoveryFailed {
                message: format!(
                    "no primary or readable secondary among {} candidates",
                    seen.len()
                ),
            }
            .into());
        }
        info!(
            "Discovery complete: {} members, primary {:?}",
            state.member_count(),
            state.master().map(|m| m.address().to_string())
        );
        let full = state.is_full_setup();
        drop(state);
        if full {
            self.full_setup_emitted.store(true, Ordering::Release);
            self.emit(TopologyEvent::FullSetup);
        }
        Ok(())
    }

    /// Bring one member up: open its pool, handshake it, verify the set
    /// name, classify it. On a set-name mismatch the member is torn down
    /// and the mismatch is returned for the caller to judge.
    pub(crate) async fn connect_member(
        &self,
        address: ServerAddress,
    ) -> DriverResult<HandshakeReply> {
        let server = self.new_server(address);
        server.start().await?;
        self.state.write().await.insert(Arc::clone(&server));

        let reply = match self.probe(&server).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state.write().await.remove(&server.canonical_name());
                server.stop(true).await;
                return Err(e);
            }
        };

        if let Some(name) = &reply.set_name {
            let verdict = self.state.write().await.establish_set_name(name);
            if let Err(e) = verdict {
                self.state.write().await.remove(&server.canonical_name());
                server.stop(true).await;
                return Err(e.into());
            }
        }

        server.apply_handshake(&reply);
        self.state.write().await.classify(&server);
        Ok(reply)
    }

    /// One HA tick: pick a random member, reconnect it when it is down,
    /// probe it and fold the reply back into the topology.
    pub(crate) async fn ha_tick(&self) {
        let servers = { self.state.read().await.all_servers() };
        if servers.is_empty() {
            return;
        }
        let idx = rand::thread_rng().gen_range(0..servers.len());
        let server = Arc::clone(&servers[idx]);

        if !server.is_connected() {
            match server.refill().await {
                Ok(added) if server.is_connected() => {
                    info!(
                        "Reconnected {} ({} connections reopened)",
                        server.address(),
                        added
                    );
                }
                _ => {
                    debug!("Member {} still unreachable", server.address());
                    return;
                }
            }
        }

        match self.probe(&server).await {
            Ok(reply) => self.reconcile(&server, reply).await,
            Err(e) => {
                debug!("HA probe of {} failed: {}", server.address(), e);
                self.state
                    .write()
                    .await
                    .mark_down(server.address(), &e.to_string());
            }
        }
    }

    /// One latency-probe pass over every connected member. Probe replies go
    /// through the same reconciliation as HA probes, so a role change seen
    /// here takes effect immediately.
    pub(crate) async fn ping_tick(&self) {
        let servers = { self.state.read().await.all_servers() };
        for server in servers {
            if self.is_closed() {
                return;
            }
            if !server.is_connected() {
                continue;
            }
            match self.probe(&server).await {
                Ok(reply) => self.reconcile(&server, reply).await,
                Err(e) => debug!("Latency probe of {} failed: {}", server.address(), e),
            }
        }
    }

    /// Fold a fresh handshake reply into the topology: refresh role and
    /// tags, act on a primary's view of the member list, and announce
    /// full-setup the first time the set is completely assembled.
    pub(crate) async fn reconcile(&self, server: &Arc<Server>, reply: HandshakeReply) {
        if self.direct {
            server.apply_handshake(&reply);
            return;
        }

        if let Some(name) = &reply.set_name {
            let verdict = self.state.write().await.establish_set_name(name);
            if verdict.is_err() {
                warn!(
                    "Member {} now reports a foreign set name; removing it",
                    server.address()
                );
                let removed = self.state.write().await.remove(&server.canonical_name());
                if let Some(server) = removed {
                    let address = server.address().clone();
                    server.stop(true).await;
                    self.emit(TopologyEvent::Left { address });
                }
                return;
            }
        }

        server.apply_handshake(&reply);
        self.state.write().await.classify(server);

        if reply.ismaster {
            self.prune_and_extend(&reply).await;
        } else if let Some(reported) = reply.primary.as_deref() {
            self.follow_reported_primary(reported).await;
        }

        if !self.full_setup_emitted.load(Ordering::Acquire)
            && self.state.read().await.is_full_setup()
            && !self.full_setup_emitted.swap(true, Ordering::AcqRel)
        {
            self.emit(TopologyEvent::FullSetup);
        }
    }

    /// A non-primary member named the current primary. When the cached role
    /// of that member is stale, probe it directly instead of waiting for a
    /// random HA tick to land on it.
    async fn follow_reported_primary(&self, reported: &str) {
        let candidate = {
            let state = self.state.read().await;
            state.all_servers().into_iter().find(|s| {
                s.canonical_name() == reported
                    || ServerAddress::parse(reported)
                        .map(|a| &a == s.address())
                        .unwrap_or(false)
            })
        };
        let Some(server) = candidate else {
            return;
        };
        if server.role() == ServerRole::Primary || !server.is_connected() {
            return;
        }
        match self.probe(&server).await {
            Ok(reply) => {
                server.apply_handshake(&reply);
                self.state.write().await.classify(&server);
                if reply.ismaster {
                    info!("Promoting {} as reported by the set", server.address());
                    self.prune_and_extend(&reply).await;
                }
            }
            Err(e) => debug!("Reported primary {} not reachable: {}", reported, e),
        }
    }

    /// Trust the primary's member list: drop members it no longer reports
    /// and connect members it reports that the topology has never seen.
    async fn prune_and_extend(&self, reply: &HandshakeReply) {
        let reported: HashSet<String> = reply
            .reported_members()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let stale: Vec<String> = {
            let state = self.state.read().await;
            state
                .member_names()
                .into_iter()
                .filter(|name| !reported.contains(name))
                .collect()
        };
        for name in stale {
            if reply.me.as_deref() == Some(name.as_str()) {
                continue;
            }
            let removed = self.state.write().await.remove(&name);
            if let Some(server) = removed {
                info!("Member {} left the reported set; removing", name);
                let address = server.address().clone();
                server.stop(true).await;
                self.registry.resolve_all_for_address(&address, || {
                    DriverError::ConnectionClosed {
                        address: address.to_string(),
                    }
                });
                self.emit(TopologyEvent::Left { address });
            }
        }

        for member in reply.reported_members() {
            let Ok(address) = ServerAddress::parse(member) else {
                continue;
            };
            let known = {
                let state = self.state.read().await;
                state.contains(&address) || state.member_names().iter().any(|n| n == member)
            };
            if known {
                continue;
            }
            match self.connect_member(address.clone()).await {
                Ok(_) => {
                    info!("Member {} joined the set", address);
                    self.emit(TopologyEvent::Joined { address });
                }
                Err(e) => debug!("Reported member {} not reachable yet: {}", address, e),
            }
        }
    }

    /// Single consumer of every connection's events.
    async fn dispatch_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message { address, frame, .. } => {
                    match RawReply::parse(frame) {
                        Ok(reply) => {
                            if reply.header.op_code != OP_REPLY {
                                debug!(
                                    "Ignoring opcode {} from {}",
                                    reply.header.op_code, address
                                );
                                continue;
                            }
                            if !self.registry.resolve(reply) {
                                let total =
                                    self.stray_replies.fetch_add(1, Ordering::Relaxed) + 1;
                                debug!("Stray reply from {} ({} so far)", address, total);
                            }
                        }
                        Err(e) => {
                            warn!("Corrupt frame from {}: {}", address, e);
                            self.emit(TopologyEvent::ParseError {
                                address: address.clone(),
                            });
                            self.handle_connection_loss(address, format!("parse error: {e}"))
                                .await;
                        }
                    }
                }
                ConnectionEvent::ParseError {
                    address, message, ..
                } => {
                    warn!("Corrupt stream from {}: {}", address, message);
                    self.emit(TopologyEvent::ParseError {
                        address: address.clone(),
                    });
                    self.handle_connection_loss(address, message).await;
                }
                ConnectionEvent::Error {
                    address, message, ..
                } => {
                    warn!("Connection error from {}: {}", address, message);
                    self.emit(TopologyEvent::Error {
                        address: address.clone(),
                        message: message.clone(),
                    });
                    self.handle_connection_loss(address, message).await;
                }
                ConnectionEvent::Closed { address, .. } => {
                    self.handle_connection_loss(address, "connection closed".to_string())
                        .await;
                }
            }
        }
    }

    /// A connection to `address` died. Requests pending against the server
    /// cannot be matched to one connection, so all of them fail; the server
    /// itself is only marked down once its last connection is gone.
    async fn handle_connection_loss(&self, address: ServerAddress, reason: String) {
        if self.is_closed() {
            return;
        }
        self.registry.resolve_all_for_address(&address, || {
            DriverError::ConnectionClosed {
                address: address.to_string(),
            }
        });

        let server = { self.state.read().await.server_at(&address) };
        let Some(server) = server else {
            let total = self.redundant_closes.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                "Close from untracked server {} ({} so far)",
                address, total
            );
            return;
        };
        if server.is_connected() {
            // Role and membership stand while the pool still has life.
            debug!(
                "Connection to {} lost; pool still has live connections",
                address
            );
            return;
        }
        self.state.write().await.mark_down(&address, &reason);
    }
}

#[async_trait]
impl MemberProbe for ReplicaSetTopology {
    /// Handshake one member over its own pool, recording the round-trip as
    /// the server's ping latency.
    async fn probe(&self, server: &Arc<Server>) -> DriverResult<HandshakeReply> {
        let conn = server.checkout_any()?;
        let started = Instant::now();
        let reply = self.send_command_on(&conn, &json!({ "ismaster": 1 })).await?;
        server.record_ping(started.elapsed());
        serde_json::from_value(reply).map_err(|e| DriverError::codec(e.to_string()))
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
