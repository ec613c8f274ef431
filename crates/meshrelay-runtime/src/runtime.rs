//! Mesh runtime
//!
//! Wires the core engine into a running node: one logic task owns all
//! protocol state (routing table, relay, dedup, courier sessions) and is fed
//! through the event channel by transports, timers, and the application
//! handle. Effects flow out through the effect channel to a dispatcher that
//! drives the transport manager and the notification stream.
//!
//! No protocol state is shared between tasks, so there are no locks around
//! it; shutting down is draining the queues and stopping the tasks.

use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use meshrelay_core::channel::{
    create_channels, Command, Effect, EffectReceiver, EffectSender, Event, EventReceiver,
    EventSender, Notification,
};
use meshrelay_core::config::MeshConfig;
use meshrelay_core::crypto::{CryptoProvider, DalekCrypto};
use meshrelay_core::dedup::DeduplicationManager;
use meshrelay_core::message::Message;
use meshrelay_core::persistence::PersistenceAdapter;
use meshrelay_core::relay::MessageRelay;
use meshrelay_core::routing::{ConnectionState, RoutingTable};
use meshrelay_core::types::{PeerId, Priority, SystemTimeSource};
use meshrelay_core::{MeshError, Result};

use crate::courier::{is_sync_type, CourierManager};
use crate::link::{LinkConnector, TransportLink};
use crate::scheduler::Scheduler;
use crate::transport::TransportManager;

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// Keypair identity of one node. The public key is the peer ID.
#[derive(Clone)]
pub struct NodeIdentity {
    pub peer_id: PeerId,
    private_key: [u8; 32],
}

impl NodeIdentity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        let (private_key, public) = DalekCrypto::generate_keypair();
        Self {
            peer_id: PeerId::new(public),
            private_key,
        }
    }

    /// Rebuild an identity from stored key material
    pub fn new(peer_id: PeerId, private_key: [u8; 32]) -> Self {
        Self {
            peer_id,
            private_key,
        }
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Application-facing handle into a running node, cheap to clone
#[derive(Clone)]
pub struct MeshHandle {
    event_tx: EventSender,
}

impl MeshHandle {
    /// Queue a message for delivery. None destination broadcasts.
    pub async fn send_message(
        &self,
        destination: Option<PeerId>,
        body: Vec<u8>,
        priority: Priority,
    ) -> Result<()> {
        self.command(Command::SendMessage {
            destination,
            body,
            priority,
        })
        .await
    }

    /// Start a courier sync with a directly linked peer
    pub async fn start_sync(&self, peer_id: PeerId) -> Result<()> {
        self.command(Command::StartSync { peer_id }).await
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.event_tx
            .send(Event::Command(command))
            .await
            .map_err(|_| MeshError::channel("engine is not running"))
    }
}

// ----------------------------------------------------------------------------
// Runtime
// ----------------------------------------------------------------------------

/// One mesh node: engine state plus the tasks that drive it
pub struct MeshRuntime {
    config: MeshConfig,
    identity: NodeIdentity,
    transport: TransportManager,
    scheduler: Option<Scheduler>,
    event_tx: EventSender,
    event_rx: Option<EventReceiver>,
    effect_tx: EffectSender,
    effect_rx: Option<EffectReceiver>,
    notify_tx: mpsc::Sender<Notification>,
    notify_rx: Option<mpsc::Receiver<Notification>>,
    state: Option<LogicState>,
    logic: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl MeshRuntime {
    /// Build a node over a persistence adapter. Stored messages and the
    /// dedup log are replayed from the store before the node starts.
    pub fn new(
        config: MeshConfig,
        identity: NodeIdentity,
        store: Arc<dyn PersistenceAdapter>,
    ) -> Result<Self> {
        config.validate().map_err(MeshError::config)?;

        let channels = create_channels(&config.channels);
        let (notify_tx, notify_rx) = mpsc::channel(config.channels.event_buffer_size);
        let crypto: Arc<dyn CryptoProvider> = Arc::new(DalekCrypto::new());

        let routing = RoutingTable::new(
            identity.peer_id,
            config.routing.clone(),
            SystemTimeSource::new(),
        );
        let relay = MessageRelay::new(
            config.relay.clone(),
            identity.peer_id,
            identity.private_key,
            Arc::clone(&crypto),
            Arc::clone(&store),
            SystemTimeSource::new(),
        )?;
        let dedup =
            DeduplicationManager::new(config.dedup.clone(), store, SystemTimeSource::new())?;
        let transport = TransportManager::new(
            identity.peer_id,
            config.transport.clone(),
            channels.event_tx.clone(),
        );

        let state = LogicState {
            config: config.clone(),
            identity: identity.clone(),
            crypto,
            routing,
            relay,
            dedup,
            courier: CourierManager::new(),
            peer_states: HashMap::new(),
        };

        Ok(Self {
            config,
            identity,
            transport,
            scheduler: None,
            event_tx: channels.event_tx,
            event_rx: Some(channels.event_rx),
            effect_tx: channels.effect_tx,
            effect_rx: Some(channels.effect_rx),
            notify_tx,
            notify_rx: Some(notify_rx),
            state: Some(state),
            logic: None,
            dispatcher: None,
        })
    }

    /// This node's peer ID
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    /// Hand an open link to the transport manager
    pub fn attach_link(&self, link: Box<dyn TransportLink>) {
        self.transport.attach(link);
    }

    /// Install the dialer used to re-establish dropped links
    pub fn set_connector(&self, connector: Arc<dyn LinkConnector>) {
        self.transport.set_connector(connector);
    }

    /// Application handle for sending commands
    pub fn handle(&self) -> MeshHandle {
        MeshHandle {
            event_tx: self.event_tx.clone(),
        }
    }

    /// Take the notification stream (once)
    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notify_rx.take()
    }

    /// Spawn the logic task, effect dispatcher, and maintenance timers
    pub fn start(&mut self) -> Result<()> {
        let state = self
            .state
            .take()
            .ok_or_else(|| MeshError::config("runtime already started"))?;
        let event_rx = self
            .event_rx
            .take()
            .ok_or_else(|| MeshError::config("runtime already started"))?;
        let effect_rx = self
            .effect_rx
            .take()
            .ok_or_else(|| MeshError::config("runtime already started"))?;

        self.scheduler = Some(Scheduler::start(&self.config, self.event_tx.clone()));
        self.dispatcher = Some(tokio::spawn(dispatch_loop(
            effect_rx,
            self.transport.clone(),
            self.notify_tx.clone(),
        )));
        self.logic = Some(tokio::spawn(logic_loop(
            state,
            event_rx,
            self.effect_tx.clone(),
        )));
        tracing::info!(peer = %self.identity.peer_id, "mesh node started");
        Ok(())
    }

    /// Drain in-flight work and stop every task. State is already at rest in
    /// the persistence adapter; shutdown only has to stop cleanly.
    pub async fn shutdown(&mut self) -> Result<()> {
        let _ = self.event_tx.send(Event::Command(Command::Shutdown)).await;

        if let Some(logic) = self.logic.take() {
            let grace = self.config.relay.drain_timeout;
            if tokio::time::timeout(grace, logic).await.is_err() {
                tracing::warn!("logic task did not drain in time, aborting");
            }
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.transport.shutdown();
        tracing::info!(peer = %self.identity.peer_id, "mesh node stopped");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Effect Dispatch
// ----------------------------------------------------------------------------

async fn dispatch_loop(
    mut effect_rx: EffectReceiver,
    transport: TransportManager,
    notify_tx: mpsc::Sender<Notification>,
) {
    while let Some(effect) = effect_rx.recv().await {
        match effect {
            Effect::SendFrame { to, bytes } => {
                if let Err(err) = transport.send_frame(to, bytes).await {
                    // Not fatal: the copy is at rest and the retry loop will
                    // try again once the link is back
                    tracing::debug!(%to, %err, "frame not sent");
                }
            }
            Effect::Notify(notification) => {
                if notify_tx.send(notification).await.is_err() {
                    tracing::debug!("notification receiver dropped");
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Logic Task
// ----------------------------------------------------------------------------

/// All mutable protocol state, owned by exactly one task
struct LogicState {
    config: MeshConfig,
    identity: NodeIdentity,
    crypto: Arc<dyn CryptoProvider>,
    routing: RoutingTable<SystemTimeSource>,
    relay: MessageRelay<SystemTimeSource>,
    dedup: DeduplicationManager<SystemTimeSource>,
    courier: CourierManager,
    peer_states: HashMap<PeerId, ConnectionState>,
}

async fn logic_loop(mut state: LogicState, mut event_rx: EventReceiver, effect_tx: EffectSender) {
    while let Some(event) = event_rx.recv().await {
        let shutting_down = matches!(event, Event::Command(Command::Shutdown));
        for effect in state.handle_event(event) {
            if effect_tx.send(effect).await.is_err() {
                return;
            }
        }
        if shutting_down {
            // Bounded drain of whatever is already queued
            while let Ok(event) = event_rx.try_recv() {
                for effect in state.handle_event(event) {
                    if effect_tx.send(effect).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!("logic task drained");
            return;
        }
    }
}

impl LogicState {
    /// Handle one event, returning the effects to dispatch. Errors are
    /// logged, never propagated: a single bad frame or full store must not
    /// stop the node.
    fn handle_event(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Command(command) => self.handle_command(command),
            Event::FrameReceived { from, bytes } => self.handle_frame(from, bytes),
            Event::LinkUpdate {
                peer_id,
                transport,
                state,
                quality,
                rtt_ms,
            } => {
                self.routing
                    .apply_link_update(peer_id, transport, state, quality, rtt_ms);
                self.peer_transition(peer_id, state)
            }
            Event::RetryTick => match self.relay.retry_tick(&self.routing) {
                Ok(effects) => effects,
                Err(err) => {
                    tracing::error!(%err, "retry pass failed");
                    vec![]
                }
            },
            Event::DedupPruneTick => {
                if let Err(err) = self.dedup.prune_log(self.config.dedup.prune_max_age) {
                    tracing::error!(%err, "dedup prune failed");
                }
                vec![]
            }
            Event::PeerSweepTick => {
                let removed = self.routing.expire_stale();
                if removed > 0 {
                    tracing::debug!(removed, "swept stale peers");
                }
                vec![]
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::SendMessage {
                destination,
                body,
                priority,
            } => match self.relay.send_message(
                &self.routing,
                &mut self.dedup,
                destination,
                body,
                priority,
            ) {
                Ok((_, effects)) => effects,
                Err(err) => {
                    tracing::error!(%err, "send failed");
                    vec![]
                }
            },
            Command::StartSync { peer_id } => {
                match self.courier.start_session(
                    peer_id,
                    &self.dedup,
                    &self.identity,
                    self.crypto.as_ref(),
                ) {
                    Ok(Some(opening)) => vec![Effect::SendFrame {
                        to: peer_id,
                        bytes: opening.encode(),
                    }],
                    Ok(None) => vec![],
                    Err(err) => {
                        tracing::error!(%peer_id, %err, "could not start sync");
                        vec![]
                    }
                }
            }
            Command::Shutdown => vec![],
        }
    }

    fn handle_frame(&mut self, from: PeerId, bytes: Vec<u8>) -> Vec<Effect> {
        // Sync frames go to the courier layer, everything else to the relay
        if let Ok(message) = Message::decode(&bytes) {
            if is_sync_type(message.header.msg_type) {
                return self.handle_sync_frame(from, &message);
            }
        }
        match self
            .relay
            .handle_incoming(&mut self.routing, &mut self.dedup, from, &bytes)
        {
            Ok((outcome, effects)) => {
                tracing::trace!(%from, ?outcome, "frame processed");
                effects
            }
            Err(err) => {
                tracing::error!(%from, %err, "frame processing failed");
                vec![]
            }
        }
    }

    fn handle_sync_frame(&mut self, from: PeerId, message: &Message) -> Vec<Effect> {
        let step = match self.courier.handle_frame(
            from,
            message,
            &mut self.relay,
            &mut self.routing,
            &mut self.dedup,
            &self.identity,
            self.crypto.as_ref(),
        ) {
            Ok(step) => step,
            Err(err) => {
                tracing::error!(%from, %err, "sync frame failed");
                return vec![];
            }
        };

        let mut effects = step.effects;
        if let Some(reply) = step.reply {
            effects.push(Effect::SendFrame {
                to: from,
                bytes: reply.encode(),
            });
        }
        if let Some(result) = step.completed {
            tracing::info!(peer = %from, sent = result.sent, received = result.received,
                "courier sync complete");
            effects.push(Effect::Notify(Notification::SyncCompleted {
                peer_id: result.peer_id,
                sent: result.sent,
                received: result.received,
            }));
        }
        effects
    }

    /// Emit peer connect/disconnect notifications on state transitions
    fn peer_transition(&mut self, peer_id: PeerId, state: ConnectionState) -> Vec<Effect> {
        let previous = self.peer_states.insert(peer_id, state);
        let was_up = matches!(
            previous,
            Some(ConnectionState::Connected | ConnectionState::Degraded)
        );
        let is_up = matches!(
            state,
            ConnectionState::Connected | ConnectionState::Degraded
        );

        if is_up && !was_up {
            vec![Effect::Notify(Notification::PeerConnected { peer_id })]
        } else if !is_up && was_up {
            vec![Effect::Notify(Notification::PeerDisconnected { peer_id })]
        } else {
            vec![]
        }
    }
}
