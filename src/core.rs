//! The core logic of a Raft node.
//!
//! `RaftCore` is the single writer of a node's state. It owns the [`Engine`] and feeds it one
//! event at a time: API calls, RPC results and timer expiry. The commands the engine returns are
//! executed here; outbound RPCs run in their own tasks and come back as events through a channel.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::engine::Command;
use crate::engine::Engine;
use crate::engine::Event;
use crate::engine::State;
use crate::engine::Timer;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::NetworkError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Membership;
use crate::messages::Envelope;
use crate::messages::Message;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

pub(crate) type RaftRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type RaftRespRx<T, E> = oneshot::Receiver<Result<T, E>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg {
    Rpc {
        envelope: Envelope,
        tx: RaftRespTx<Message, RaftError>,
    },
    ClientWrite {
        command: Vec<u8>,
        tx: RaftRespTx<LogId, ClientWriteError>,
    },
    ChangeMembership {
        membership: Membership,
        tx: RaftRespTx<LogId, ChangeMembershipError>,
    },
}

impl MessageSummary for RaftMsg {
    fn summary(&self) -> String {
        match self {
            RaftMsg::Rpc { envelope, .. } => format!("Rpc: from {}: {}", envelope.from, envelope.message.summary()),
            RaftMsg::ClientWrite { command, .. } => format!("ClientWrite: {} bytes", command.len()),
            RaftMsg::ChangeMembership { membership, .. } => {
                format!("ChangeMembership: voters {:?}", membership.voting_peers())
            }
        }
    }
}

/// Who is waiting for the outcome of the event being handled.
enum Responder {
    Nobody,
    Rpc(RaftRespTx<Message, RaftError>),
    Client(RaftRespTx<LogId, ClientWriteError>),
    Membership(RaftRespTx<LogId, ChangeMembershipError>),
}

impl Responder {
    fn shutting_down(self) {
        match self {
            Responder::Nobody => {}
            Responder::Rpc(tx) => {
                let _ = tx.send(Err(RaftError::ShuttingDown));
            }
            Responder::Client(tx) => {
                let _ = tx.send(Err(RaftError::ShuttingDown.into()));
            }
            Responder::Membership(tx) => {
                let _ = tx.send(Err(RaftError::ShuttingDown.into()));
            }
        }
    }
}

/// The core type implementing the Raft protocol.
pub(crate) struct RaftCore<N: RaftNetwork, S: LogStore, M: StateMachine> {
    engine: Engine<S, M>,
    config: Arc<Config>,
    network: Arc<N>,

    /// The single pending timer and when it fires. Installing a timer replaces it.
    timer: Option<(Instant, Timer)>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_rpc_result: mpsc::UnboundedSender<Event>,
    rx_rpc_result: mpsc::UnboundedReceiver<Event>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork, S: LogStore, M: StateMachine> RaftCore<N, S, M> {
    pub(crate) fn spawn(
        engine: Engine<S, M>,
        config: Arc<Config>,
        network: Arc<N>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_rpc_result, rx_rpc_result) = mpsc::unbounded_channel();
        let this = Self {
            engine,
            config,
            network,
            timer: None,
            rx_api,
            tx_rpc_result,
            rx_rpc_result,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="trace", skip(self), fields(id=%self.engine.id(), cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        let startup = self.engine.startup();
        self.run_commands(startup, Responder::Nobody);
        self.report_metrics();

        let res = self.run().await;

        let mut last = self.engine.metrics();
        last.state = State::Shutdown;
        self.tx_metrics.send_replace(last);

        match &res {
            Ok(()) => tracing::info!(id = %self.engine.id(), "node has shutdown"),
            Err(err) => tracing::error!(id = %self.engine.id(), error = %err, "node stopped on error"),
        }
        res
    }

    async fn run(&mut self) -> RaftResult<()> {
        loop {
            let deadline = self.timer.map(|(at, _)| at);
            let timer_fired = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = timer_fired => {
                    let event = match self.timer.take() {
                        Some((_, Timer::Election(_))) => Event::ElectionTimeout,
                        Some((_, Timer::Heartbeat(_))) => Event::HeartbeatTimeout,
                        None => continue,
                    };
                    self.step(event, Responder::Nobody)?;
                }
                Some((msg, span)) = self.rx_api.recv() => {
                    let _ent = span.enter();
                    self.handle_api_msg(msg)?;
                }
                Some(event) = self.rx_rpc_result.recv() => {
                    self.step(event, Responder::Nobody)?;
                }
                // A dropped sender means every `Raft` handle is gone.
                _ = &mut self.rx_shutdown => {
                    return Ok(());
                }
            }
        }
    }

    fn handle_api_msg(&mut self, msg: RaftMsg) -> RaftResult<()> {
        tracing::debug!(msg = %msg.summary(), "recv from rx_api");

        match msg {
            RaftMsg::Rpc { envelope, tx } => self.step(
                Event::RpcReceived {
                    from: envelope.from,
                    message: envelope.message,
                },
                Responder::Rpc(tx),
            ),
            RaftMsg::ClientWrite { command, tx } => self.step(Event::ClientWrite { command }, Responder::Client(tx)),
            RaftMsg::ChangeMembership { membership, tx } => {
                self.step(Event::ChangeMembership { membership }, Responder::Membership(tx))
            }
        }
    }

    /// Feed one event to the engine and execute what it asks for.
    ///
    /// The engine writes to its store synchronously. On a multi-thread runtime the worker is
    /// handed over to other tasks while it does; a current-thread runtime stalls for the duration
    /// of every fsync.
    fn step(&mut self, event: Event, responder: Responder) -> RaftResult<()> {
        let res = match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| self.engine.step(event)),
            _ => self.engine.step(event),
        };
        let commands = match res {
            Ok(commands) => commands,
            Err(err) => {
                responder.shutting_down();
                return Err(err);
            }
        };
        self.run_commands(commands, responder);
        self.report_metrics();
        Ok(())
    }

    fn run_commands(&mut self, commands: Vec<Command>, mut responder: Responder) {
        for cmd in commands {
            match cmd {
                Command::Send { target, message } => self.spawn_send(target, message),
                Command::Respond { message } => {
                    if let Responder::Rpc(tx) = std::mem::replace(&mut responder, Responder::Nobody) {
                        let _ = tx.send(Ok(message));
                    }
                }
                Command::ClientResponse(res) => {
                    if let Responder::Client(tx) = std::mem::replace(&mut responder, Responder::Nobody) {
                        let _ = tx.send(res);
                    }
                }
                Command::MembershipResponse(res) => {
                    if let Responder::Membership(tx) = std::mem::replace(&mut responder, Responder::Nobody) {
                        let _ = tx.send(res);
                    }
                }
                Command::InstallTimer(timer) => {
                    let after = match timer {
                        Timer::Election(d) | Timer::Heartbeat(d) => d,
                    };
                    self.timer = Some((Instant::now() + after, timer));
                }
            }
        }
    }

    /// Send a request in a task of its own and feed the outcome back as an `RpcResult`.
    ///
    /// The call is bounded by `rpc_timeout`; a timeout is reported like any other lost message.
    fn spawn_send(&self, target: NodeId, message: Message) {
        let addr = self.engine.membership().addr(&target).map(|a| a.to_string());
        let envelope = Envelope::new(self.engine.id().clone(), message.clone());
        let network = self.network.clone();
        let tx = self.tx_rpc_result.clone();
        let timeout = self.config.rpc_timeout();

        let span = tracing::debug_span!("send", %target, kind = message.kind_name());

        tokio::spawn(
            async move {
                let result = match addr {
                    None => Err(NetworkError::Unreachable(target.clone())),
                    Some(addr) => match tokio::time::timeout(timeout, network.send(&target, &addr, envelope)).await {
                        Ok(res) => res,
                        Err(_elapsed) => Err(NetworkError::Timeout(target.clone())),
                    },
                };
                if let Err(err) = &result {
                    tracing::debug!(error = %err, "rpc failed");
                }

                let _ = tx.send(Event::RpcResult {
                    target,
                    request: message,
                    result,
                });
            }
            .instrument(span),
        );
    }

    /// Report a metrics payload on the current state of the Raft node.
    fn report_metrics(&mut self) {
        let latest = self.engine.metrics();
        self.tx_metrics.send_if_modified(|m| {
            if *m == latest {
                return false;
            }
            *m = latest;
            true
        });
    }
}
