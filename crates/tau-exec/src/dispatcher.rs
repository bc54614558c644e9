//! Per-trigger mode selection: which runner to use and who answers the caller.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use crate::argument_resolver::{resolve_arguments, ArgumentResolver};
use crate::command_descriptor::{DeliveryMode, ProvisionedCommand};
use crate::exec_error::ExecError;
use crate::process_registry::ProcessRegistry;
use crate::process_runner::{run_collected, run_detached, run_streamed, RunRequest, RunScope};
use crate::response_encoder::{encode_collected, encode_detached, EncodedResponse};
use crate::stream_sink::{ChannelStreamSink, StreamEvent};

const STREAM_EVENT_BUFFER: usize = 64;

#[derive(Debug)]
/// What the host must do once a trigger has been dispatched.
pub enum Dispatch {
    /// Write this complete response; the continuation is not invoked.
    Respond(EncodedResponse),
    /// Forward these events as an event stream; the continuation is not invoked.
    Stream(StreamDelivery),
    /// Invoke the continuation exactly once; nothing has been written.
    Continue,
}

#[derive(Debug)]
/// Ordered events of one streamed run.
///
/// Dropping the delivery before `close` cancels the run, so a host only needs
/// to drop the response body when its client goes away.
pub struct StreamDelivery {
    events: mpsc::Receiver<StreamEvent>,
    _cancel_on_drop: DropGuard,
}

impl Stream for StreamDelivery {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

#[derive(Debug, Clone)]
/// Public struct `CommandDispatcher` used across Tau exec components.
pub struct CommandDispatcher {
    command: Arc<ProvisionedCommand>,
    registry: ProcessRegistry,
}

impl CommandDispatcher {
    pub fn new(command: ProvisionedCommand, registry: ProcessRegistry) -> Self {
        Self {
            command: Arc::new(command),
            registry,
        }
    }

    pub fn command(&self) -> &ProvisionedCommand {
        &self.command
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Cancellation scope for a new trigger, cancelled on registry shutdown.
    pub fn trigger_scope(&self) -> CancellationToken {
        self.registry.trigger_scope()
    }

    /// Resolves arguments once against this trigger, then runs the command in
    /// the configured delivery mode.
    pub async fn dispatch(
        &self,
        resolver: &dyn ArgumentResolver,
        trigger: CancellationToken,
    ) -> Dispatch {
        let request = self.run_request(resolver);
        let scope = RunScope::new(trigger, self.command.timeout())
            .with_handler(self.command.handler())
            .with_registry(self.registry.clone());

        match (self.command.delivery_mode(), self.command.pass_thru()) {
            (DeliveryMode::Streamed, _) => Dispatch::Stream(self.start_stream(request, scope)),
            (DeliveryMode::Collected, pass_thru) => {
                let run = run_collected(&request, &scope).await;
                self.log_outcome(&request, &run.outcome, pass_thru);
                if pass_thru {
                    Dispatch::Continue
                } else {
                    Dispatch::Respond(encode_collected(&run))
                }
            }
            (DeliveryMode::Detached, pass_thru) => {
                let outcome = run_detached(&request, &scope).await;
                self.log_outcome(&request, &outcome, pass_thru);
                if pass_thru {
                    Dispatch::Continue
                } else {
                    Dispatch::Respond(encode_detached(&outcome))
                }
            }
        }
    }

    fn run_request(&self, resolver: &dyn ArgumentResolver) -> RunRequest {
        let args = resolve_arguments(self.command.arg_templates(), resolver);
        RunRequest::new(self.command.program(), args).with_directory(self.command.directory())
    }

    fn start_stream(&self, request: RunRequest, scope: RunScope) -> StreamDelivery {
        let (sink, events) = ChannelStreamSink::channel(STREAM_EVENT_BUFFER);
        let cancel_on_drop = scope.cancellation().clone().drop_guard();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let outcome = run_streamed(&request, &scope, Arc::new(sink)).await;
            match RunEnding::classify(&outcome, registry.is_shutting_down()) {
                RunEnding::Finished => info!(
                    handler = scope.handler(),
                    program = %request.program,
                    "streamed command finished"
                ),
                RunEnding::ClientGone => warn!(
                    handler = scope.handler(),
                    program = %request.program,
                    "stream client went away; command terminated"
                ),
                RunEnding::HostShutdown => warn!(
                    handler = scope.handler(),
                    program = %request.program,
                    "streamed command terminated by shutdown"
                ),
                RunEnding::Failed => {
                    if let Err(failure) = &outcome {
                        error!(
                            handler = scope.handler(),
                            program = %request.program,
                            args = ?request.args,
                            kind = failure.kind().as_str(),
                            exit_code = failure.exit_code(),
                            error = %failure,
                            "streamed command failed"
                        );
                    }
                }
            }
        });
        StreamDelivery {
            events,
            _cancel_on_drop: cancel_on_drop,
        }
    }

    fn log_outcome(&self, request: &RunRequest, outcome: &Result<(), ExecError>, pass_thru: bool) {
        let Err(failure) = outcome else {
            info!(
                handler = self.command.handler(),
                program = %request.program,
                pass_thru,
                "command finished"
            );
            return;
        };
        if RunEnding::classify(outcome, self.registry.is_shutting_down())
            == RunEnding::HostShutdown
        {
            warn!(
                handler = self.command.handler(),
                program = %request.program,
                pass_thru,
                "command terminated by shutdown"
            );
            return;
        }
        error!(
            handler = self.command.handler(),
            program = %request.program,
            args = ?request.args,
            kind = failure.kind().as_str(),
            exit_code = failure.exit_code(),
            pass_thru,
            error = %failure,
            "command failed"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnding {
    Finished,
    ClientGone,
    HostShutdown,
    Failed,
}

impl RunEnding {
    /// A cancelled run is attributed to shutdown only while the registry is stopping.
    fn classify(outcome: &Result<(), ExecError>, shutting_down: bool) -> Self {
        match outcome {
            Ok(()) => Self::Finished,
            Err(ExecError::Transport) => Self::ClientGone,
            Err(ExecError::Cancelled) if shutting_down => Self::HostShutdown,
            Err(ExecError::Cancelled) => Self::ClientGone,
            Err(failure) if failure.is_cancellation() && shutting_down => Self::HostShutdown,
            Err(_) => Self::Failed,
        }
    }
}
