//! The asynchronous facade over the wireless-direct control channel.

use async_trait::async_trait;
use tracing::debug;

use relay_common::Channel;

use crate::group::Group;

/// Failure reasons reported by the control channel.
///
/// These are informational: coordination only distinguishes success from
/// failure, except for [`Busy`](Self::Busy) during removal, which is treated
/// as "assume the group is already gone". The `Display` text ends up in
/// user-visible warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlFailure {
    #[error("generic error")]
    Generic,
    #[error("wireless direct unsupported")]
    Unsupported,
    #[error("busy")]
    Busy,
    #[error("no service requests")]
    NoServiceRequests,
    #[error("unknown reason: {0}")]
    Unknown(i32),
}

/// The platform's wireless-direct service, seen from the relay.
///
/// Implementations wrap whatever the platform offers (a supplicant control
/// socket, a system service binding). Every operation is asynchronous and
/// reports a single success/failure outcome; group formation itself is
/// reported separately through the system event bus.
#[async_trait]
pub trait GroupBackend: Send + Sync + 'static {
    /// (Re)initializes the control channel.
    async fn open(&self) -> Result<(), ControlFailure>;

    /// Whether the control channel is currently usable.
    fn connected(&self) -> bool;

    /// Queries current group state, `None` when no group exists.
    async fn group_info(&self) -> Result<Option<Group>, ControlFailure>;

    /// Requests creation of a group with this device as owner.
    async fn create_group(&self) -> Result<(), ControlFailure>;

    /// Requests removal of the current group.
    async fn remove_group(&self) -> Result<(), ControlFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlRequest {
    QueryGroup,
    CreateGroup,
    RemoveGroup,
}

#[derive(Debug, Clone)]
pub(crate) enum ControlResponse {
    GroupInfo(Result<Option<Group>, ControlFailure>),
    Created(Result<(), ControlFailure>),
    Removed(Result<(), ControlFailure>),
}

/// Actor owning the control-channel backend.
///
/// Requests arrive over the channel from the coordination driver and are
/// served strictly one at a time, so responses come back in request order —
/// that ordering is what lets the driver treat control outcomes as plain
/// events. The channel is re-initialized lazily whenever it is found
/// disconnected immediately before an operation.
pub(crate) struct GroupController<B> {
    backend: B,
    channel: Channel<ControlResponse, ControlRequest>,
}

impl<B: GroupBackend> GroupController<B> {
    pub(crate) fn new(backend: B, channel: Channel<ControlResponse, ControlRequest>) -> Self {
        Self { backend, channel }
    }

    pub(crate) async fn run(mut self) {
        while let Some(request) = self.channel.recv().await {
            let response = self.execute(request).await;
            if self.channel.send(response).await.is_err() {
                break;
            }
        }
        debug!("driver gone, control actor exiting");
    }

    async fn execute(&mut self, request: ControlRequest) -> ControlResponse {
        if let Err(reason) = self.ensure_channel().await {
            return match request {
                ControlRequest::QueryGroup => ControlResponse::GroupInfo(Err(reason)),
                ControlRequest::CreateGroup => ControlResponse::Created(Err(reason)),
                ControlRequest::RemoveGroup => ControlResponse::Removed(Err(reason)),
            };
        }

        match request {
            ControlRequest::QueryGroup => {
                ControlResponse::GroupInfo(self.backend.group_info().await)
            }
            ControlRequest::CreateGroup => {
                ControlResponse::Created(self.backend.create_group().await)
            }
            ControlRequest::RemoveGroup => {
                ControlResponse::Removed(self.backend.remove_group().await)
            }
        }
    }

    async fn ensure_channel(&self) -> Result<(), ControlFailure> {
        if self.backend.connected() {
            return Ok(());
        }
        debug!("control channel disconnected, reinitializing");
        self.backend.open().await
    }
}
