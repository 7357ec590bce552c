use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::meta::resource_info::ResourceInfo;
use crate::provider::request::Request;
use crate::provider::transport::{issue, Transport};

/// Callbacks through which a resource takes part in failover. Resources register them with the
///  [crate::meta::resource_registry::ResourceRegistry] alongside their [ResourceInfo].
///
/// The sequence for a connection loss is `interrupted` (old transport is gone), `recovery`
///  (re-create on the new transport), `recovered` (re-start on the new transport, only for
///  resources that were started) and finally `restored`. Recovery and recovered are called in
///  registry replay order, i.e. parents before children.
#[async_trait]
pub trait RecoveryHooks: Send + Sync + 'static {
    fn on_connection_interrupted(&self) {}

    async fn on_connection_recovery(&self, transport: &dyn Transport, info: &Arc<ResourceInfo>, timeout: Option<Duration>) -> Result<(), ClientError> {
        issue(transport, Request::Create(info.clone()), timeout).await
    }

    async fn on_connection_recovered(&self, transport: &dyn Transport, info: &Arc<ResourceInfo>, timeout: Option<Duration>) -> Result<(), ClientError> {
        issue(transport, Request::Start(info.id()), timeout).await
    }

    fn on_connection_restored(&self) {}
}

/// for resources without local state that would need to take part in recovery
pub struct PlainRecovery;

impl RecoveryHooks for PlainRecovery {}
