//! Instance service.

use super::AppState;
use crate::context::RequestContext;
use crate::license::Feature;
use changeflow_ids::InstanceName;
use changeflow_protocol::{ApiError, ApiResult, DataSourceType, Instance};
use std::sync::Arc;
use tracing::info;

/// Hides stored secrets before an instance leaves the service.
fn redact(mut instance: Instance) -> Instance {
    for source in &mut instance.data_sources {
        source.password.clear();
    }
    instance
}

#[derive(Clone)]
pub struct InstanceService {
    state: Arc<AppState>,
}

impl InstanceService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    async fn instance(&self, name: &InstanceName) -> ApiResult<Instance> {
        self.state
            .store
            .get_instance(&name.instance)
            .await?
            .filter(|i| !i.deleted)
            .ok_or_else(|| ApiError::not_found(format!("instance {} not found", name)))
    }

    pub async fn create_instance(&self, ctx: &RequestContext, instance: &Instance) -> ApiResult<Instance> {
        let name = InstanceName::new(instance.id.clone());
        self.state
            .acl
            .authorize(ctx, "CreateInstance", name.to_string().as_str())
            .await?;
        let admins = instance
            .data_sources
            .iter()
            .filter(|ds| ds.source_type == DataSourceType::Admin)
            .count();
        if admins != 1 {
            return Err(ApiError::invalid_argument(format!(
                "instance {} must have exactly one admin data source",
                name
            )));
        }
        if instance.data_sources.iter().any(|ds| ds.external_secret.is_some()) {
            self.state.license.check(Feature::ExternalSecretManager)?;
        }
        if let Some(env) = &instance.environment {
            self.state
                .store
                .get_environment(env)
                .await?
                .ok_or_else(|| ApiError::not_found(format!("environment {} not found", env)))?;
        }
        let existing = self.state.store.list_instances().await?;
        self.state
            .license
            .check_instance_count(existing.iter().filter(|i| !i.deleted).count())?;

        ctx.check()?;
        self.state.store.create_instance(instance).await?;
        info!(instance = %instance.id, user = %ctx.email(), "Instance created");
        Ok(redact(self.instance(&name).await?))
    }

    pub async fn get_instance(&self, ctx: &RequestContext, name: &str) -> ApiResult<Instance> {
        self.state.acl.authorize(ctx, "GetInstance", name).await?;
        Ok(redact(self.instance(&InstanceName::parse(name)?).await?))
    }

    /// Asks the slow-query runner to sync the instance. Returns false when
    /// the request was dropped because the queue is full.
    pub async fn sync_slow_queries(&self, ctx: &RequestContext, name: &str) -> ApiResult<bool> {
        self.state.acl.authorize(ctx, "SyncSlowQueries", name).await?;
        let instance = self.instance(&InstanceName::parse(name)?).await?;
        if !instance.activation {
            return Err(ApiError::failed_precondition(format!(
                "instance {} is not activated",
                name
            )));
        }
        Ok(self.state.scheduler.request_slow_query_sync(instance.id))
    }
}
