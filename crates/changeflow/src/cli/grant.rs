//! `changeflow grant` - activate and revoke access grants.

use super::output::{grant_status_color, print_json, print_table_colored};
use super::Env;
use anyhow::Result;
use changeflow::RequestContext;
use changeflow_protocol::AccessGrant;

fn print_grant(grant: &AccessGrant, json: bool) -> Result<()> {
    if json {
        return print_json(grant);
    }
    let expires = grant
        .expire_time
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    print_table_colored(
        &["NAME", "STATUS", "CREATOR", "TARGETS", "EXPIRES"],
        vec![vec![
            (grant.name().to_string(), None),
            (grant.status.to_string(), Some(grant_status_color(grant.status))),
            (grant.creator.clone(), None),
            (grant.payload.targets.join("\n"), None),
            (expires, None),
        ]],
    );
    Ok(())
}

pub async fn activate(env: &Env, ctx: &RequestContext, name: &str, json: bool) -> Result<()> {
    let grant = env.state.access_grants().activate_access_grant(ctx, name).await?;
    print_grant(&grant, json)
}

pub async fn revoke(env: &Env, ctx: &RequestContext, name: &str, json: bool) -> Result<()> {
    let grant = env.state.access_grants().revoke_access_grant(ctx, name).await?;
    print_grant(&grant, json)
}
