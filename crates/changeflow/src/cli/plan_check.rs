//! `changeflow plan-check` - plan-check run operations.

use super::output::{format_time, plan_check_status_color, print_json, print_table_colored};
use super::Env;
use anyhow::Result;
use changeflow::RequestContext;

pub async fn cancel(env: &Env, ctx: &RequestContext, name: &str, json: bool) -> Result<()> {
    let run = env.state.plans().cancel_plan_check_run(ctx, name).await?;
    if json {
        return print_json(&run);
    }
    print_table_colored(
        &["NAME", "STATUS", "ERROR", "UPDATED"],
        vec![vec![
            (run.name().to_string(), None),
            (run.status.to_string(), Some(plan_check_status_color(run.status))),
            (run.result.error.clone().unwrap_or_default(), None),
            (format_time(&run.updated_at), None),
        ]],
    );
    Ok(())
}
