//! Plan list filter.

use super::{parse_filter, resolve_user_email};
use changeflow_db::{PlanFind, Store};
use changeflow_protocol::{ApiError, ApiResult, PlanState};
use changeflow_security::cel::BinaryOp;

pub async fn apply_plan_filter(store: &Store, filter: &str, find: &mut PlanFind) -> ApiResult<()> {
    for term in parse_filter(filter)? {
        match term.variable.as_str() {
            "creator" => find.creator = Some(resolve_user_email(store, term.string()?).await?),
            "has_rollout" => find.has_rollout = Some(term.bool()?),
            "state" => {
                let states = term.parsed::<PlanState>()?;
                let [state] = states.as_slice() else {
                    return Err(ApiError::invalid_argument("state expects a single value"));
                };
                find.state = Some(*state);
            }
            "create_time" => {
                let at = term.timestamp()?;
                if term.op == BinaryOp::Ge {
                    find.created_after = Some(at);
                } else {
                    find.created_before = Some(at);
                }
            }
            _ => return Err(term.unknown()),
        }
    }
    Ok(())
}
