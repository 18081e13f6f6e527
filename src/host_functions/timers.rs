//! Timer host functions backing `setTimeout` and `clearTimeout`.

use super::HostResult;
use crate::context::{EngineContext, TimerId};
use std::time::Duration;

/// Longest delay accepted (about 24.8 days, the browser maximum)
pub const MAX_TIMER_DELAY_MS: f64 = 2_147_483_647.0;

/// Schedule a timer; the event loop fires it through `__bridge_fire_timer`
pub fn timer_start(ctx: &EngineContext, delay_ms: f64) -> HostResult<TimerId> {
    if delay_ms.is_nan() {
        anyhow::bail!("timer delay must be a number");
    }
    let delay = Duration::from_secs_f64(delay_ms.clamp(0.0, MAX_TIMER_DELAY_MS) / 1000.0);
    Ok(ctx.start_timer(delay))
}

/// Cancel a timer. Unknown ids are ignored.
pub fn timer_cancel(ctx: &EngineContext, id: f64) -> bool {
    if !(0.0..=f64::from(u32::MAX)).contains(&id) {
        return false;
    }
    ctx.cancel_timer(id as TimerId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_functions::test_support::engine;
    use std::time::Instant;

    #[test]
    fn test_timer_start_and_cancel() {
        let ctx = engine();
        let id = timer_start(&ctx, 50.0).unwrap();
        assert!(ctx.next_timer_deadline().is_some());
        assert!(timer_cancel(&ctx, f64::from(id)));
        assert!(!timer_cancel(&ctx, f64::from(id)));
        assert!(ctx.next_timer_deadline().is_none());
    }

    #[test]
    fn test_negative_delay_fires_immediately() {
        let ctx = engine();
        let id = timer_start(&ctx, -10.0).unwrap();
        assert_eq!(ctx.due_timers(Instant::now()), vec![id]);
    }

    #[test]
    fn test_bad_input() {
        let ctx = engine();
        assert!(timer_start(&ctx, f64::NAN).is_err());
        assert!(!timer_cancel(&ctx, -1.0));
    }
}
