//! Sliding-window rate limiting with a budget per request class.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::settings::{RateBudget, RateLimits};

use super::routes::RequestClass;

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
    budgets: RateLimits,
}

impl RateLimiter {
    pub fn new(budgets: RateLimits) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            budgets,
        }
    }

    fn budget(&self, class: RequestClass) -> RateBudget {
        match class {
            RequestClass::Auth => self.budgets.auth,
            RequestClass::Sensitive => self.budgets.sensitive,
            RequestClass::ApiGeneral => self.budgets.api_general,
        }
    }

    /// Records a hit for `key` in the class budget. `Err(retry_after_secs)`
    /// when the window is full.
    pub fn check(&self, class: RequestClass, key: &str) -> Result<(), u64> {
        let budget = self.budget(class);
        let window = Duration::from_secs(budget.window_secs);
        let now = Instant::now();

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let entries = windows
            .entry(format!("{}:{}", class.as_str(), key))
            .or_default();

        entries.retain(|ts| now.duration_since(*ts) < window);

        if entries.len() as u32 >= budget.max_requests {
            // Oldest entry leaving the window frees the next slot.
            let retry_after = entries
                .first()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)).as_secs())
                .unwrap_or(budget.window_secs);
            return Err(retry_after.max(1));
        }

        entries.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RateLimits;

    fn tiny_limits() -> RateLimits {
        RateLimits {
            auth: RateBudget {
                max_requests: 2,
                window_secs: 60,
            },
            sensitive: RateBudget {
                max_requests: 1,
                window_secs: 60,
            },
            api_general: RateBudget {
                max_requests: 100,
                window_secs: 60,
            },
        }
    }

    #[test]
    fn allows_under_budget() {
        let limiter = RateLimiter::new(tiny_limits());
        assert!(limiter.check(RequestClass::Auth, "u-1").is_ok());
        assert!(limiter.check(RequestClass::Auth, "u-1").is_ok());
    }

    #[test]
    fn rejects_over_budget_with_retry_after() {
        let limiter = RateLimiter::new(tiny_limits());
        assert!(limiter.check(RequestClass::Sensitive, "u-1").is_ok());
        let retry = limiter.check(RequestClass::Sensitive, "u-1").unwrap_err();
        assert!(retry >= 1 && retry <= 60);
    }

    #[test]
    fn classes_have_separate_budgets() {
        let limiter = RateLimiter::new(tiny_limits());
        assert!(limiter.check(RequestClass::Sensitive, "u-1").is_ok());
        // Same key, different class: unaffected.
        assert!(limiter.check(RequestClass::Auth, "u-1").is_ok());
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = RateLimiter::new(tiny_limits());
        assert!(limiter.check(RequestClass::Sensitive, "u-1").is_ok());
        assert!(limiter.check(RequestClass::Sensitive, "u-2").is_ok());
        assert!(limiter.check(RequestClass::Sensitive, "u-1").is_err());
    }
}
