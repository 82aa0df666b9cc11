//! Structured logging utilities.
//!
//! Provides context-aware logging with agent, event, task and request ids
//! included in every log message.

use std::fmt;

/// Correlation context rendered as a prefix on each log line.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub agent_id: Option<String>,
    pub event_id: Option<String>,
    pub task: Option<String>,
    pub request_id: Option<String>,
}

impl LogContext {
    pub fn for_agent(agent_id: &str) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            ..Self::default()
        }
    }

    pub fn for_task(task: &str) -> Self {
        Self {
            task: Some(task.to_string()),
            ..Self::default()
        }
    }

    pub fn for_request(request_id: &str) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_event(&self, event_id: &str) -> Self {
        Self {
            event_id: Some(event_id.to_string()),
            ..self.clone()
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (label, value) in [
            ("agent", &self.agent_id),
            ("event", &self.event_id),
            ("task", &self.task),
            ("request", &self.request_id),
        ] {
            if let Some(value) = value {
                if wrote {
                    f.write_str(" ")?;
                }
                write!(f, "[{}={}]", label, value)?;
                wrote = true;
            }
        }
        if !wrote {
            f.write_str("[core]")?;
        }
        Ok(())
    }
}

/// Log an info message with context.
#[macro_export]
macro_rules! log_info {
    ($ctx:expr, $event:expr $(,)?) => {
        log::info!("{} {}", $ctx, $event);
    };
    ($ctx:expr, $event:expr, $($key:ident = $value:expr),+ $(,)?) => {
        log::info!(
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),+), $($value),+)
        );
    };
}

/// Log a warning message with context.
#[macro_export]
macro_rules! log_warn {
    ($ctx:expr, $event:expr $(,)?) => {
        log::warn!("{} {}", $ctx, $event);
    };
    ($ctx:expr, $event:expr, $($key:ident = $value:expr),+ $(,)?) => {
        log::warn!(
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),+), $($value),+)
        );
    };
}

/// Log an error message with context.
#[macro_export]
macro_rules! log_error {
    ($ctx:expr, $event:expr $(,)?) => {
        log::error!("{} {}", $ctx, $event);
    };
    ($ctx:expr, $event:expr, $($key:ident = $value:expr),+ $(,)?) => {
        log::error!(
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),+), $($value),+)
        );
    };
}

/// Log a debug message with context.
#[macro_export]
macro_rules! log_debug {
    ($ctx:expr, $event:expr $(,)?) => {
        log::debug!("{} {}", $ctx, $event);
    };
    ($ctx:expr, $event:expr, $($key:ident = $value:expr),+ $(,)?) => {
        log::debug!(
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),+), $($value),+)
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context_display() {
        let ctx = LogContext::for_agent("agent-ext-0123456789ab");
        assert_eq!(format!("{}", ctx), "[agent=agent-ext-0123456789ab]");

        let with_event = ctx.with_event("evt_42");
        assert_eq!(
            format!("{}", with_event),
            "[agent=agent-ext-0123456789ab] [event=evt_42]"
        );
    }

    #[test]
    fn test_task_and_empty_context() {
        assert_eq!(
            format!("{}", LogContext::for_task("hot_to_cold")),
            "[task=hot_to_cold]"
        );
        assert_eq!(format!("{}", LogContext::default()), "[core]");
    }

    #[test]
    fn test_macros_expand() {
        let ctx = LogContext::for_request("gdpr-1");
        crate::log_info!(ctx, "GDPR_TEST", count = 3, table = "event_logs");
        crate::log_debug!(ctx, "GDPR_TEST_DEBUG", ok = true);
    }
}
