//! ---
//! deploy_section: "03-persistence-logging"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Structured logging adapters for deployment runs."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __deploy_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            run = ctx.run.unwrap_or(""),
            update = ctx.update.unwrap_or(""),
            component = ctx.component.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with deployment context.
#[macro_export]
macro_rules! deploy_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with deployment context.
#[macro_export]
macro_rules! deploy_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with deployment context.
#[macro_export]
macro_rules! deploy_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with deployment context.
#[macro_export]
macro_rules! deploy_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__deploy_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
