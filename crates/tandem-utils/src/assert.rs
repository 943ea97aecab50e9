#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else {tracing::error!($($arg)*)})
}

/// In debug builds, panics on failure just like `debug_assert!`.
/// In release builds, logs an error via `tracing::error!` if the
/// condition is false.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr $(,)?) => {
        #[cfg(debug_assertions)]
        {
            debug_assert!($cond);
        }
        #[cfg(not(debug_assertions))]
        {
            if !$cond {
                tracing::error!("ASSERT FAILED: {}", stringify!($cond));
            }
        }
    };

    ($cond:expr, $($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            debug_assert!($cond, $($arg)+);
        }
        #[cfg(not(debug_assertions))]
        {
            if !$cond {
                let msg = format!($($arg)+);
                tracing::error!("ASSERT FAILED: {}", msg);
            }
        }
    };
}

/// A peer sent something the protocol does not allow in the current state.
/// Never tears the machine down: the violation is logged with its location
/// and the caller keeps the state live (resync covers the damage).
#[macro_export]
macro_rules! proto_violation {
    ($($arg:tt)*) => {
        tracing::error!("protocol violation at {}:{}: {}", file!(), line!(), format_args!($($arg)*))
    }
}
