use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

static TRACE_ENABLED: OnceLock<bool> = OnceLock::new();
static TRACE_EPOCH: OnceLock<Instant> = OnceLock::new();
static TRACE_FILE: OnceLock<Option<Mutex<std::fs::File>>> = OnceLock::new();
const TRACE_PATH_ENV: &str = "REPL_BRIDGE_DEBUG_FILE";
const TRACE_DEFAULT: &str = "repl-bridge-debug.log";

fn trace_enabled() -> bool {
    *TRACE_ENABLED.get_or_init(|| {
        let enabled = std::env::var("REPL_BRIDGE_DEBUG")
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        if enabled {
            return true;
        }
        std::env::var(TRACE_PATH_ENV)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    })
}

fn trace_epoch() -> Instant {
    *TRACE_EPOCH.get_or_init(Instant::now)
}

pub fn trace(message: impl AsRef<str>) {
    if !trace_enabled() {
        return;
    }
    let elapsed = trace_epoch().elapsed();
    let file = TRACE_FILE.get_or_init(|| {
        let path = std::env::var(TRACE_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| TRACE_DEFAULT.to_string());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(Mutex::new)
    });
    let Some(file) = file else {
        return;
    };
    if let Ok(mut guard) = file.lock() {
        let _ = writeln!(
            *guard,
            "[repl-bridge +{:>6}ms] {}",
            elapsed_ms(elapsed),
            message.as_ref()
        );
        let _ = guard.flush();
    }
}

pub fn elapsed_ms(duration: Duration) -> u128 {
    duration.as_millis()
}
