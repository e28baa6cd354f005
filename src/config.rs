use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::framing::{
    DEFAULT_END_MARKER, DEFAULT_READY_MARKER, DEFAULT_SENTINEL, DEFAULT_START_MARKER, FramerConfig,
};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The wire-protocol driver shipped for the default Python profile.
pub(crate) const PYTHON_DRIVER: &str = include_str!("../python/driver.py");

/// Namespace-clearing snippet for `/clear` under the Python profile. Prints
/// how many names were deleted, then removes its own temporaries.
const PYTHON_CLEAR_CODE: &str = r#"_doomed = [name for name in list(globals()) if not name.startswith("__")]
print(len(_doomed))
for name in _doomed:
    del globals()[name]
if "_doomed" in globals():
    del globals()["_doomed"]
if "name" in globals():
    del globals()["name"]
"#;

/// Everything needed to launch and talk to one interpreter subprocess. All
/// fields are plain data; callers may adjust any of them before constructing
/// a `Session`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub ready_marker: String,
    pub start_marker: String,
    pub end_marker: String,
    pub sentinel: u8,
    /// Interpreter code that `/clear` executes to empty the user namespace.
    /// `/clear` reports itself unsupported when unset.
    pub clear_code: Option<String>,
    /// Explicit event-log directory; the env var is consulted when unset.
    pub debug_events_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            start_marker: DEFAULT_START_MARKER.to_string(),
            end_marker: DEFAULT_END_MARKER.to_string(),
            sentinel: DEFAULT_SENTINEL,
            clear_code: None,
            debug_events_dir: None,
        }
    }

    /// The default profile: a Python interpreter running the bundled wire
    /// driver. Marker configuration is passed to the driver via environment
    /// variables so both sides agree.
    pub fn python() -> Self {
        let mut config = Self::new(resolve_python_program());
        config.args = vec![
            "-u".to_string(),
            "-q".to_string(),
            "-c".to_string(),
            PYTHON_DRIVER.to_string(),
        ];
        config.envs = vec![
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ("PYTHON_BASIC_REPL".to_string(), "1".to_string()),
            (
                "REPL_BRIDGE_READY_MARKER".to_string(),
                config.ready_marker.clone(),
            ),
            (
                "REPL_BRIDGE_START_MARKER".to_string(),
                config.start_marker.clone(),
            ),
            (
                "REPL_BRIDGE_END_MARKER".to_string(),
                config.end_marker.clone(),
            ),
        ];
        config.clear_code = Some(PYTHON_CLEAR_CODE.to_string());
        config
    }

    pub(crate) fn framer(&self) -> FramerConfig {
        FramerConfig {
            ready_marker: self.ready_marker.clone(),
            start_marker: self.start_marker.clone(),
            end_marker: self.end_marker.clone(),
            sentinel: self.sentinel,
        }
    }
}

/// Prefer an active virtualenv's interpreter, then `python3` on PATH, then
/// `python`.
fn resolve_python_program() -> PathBuf {
    if let Some(venv) = std::env::var_os("VIRTUAL_ENV") {
        let candidate = Path::new(&venv).join(venv_python_relpath());
        if candidate.is_file() {
            return candidate;
        }
    }
    for name in ["python3", "python"] {
        if let Some(found) = find_on_path(name) {
            return found;
        }
    }
    PathBuf::from("python3")
}

fn venv_python_relpath() -> &'static str {
    if cfg!(target_family = "windows") {
        "Scripts/python.exe"
    } else {
        "bin/python"
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
