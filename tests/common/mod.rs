#![allow(dead_code)]

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use repl_bridge::SessionConfig;

/// Echoes each request's `code` back as `stdout`, bracketed by markers.
pub const ECHO_SCRIPT: &str = r#"#!/bin/sh
echo '__REPL_BRIDGE_READY__'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  code=$(printf '%s' "$line" | sed -n 's/.*"code":"\([^"]*\)".*/\1/p')
  printf '<<<REPL_BRIDGE\n{"id":"%s","success":true,"stdout":"%s"}\nREPL_BRIDGE>>>\n' "$id" "$code"
done
"#;

/// Like ECHO_SCRIPT but terminates replies with the sentinel byte (octal
/// 036) instead of markers.
pub const SENTINEL_SCRIPT: &str = r#"#!/bin/sh
echo '__REPL_BRIDGE_READY__'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  code=$(printf '%s' "$line" | sed -n 's/.*"code":"\([^"]*\)".*/\1/p')
  printf '{"id":"%s","success":true,"stdout":"%s"}\036' "$id" "$code"
done
"#;

/// Appends every raw request line to the file named by $1, then echoes.
pub const RECORDER_SCRIPT: &str = r#"#!/bin/sh
RECORD="$1"
echo '__REPL_BRIDGE_READY__'
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$RECORD"
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  code=$(printf '%s' "$line" | sed -n 's/.*"code":"\([^"]*\)".*/\1/p')
  printf '<<<REPL_BRIDGE\n{"id":"%s","success":true,"stdout":"%s"}\nREPL_BRIDGE>>>\n' "$id" "$code"
done
"#;

/// Exits without replying when the request mentions `crash`.
pub const CRASHING_SCRIPT: &str = r#"#!/bin/sh
echo '__REPL_BRIDGE_READY__'
while IFS= read -r line; do
  case "$line" in
    *crash*) exit 1 ;;
  esac
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  code=$(printf '%s' "$line" | sed -n 's/.*"code":"\([^"]*\)".*/\1/p')
  printf '<<<REPL_BRIDGE\n{"id":"%s","success":true,"stdout":"%s"}\nREPL_BRIDGE>>>\n' "$id" "$code"
done
"#;

/// Announces readiness, then never replies to anything.
pub const SILENT_SCRIPT: &str = r#"#!/bin/sh
echo '__REPL_BRIDGE_READY__'
cat >/dev/null
"#;

/// Never prints the readiness marker.
pub const NEVER_READY_SCRIPT: &str = r#"#!/bin/sh
sleep 30
"#;

/// Emits a response nobody asked for before each real reply.
pub const ORPHAN_SCRIPT: &str = r#"#!/bin/sh
echo '__REPL_BRIDGE_READY__'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  code=$(printf '%s' "$line" | sed -n 's/.*"code":"\([^"]*\)".*/\1/p')
  printf '<<<REPL_BRIDGE\n{"id":"bogus-nobody-asked","success":true}\nREPL_BRIDGE>>>\n'
  printf '<<<REPL_BRIDGE\n{"id":"%s","success":true,"stdout":"%s"}\nREPL_BRIDGE>>>\n' "$id" "$code"
done
"#;

/// Replies with undecodable bytes inside the markers.
pub const MALFORMED_SCRIPT: &str = r#"#!/bin/sh
echo '__REPL_BRIDGE_READY__'
while IFS= read -r line; do
  printf '<<<REPL_BRIDGE\ngarbage that is not json\nREPL_BRIDGE>>>\n'
done
"#;

/// Writes `body` to a mock interpreter script under `dir` and returns a
/// config that launches it via `/bin/sh` with short test timeouts.
pub fn script_config(dir: &Path, body: &str) -> SessionConfig {
    script_config_with_args(dir, body, Vec::new())
}

pub fn script_config_with_args(dir: &Path, body: &str, extra_args: Vec<String>) -> SessionConfig {
    let path = dir.join("mock.sh");
    std::fs::write(&path, body).expect("write mock interpreter script");
    let mut config = SessionConfig::new("/bin/sh");
    config.args = vec![path.to_string_lossy().into_owned()];
    config.args.extend(extra_args);
    config.startup_timeout = Duration::from_secs(5);
    config.request_timeout = Duration::from_secs(5);
    config.shutdown_grace = Duration::from_millis(200);
    config
}

pub fn python_available() -> bool {
    for name in ["python3", "python"] {
        let status = Command::new(name)
            .arg("-c")
            .arg("import sys; sys.exit(0)")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if status.map(|status| status.success()).unwrap_or(false) {
            return true;
        }
    }
    false
}
