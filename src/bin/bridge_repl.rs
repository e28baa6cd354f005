use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use repl_bridge::{ExecuteOutcome, Session, SessionConfig};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

struct CliOptions {
    program: Option<PathBuf>,
    args: Vec<String>,
    debug_events_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // A downstream reader closing its end would otherwise raise SIGPIPE and
    // terminate the process; surface broken-pipe errors normally instead.
    ignore_sigpipe();

    let options = parse_cli_args()?;
    let mut config = match &options.program {
        Some(program) => SessionConfig::new(program.clone()),
        None => SessionConfig::python(),
    };
    if options.program.is_some() {
        config.args = options.args.clone();
    }
    config.debug_events_dir = options.debug_events_dir;
    config.request_timeout = DEFAULT_REQUEST_TIMEOUT;

    eprintln!(
        "bridge-repl: program={} | end input with END | /help for session commands | Ctrl-D to exit",
        config.program.display()
    );

    let session = Session::new(config)?;
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let stdin = io::stdin();
    let mut stdin = stdin.lock();

    loop {
        let Some(line) = read_line(&mut stdin)? else {
            break;
        };
        let (chunk, done) = split_end_marker(&line);
        let mut input = chunk;
        if !done {
            loop {
                let Some(next) = read_line(&mut stdin)? else {
                    return Err("EOF reached while reading input; expected END".into());
                };
                let (chunk, done) = split_end_marker(&next);
                input.push_str(&chunk);
                if done {
                    break;
                }
            }
        }
        if input.trim().is_empty() {
            continue;
        }

        match session.execute(&input) {
            Ok(outcome) => render_outcome(outcome, &mut stdout, &mut stderr)?,
            Err(err) => writeln!(stderr, "[bridge-repl] error: {err}")?,
        }
    }

    Ok(())
}

fn render_outcome(
    outcome: ExecuteOutcome,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> io::Result<()> {
    if outcome.needs_more {
        writeln!(stderr, "[bridge-repl] incomplete input")?;
    }
    stdout.write_all(outcome.stdout.as_bytes())?;
    if !outcome.stdout.is_empty() && !outcome.stdout.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stderr.write_all(outcome.stderr.as_bytes())?;
    if let Some(error) = outcome.error {
        write!(stderr, "{error}")?;
        if !error.ends_with('\n') {
            stderr.write_all(b"\n")?;
        }
    }
    stdout.flush()?;
    stderr.flush()?;
    Ok(())
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// A line of exactly `END` (or a `...END` suffix) terminates multi-line
/// input, matching how code is pasted into the bridge.
fn split_end_marker(line: &str) -> (String, bool) {
    let body = line.trim_end_matches(['\n', '\r']);
    if let Some(prefix) = body.strip_suffix("END") {
        return (prefix.to_string(), true);
    }
    (line.to_string(), false)
}

fn parse_cli_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mut options = CliOptions {
        program: None,
        args: Vec::new(),
        debug_events_dir: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--program" => {
                let value = args.next().ok_or("missing value for --program")?;
                options.program = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--program=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --program".into());
                }
                options.program = Some(PathBuf::from(value));
            }
            "--arg" => {
                options.args.push(args.next().ok_or("missing value for --arg")?);
            }
            _ if arg.starts_with("--arg=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --arg".into());
                }
                options.args.push(value.to_string());
            }
            "--debug-events-dir" => {
                let value = args.next().ok_or("missing value for --debug-events-dir")?;
                options.debug_events_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--debug-events-dir=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                options.debug_events_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }
    Ok(options)
}

fn print_usage() {
    println!(
        "Usage:\n\
bridge-repl [--program <path>] [--arg <value>]... [--debug-events-dir <dir>]\n\n\
--program: interpreter executable implementing the session wire protocol (default: bundled Python driver)\n\
--arg: argument passed to the interpreter (repeatable; only with --program)\n\
--debug-events-dir: directory for per-startup JSONL debug event logs (env: REPL_BRIDGE_DEBUG_EVENTS_DIR)"
    );
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
