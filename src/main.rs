//! ptylink - run a program inside a pseudoterminal
//!
//! The host terminal is switched to raw mode and wired to the child. Input
//! bytes are copied to the pty as they are (on Windows, console key events
//! are encoded first), pty output is copied to stdout untouched, and host
//! resizes are forwarded. ptylink exits with the child's exit code
//! (128 + signal when it was killed by a signal).
//!
//! # Quick Start
//!
//! ```text
//! ptylink bash                    # interactive shell
//! ptylink --cols 100 -- vim x.txt # fixed size, arguments after --
//! ptylink --legacy cmd.exe        # Windows: force the winpty agent
//! ```

#[cfg_attr(not(windows), allow(dead_code))]
mod keys;

use std::env;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crossterm::terminal;
use crossterm::tty::IsTty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptylink::{Config, ExitStatus, PtyConnection, PtyExited, PtyOptions, PtyProvider, PtyWriter};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for trailing output after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Command-line settings
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    app: String,
    args: Vec<String>,
    cols: Option<u16>,
    rows: Option<u16>,
    cwd: Option<String>,
    env: Vec<(String, String)>,
    legacy: bool,
    verbatim: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(CliArgs),
    Help,
    Version,
}

fn print_help() {
    eprintln!("ptylink {} - run a program inside a pseudoterminal", VERSION);
    eprintln!();
    eprintln!("Usage: ptylink [OPTIONS] <APP> [ARGS...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --cols <N>            Terminal width (default: host width)");
    eprintln!("  --rows <N>            Terminal height (default: host height)");
    eprintln!("  --cwd <DIR>           Working directory (default: current)");
    eprintln!("  -e, --env KEY=VALUE   Set a variable; KEY= removes it");
    eprintln!("  --legacy              Windows: use winpty instead of ConPTY");
    eprintln!("  --verbatim            Windows: pass arguments without quoting");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Arguments after the app, or after --, go to the app unchanged.");
    eprintln!();
    eprintln!("Configuration: ~/.ptylink/config.toml");
    eprintln!("Log file:      ~/.ptylink/ptylink.log (filter via PTYLINK_LOG)");
}

fn parse_size(flag: &str, value: Option<&String>) -> Result<u16, String> {
    let value = value.ok_or_else(|| format!("Missing value for {}", flag))?;
    match value.parse::<u16>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid value for {}: {}", flag, value)),
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut cli = CliArgs::default();
    let mut i = 0;

    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "--cols" => {
                i += 1;
                cli.cols = Some(parse_size(arg, args.get(i))?);
            }
            "--rows" => {
                i += 1;
                cli.rows = Some(parse_size(arg, args.get(i))?);
            }
            "--cwd" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing value for --cwd")?;
                cli.cwd = Some(dir.clone());
            }
            "-e" | "--env" => {
                i += 1;
                let pair = args.get(i).ok_or("Missing value for --env")?;
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("Expected KEY=VALUE, got {}", pair))?;
                cli.env.push((key.to_string(), value.to_string()));
            }
            "--legacy" => cli.legacy = true,
            "--verbatim" => cli.verbatim = true,
            "--" => {
                i += 1;
                break;
            }
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(format!("Unknown argument: {}. Use -h for help.", flag));
            }
            _ => break,
        }
        i += 1;
    }

    let mut rest = args[i.min(args.len())..].iter();
    cli.app = rest.next().ok_or("Missing program to run")?.clone();
    cli.args = rest.cloned().collect();
    Ok(Command::Run(cli))
}

/// Build launch options: config file first, command line on top
fn build_options(cli: &CliArgs, config: &Config, host_size: Option<(u16, u16)>) -> anyhow::Result<PtyOptions> {
    let cwd = match &cli.cwd {
        Some(dir) => dir.clone(),
        None => env::current_dir()?.to_string_lossy().into_owned(),
    };

    let mut options = config.options_for(&cli.app, &cli.args, &cwd);
    if let Some((cols, rows)) = host_size {
        options.cols = cols;
        options.rows = rows;
    }
    if let Some(cols) = cli.cols {
        options.cols = cols;
    }
    if let Some(rows) = cli.rows {
        options.rows = rows;
    }
    for (key, value) in &cli.env {
        options.environment.insert(key.clone(), value.clone());
    }
    options.force_legacy_agent |= cli.legacy;
    options.verbatim_command_line |= cli.verbatim;
    Ok(options)
}

/// Shell-style exit code for a termination record
fn exit_code(status: ExitStatus) -> i32 {
    if status.signal != 0 {
        128 + status.signal
    } else {
        status.code
    }
}

fn init_logging(config: &Config) {
    let Some(dir) = Config::data_dir() else {
        return;
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ptylink.log"))
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env("PTYLINK_LOG")
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(Command::Run(cli)) => cli,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            eprintln!("ptylink {}", VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(2);
        }
    };

    let config = Config::load();
    init_logging(&config);
    info!("ptylink {} starting", VERSION);

    let interactive = io::stdin().is_tty();
    let host_size = if interactive { terminal::size().ok() } else { None };
    let options = build_options(&cli, &config, host_size)?;

    let provider = PtyProvider::new();
    info!(platform = ?provider.platform(), app = %options.app, "spawning");
    let conn = match provider.spawn(&options) {
        Ok(conn) => conn,
        Err(e) => {
            error!("Failed to spawn: {}", e);
            eprintln!("ptylink: {}", e);
            std::process::exit(127);
        }
    };

    let code = run(conn, interactive)?;
    info!(code, "ptylink exiting");
    std::process::exit(code);
}

/// Relay between the host terminal and the child until it exits
fn run(mut conn: Box<dyn PtyConnection>, interactive: bool) -> anyhow::Result<i32> {
    let reader = conn.take_reader().ok_or_else(|| anyhow::anyhow!("pty reader already taken"))?;
    let writer = conn.take_writer().ok_or_else(|| anyhow::anyhow!("pty writer already taken"))?;
    let exit_rx = conn
        .take_exit_receiver()
        .ok_or_else(|| anyhow::anyhow!("exit receiver already taken"))?;

    let output_done = spawn_output_relay(reader);

    let status = if interactive {
        terminal::enable_raw_mode()?;
        let result = relay_terminal(conn.as_ref(), writer, &exit_rx);
        let _ = terminal::disable_raw_mode();
        result?
    } else {
        spawn_input_copy(writer);
        let _ = exit_rx.recv();
        conn.exit_status()
    };

    let _ = output_done.recv_timeout(DRAIN_TIMEOUT);
    conn.dispose();

    let status = status.unwrap_or_default();
    info!(code = status.code, signal = status.signal, "child finished");
    Ok(exit_code(status))
}

/// Copy pty output to stdout on a thread. The receiver fires when the
/// stream ends.
fn spawn_output_relay(mut reader: Box<dyn Read + Send>) -> mpsc::Receiver<()> {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stdout = io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).and_then(|_| stdout.flush()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // EIO on Linux once the child side is closed
                Err(_) => break,
            }
        }
        let _ = done_tx.send(());
    });
    done_rx
}

/// Copy stdin to the pty byte for byte
fn spawn_input_copy(mut writer: PtyWriter) {
    thread::spawn(move || {
        let mut stdin = io::stdin();
        if let Err(e) = io::copy(&mut stdin, &mut writer) {
            warn!("stdin relay stopped: {}", e);
        }
    });
}

/// Remembers the last host size and reports changes
#[derive(Debug)]
struct SizeTracker {
    last: Option<(u16, u16)>,
}

impl SizeTracker {
    fn new(initial: Option<(u16, u16)>) -> Self {
        Self { last: initial }
    }

    /// `Some(size)` when `size` differs from the last one seen
    fn update(&mut self, size: (u16, u16)) -> Option<(u16, u16)> {
        if size.0 == 0 || size.1 == 0 || self.last == Some(size) {
            return None;
        }
        self.last = Some(size);
        Some(size)
    }
}

fn forward_resize(conn: &dyn PtyConnection, tracker: &mut SizeTracker, size: (u16, u16)) {
    if let Some((cols, rows)) = tracker.update(size) {
        if let Err(e) = conn.resize(cols, rows) {
            warn!("resize to {}x{} failed: {}", cols, rows, e);
        }
    }
}

/// Raw stdin goes straight to the pty; the host size is sampled until the
/// child exits.
#[cfg(not(windows))]
fn relay_terminal(
    conn: &dyn PtyConnection,
    writer: PtyWriter,
    exit_rx: &mpsc::Receiver<PtyExited>,
) -> anyhow::Result<Option<ExitStatus>> {
    let poll_interval = Duration::from_millis(100);
    let mut sizes = SizeTracker::new(terminal::size().ok());
    spawn_input_copy(writer);

    loop {
        match exit_rx.recv_timeout(poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => return Ok(conn.exit_status()),
        }
        if let Ok(size) = terminal::size() {
            forward_resize(conn, &mut sizes, size);
        }
    }
}

/// The console hands out key events rather than bytes, so they are encoded
/// here before being written.
#[cfg(windows)]
fn relay_terminal(
    conn: &dyn PtyConnection,
    mut writer: PtyWriter,
    exit_rx: &mpsc::Receiver<PtyExited>,
) -> anyhow::Result<Option<ExitStatus>> {
    use crossterm::event::{self, Event, KeyEventKind};

    let poll_timeout = Duration::from_millis(10);
    let mut sizes = SizeTracker::new(terminal::size().ok());

    loop {
        if exit_rx.try_recv().is_ok() {
            return Ok(conn.exit_status());
        }

        if !event::poll(poll_timeout)? {
            continue;
        }
        match event::read()? {
            Event::Key(key_event) => {
                if key_event.kind == KeyEventKind::Release {
                    continue;
                }
                if let Some(bytes) = keys::encode(&key_event) {
                    if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                        warn!("write to pty failed: {}", e);
                    }
                }
            }
            Event::Paste(text) => {
                let _ = writer.write_all(text.as_bytes());
            }
            Event::Resize(cols, rows) => forward_resize(conn, &mut sizes, (cols, rows)),
            _ => {}
        }
    }
}
