mod relay_client;

use anyhow::{Context, Result};
use clap::Parser;
use spc_core::{AgentRegistry, StreamDecoder, DEFAULT_PORT};
use std::{
	fs::OpenOptions,
	io::{self, Write},
	path::PathBuf,
	process::ExitCode,
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::relay_client::{HttpIngress, RelayClient, RelayEndpoints, RetryPolicy, Route};

#[derive(Clone, Debug)]
struct Config {
	port: u16,
	mode: Mode,
	retry: RetryPolicy,
	debug: bool,
	log_dir: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Mode {
	Pipe { raw: bool },
	Filter,
	Send(String),
}

#[derive(Parser, Debug)]
#[command(name = "spc-bridge")]
struct Args {
	#[arg(long)]
	port: Option<u16>,
	/// Post this text once and exit.
	#[arg(long)]
	send: Option<String>,
	/// Decode stdin and print chat lines without contacting the relay.
	#[arg(long, default_value_t = false)]
	filter: bool,
	/// Stdin is plain text rather than NDJSON.
	#[arg(long, default_value_t = false)]
	raw: bool,
	#[arg(long, default_value_t = 5)]
	retries: u32,
	#[arg(long, default_value_t = 500)]
	retry_delay_ms: u64,
	#[arg(long, default_value_t = 2000)]
	connect_timeout_ms: u64,
	#[arg(long, default_value_t = false)]
	debug: bool,
	#[arg(long, default_value = "")]
	log_dir: String,
}

/// Counters for one pass over the input stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PumpReport {
	extracted: usize,
	delivered: usize,
	failed: usize,
	/// Stdout went away; the remaining input was not read.
	closed_output: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
	let config = load_config();
	let _log_guard = init_logging(&config);
	match run(config).await {
		Ok(code) => code,
		Err(err) => {
			error!(event = "bridge_error", error = %format!("{err:#}"));
			ExitCode::FAILURE
		}
	}
}

async fn run(config: Config) -> Result<ExitCode> {
	let decoder = StreamDecoder::from_registry(&AgentRegistry::default_team())
		.context("building chat line grammar")?;
	let endpoints = RelayEndpoints::for_port(config.port)?;

	match &config.mode {
		Mode::Send(text) => {
			let http = HttpIngress::new(endpoints.ingress, config.retry.connect_timeout)?;
			match http.post(text).await {
				Ok(count) => {
					info!(event = "sent", count = count);
					Ok(ExitCode::SUCCESS)
				}
				Err(err) => {
					error!(event = "send_failed", error = %err);
					Ok(ExitCode::FAILURE)
				}
			}
		}
		Mode::Filter => {
			let stdin = BufReader::new(tokio::io::stdin());
			let report = pump(stdin, tokio::io::stdout(), &decoder, false, None)
				.await
				.context("reading stdin")?;
			debug!(event = "filter_done", extracted = report.extracted);
			Ok(ExitCode::SUCCESS)
		}
		Mode::Pipe { raw } => {
			let mut client = RelayClient::connect(&endpoints, &config.retry).await?;
			let channel = client.has_channel();
			let stdin = BufReader::new(tokio::io::stdin());
			let report = pump(stdin, tokio::io::stdout(), &decoder, *raw, Some(&mut client))
				.await
				.context("reading stdin")?;
			client.close().await;
			info!(
				event = "pipe_done",
				channel = channel,
				extracted = report.extracted,
				delivered = report.delivered,
				failed = report.failed
			);
			if !report.closed_output && !channel && report.failed > 0 && report.delivered == 0 {
				error!(event = "relay_unreachable", port = config.port);
				return Ok(ExitCode::FAILURE);
			}
			Ok(ExitCode::SUCCESS)
		}
	}
}

fn extract_lines(decoder: &StreamDecoder, raw: bool, input: &str) -> Vec<String> {
	if raw {
		decoder.grammar().extract(input).map(str::to_string).collect()
	} else {
		decoder.decode_line(input)
	}
}

/// Read `reader` line by line, echo every chat line to `out`, and hand it
/// to `client` when there is one. Bytes that are not UTF-8 never end the
/// pass. Delivery failures are counted, never
/// returned; a closed `out` ends the pass early.
async fn pump<R, W>(
	reader: R,
	mut out: W,
	decoder: &StreamDecoder,
	raw: bool,
	mut client: Option<&mut RelayClient>,
) -> io::Result<PumpReport>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut reader = reader;
	let mut report = PumpReport::default();
	let mut buf = Vec::new();
	loop {
		buf.clear();
		if reader.read_until(b'\n', &mut buf).await? == 0 {
			break;
		}
		// Invalid UTF-8 is decoded lossily; whatever no longer parses is noise.
		let input = String::from_utf8_lossy(&buf);
		let input = input.trim_end_matches(['\n', '\r']);
		for line in extract_lines(decoder, raw, input) {
			report.extracted += 1;
			if let Err(err) = echo(&mut out, &line).await {
				if err.kind() == io::ErrorKind::BrokenPipe {
					report.closed_output = true;
					return Ok(report);
				}
				return Err(err);
			}
			let Some(client) = client.as_deref_mut() else {
				continue;
			};
			match client.deliver(&line).await {
				Ok(route) => {
					report.delivered += 1;
					if let Route::Http { count } = route {
						debug!(event = "delivered_http", count = count);
					}
				}
				Err(err) => {
					report.failed += 1;
					warn!(event = "delivery_failed", error = %err);
				}
			}
		}
	}
	Ok(report)
}

async fn echo<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> io::Result<()> {
	out.write_all(line.as_bytes()).await?;
	out.write_all(b"\n").await?;
	out.flush().await
}

fn load_config() -> Config {
	let args = Args::parse();
	config_from_args(args)
}

fn config_from_args(args: Args) -> Config {
	let port = resolve_port(args.port);
	let mode = match args.send {
		Some(text) => Mode::Send(text),
		None if args.filter => Mode::Filter,
		None => Mode::Pipe { raw: args.raw },
	};
	let retry = RetryPolicy {
		attempts: args.retries.max(1),
		delay: Duration::from_millis(args.retry_delay_ms),
		connect_timeout: Duration::from_millis(args.connect_timeout_ms.max(1)),
	};
	let debug = args.debug || env_true("SPC_HUB_DEBUG");
	let log_dir = resolve_log_dir(&args.log_dir);
	Config {
		port,
		mode,
		retry,
		debug,
		log_dir,
	}
}

fn init_logging(config: &Config) -> Option<LogGuard> {
	let level = if let Ok(level) = std::env::var("SPC_LOG_LEVEL") {
		level
	} else if config.debug {
		"debug".to_string()
	} else {
		"info".to_string()
	};

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	let writer = match open_log_file(&config.log_dir) {
		Ok(log_guard) => log_guard,
		Err(err) => {
			eprintln!("log_file_error: {err}");
			LogGuard { file: None }
		}
	};
	let file = writer.file.clone();
	let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
	let subscriber = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(make_writer)
		.finish();
	if tracing::subscriber::set_global_default(subscriber).is_err() {
		return None;
	}
	Some(writer)
}

struct LogGuard {
	file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Console side goes to stderr; stdout carries the echoed chat lines.
struct MultiWriter {
	stderr: io::Stderr,
	file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
	fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
		Self {
			stderr: io::stderr(),
			file,
		}
	}
}

impl Write for MultiWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let _ = self.stderr.write_all(buf);
		if let Some(file) = &self.file {
			let mut file = file.lock().unwrap();
			let _ = file.write_all(buf);
		}
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		let _ = self.stderr.flush();
		if let Some(file) = &self.file {
			let mut file = file.lock().unwrap();
			let _ = file.flush();
		}
		Ok(())
	}
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
	if log_dir.trim().is_empty() {
		return Ok(LogGuard { file: None });
	}
	let dir = PathBuf::from(log_dir);
	if std::fs::create_dir_all(&dir).is_err() {
		return Ok(LogGuard { file: None });
	}
	let file = OpenOptions::new()
		.create(true)
		.append(true)
		.open(dir.join("spc-bridge.log"))?;
	Ok(LogGuard {
		file: Some(Arc::new(Mutex::new(file))),
	})
}

fn env_true(key: &str) -> bool {
	match std::env::var(key) {
		Ok(value) => matches!(
			value.trim().to_lowercase().as_str(),
			"1" | "true" | "yes" | "on"
		),
		Err(_) => false,
	}
}

fn resolve_port(port_flag: Option<u16>) -> u16 {
	if let Some(port) = port_flag {
		return port;
	}
	std::env::var("SPC_CHAT_PORT")
		.ok()
		.and_then(|value| value.trim().parse::<u16>().ok())
		.unwrap_or(DEFAULT_PORT)
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
	if !log_dir_flag.trim().is_empty() {
		return log_dir_flag.to_string();
	}
	match std::env::var("SPC_LOG_DIR") {
		Ok(value) if !value.trim().is_empty() => value,
		_ => String::new(),
	}
}
